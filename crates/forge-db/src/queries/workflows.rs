//! Query functions for the `workflows` table.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Workflow, WorkflowStatus};

/// Persist a freshly materialised workflow in `pending` status.
pub async fn insert_workflow(
    pool: &PgPool,
    project_id: Uuid,
    planner_run_id: &str,
    kind: Option<&str>,
    data: Value,
) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (project_id, planner_run_id, kind, status, data) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(planner_run_id)
    .bind(kind)
    .bind(WorkflowStatus::Pending)
    .bind(data)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// Every workflow currently `running`, across all projects -- the polling
/// loop's root set for selecting ready steps.
pub async fn list_running_workflows(pool: &PgPool) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE status = 'running' ORDER BY created_at",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running workflows")?;

    Ok(workflows)
}

/// List every workflow for a project, most recently created first.
pub async fn list_workflows_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE project_id = $1 ORDER BY created_at DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflows for project")?;

    Ok(workflows)
}

/// Unconditionally move a workflow to a new status. Used for operator
/// actions (pause/cancel) and reconciliation, which do not race with a
/// runner callback on the *workflow* row (only steps are contended).
pub async fn set_workflow_status(pool: &PgPool, id: Uuid, status: WorkflowStatus) -> Result<u64> {
    let result = sqlx::query("UPDATE workflows SET status = $1, updated_at = now() WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set workflow status")?;

    Ok(result.rows_affected())
}

/// Per-status step counts for one workflow, used to decide whether a
/// workflow has reached a terminal state.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkflowProgress {
    pub status: String,
    pub count: i64,
}

pub async fn get_workflow_progress(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowProgress>> {
    let rows = sqlx::query_as::<_, WorkflowProgress>(
        "SELECT status::text AS status, COUNT(*) AS count \
         FROM workflow_steps \
         WHERE workflow_id = $1 \
         GROUP BY status",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to compute workflow progress")?;

    Ok(rows)
}

/// True once every step of the workflow has reached a terminal status.
pub async fn is_workflow_complete(pool: &PgPool, workflow_id: Uuid) -> Result<bool> {
    let remaining: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_steps \
         WHERE workflow_id = $1 AND status IN ('pending', 'running')",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check workflow completeness")?;

    Ok(remaining == 0)
}

/// True if any step of the workflow ended in `failed`.
pub async fn has_failed_step(pool: &PgPool, workflow_id: Uuid) -> Result<bool> {
    let failed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_steps WHERE workflow_id = $1 AND status = 'failed'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check for failed steps")?;

    Ok(failed > 0)
}

/// Queue depth metrics surfaced by `GET /workflows/{id}/queue-metrics`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub pending: i64,
    pub running: i64,
    pub stuck: i64,
}

pub async fn get_queue_metrics(pool: &PgPool, workflow_id: Uuid) -> Result<QueueMetrics> {
    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_steps WHERE workflow_id = $1 AND status = 'pending'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to count pending steps")?;

    let running: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_steps WHERE workflow_id = $1 AND status = 'running'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to count running steps")?;

    let stuck: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM workflow_steps \
         WHERE workflow_id = $1 AND status = 'running' \
           AND updated_at < now() - interval '15 minutes'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to count stuck steps")?;

    Ok(QueueMetrics { pending, running, stuck })
}
