//! Query functions for the `workflow_steps` table: DAG materialisation,
//! the claim (CAS) protocol, and ready-step selection.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{StepStatus, WorkflowStep};

/// One node of a DAG handed in for materialisation.
pub struct NewStep<'a> {
    pub task_id: &'a str,
    pub sequence: i32,
    pub depends_on: Vec<String>,
    pub data: Value,
}

/// Materialise every step of a planner DAG for a workflow in one
/// transaction, all starting in `pending`.
///
/// Step ids are `<workflow_id>:<task_id>`, giving global uniqueness without
/// a second index while keeping the planner's own task id visible.
pub async fn insert_steps(pool: &PgPool, workflow_id: Uuid, steps: &[NewStep<'_>]) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin step materialisation transaction")?;

    for step in steps {
        let id = format!("{workflow_id}:{}", step.task_id);
        sqlx::query(
            "INSERT INTO workflow_steps \
             (id, workflow_id, task_id, status, sequence, depends_on, data) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&id)
        .bind(workflow_id)
        .bind(step.task_id)
        .bind(StepStatus::Pending)
        .bind(step.sequence)
        .bind(&step.depends_on)
        .bind(&step.data)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to insert step {id}"))?;
    }

    tx.commit()
        .await
        .context("failed to commit step materialisation transaction")?;

    Ok(())
}

pub async fn get_step(pool: &PgPool, id: &str) -> Result<Option<WorkflowStep>> {
    let step = sqlx::query_as::<_, WorkflowStep>("SELECT * FROM workflow_steps WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow step")?;

    Ok(step)
}

pub async fn list_steps_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowStep>> {
    let steps = sqlx::query_as::<_, WorkflowStep>(
        "SELECT * FROM workflow_steps WHERE workflow_id = $1 ORDER BY sequence",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list steps for workflow")?;

    Ok(steps)
}

/// Steps whose dependencies are all in a terminal, non-failed status and
/// which are themselves still `pending`. The caller attempts to claim each
/// one with [`claim_step`]; losing the race to another poller is expected
/// and not an error.
pub async fn get_ready_steps(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<WorkflowStep>> {
    let steps = sqlx::query_as::<_, WorkflowStep>(
        "SELECT s.* FROM workflow_steps s \
         WHERE s.workflow_id = $1 \
           AND s.status = 'pending' \
           AND (s.ready_at IS NULL OR s.ready_at <= now()) \
           AND NOT EXISTS ( \
             SELECT 1 FROM workflow_steps dep \
             WHERE dep.workflow_id = s.workflow_id \
               AND dep.id = ANY(s.depends_on) \
               AND dep.status <> 'completed' \
           ) \
         ORDER BY s.sequence",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to select ready steps")?;

    Ok(steps)
}

/// Atomically transition a step from `pending` to `running`, recording the
/// runner instance that claimed it. Returns `true` if this caller won the
/// race; `false` means another poller (or a prior retry) claimed it first.
pub async fn claim_step(pool: &PgPool, id: &str, runner_instance_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE workflow_steps \
         SET status = 'running', \
             runner_instance_id = $1, \
             runner_attempts = runner_attempts + 1, \
             updated_at = now() \
         WHERE id = $2 AND status = 'pending'",
    )
    .bind(runner_instance_id)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to claim workflow step")?;

    Ok(result.rows_affected() == 1)
}

/// Release a claimed step back to `pending` so it can be retried by the
/// gateway's backoff loop, scheduling it not-before `ready_at`. Only
/// succeeds if the step is still `running` under the same runner instance
/// that claimed it.
pub async fn release_step_for_retry(
    pool: &PgPool,
    id: &str,
    runner_instance_id: &str,
    ready_at: DateTime<Utc>,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE workflow_steps \
         SET status = 'pending', runner_instance_id = NULL, ready_at = $1, updated_at = now() \
         WHERE id = $2 AND status = 'running' AND runner_instance_id = $3",
    )
    .bind(ready_at)
    .bind(id)
    .bind(runner_instance_id)
    .execute(pool)
    .await
    .context("failed to release workflow step")?;

    Ok(result.rows_affected() == 1)
}

/// Record the callback result for a step, transitioning it from `running`
/// to a terminal status. Returns `false` if the step was not `running`
/// under the given runner instance (a stale or duplicate callback).
pub async fn complete_step(
    pool: &PgPool,
    id: &str,
    runner_instance_id: &str,
    status: StepStatus,
    result: Value,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE workflow_steps \
         SET status = $1, result = $2, updated_at = now() \
         WHERE id = $3 AND status = 'running' AND runner_instance_id = $4",
    )
    .bind(status)
    .bind(result)
    .bind(id)
    .bind(runner_instance_id)
    .execute(pool)
    .await
    .context("failed to complete workflow step")?;

    Ok(rows.rows_affected() == 1)
}

/// Mark every `pending` step of a workflow as `skipped`, used when a
/// workflow is cancelled mid-flight. Cancellation is lazy: a step already
/// `running` keeps its lease and completes or aborts normally rather than
/// being force-skipped out from under its runner.
pub async fn skip_remaining_steps(pool: &PgPool, workflow_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflow_steps \
         SET status = 'skipped', runner_instance_id = NULL, updated_at = now() \
         WHERE workflow_id = $1 AND status = 'pending'",
    )
    .bind(workflow_id)
    .execute(pool)
    .await
    .context("failed to skip remaining steps")?;

    Ok(result.rows_affected())
}

/// Steps stuck `running` past a staleness threshold, reset to `pending` so
/// they are retried. Used by restart recovery, mirroring the orphan-reset
/// idiom used for crashed in-process workers.
pub async fn reset_stale_running_steps(
    pool: &PgPool,
    stale_after_minutes: i64,
) -> Result<Vec<WorkflowStep>> {
    let steps = sqlx::query_as::<_, WorkflowStep>(
        "UPDATE workflow_steps \
         SET status = 'pending', runner_instance_id = NULL, updated_at = now() \
         WHERE status = 'running' \
           AND updated_at < now() - ($1 || ' minutes')::interval \
         RETURNING *",
    )
    .bind(stale_after_minutes.to_string())
    .fetch_all(pool)
    .await
    .context("failed to reset stale running steps")?;

    Ok(steps)
}
