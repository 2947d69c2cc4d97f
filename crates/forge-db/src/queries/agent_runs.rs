//! Query functions for the `agent_runs` table: one row per execution
//! attempt of a step, never reused across retries.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentRun, AgentRunStatus};

/// Record the start of a new execution attempt.
pub async fn insert_agent_run(
    pool: &PgPool,
    step_id: &str,
    project_id: Uuid,
    branch: Option<&str>,
    agent_type: Option<&str>,
) -> Result<AgentRun> {
    let run = sqlx::query_as::<_, AgentRun>(
        "INSERT INTO agent_runs (step_id, project_id, branch, agent_type, status, started_at) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(step_id)
    .bind(project_id)
    .bind(branch)
    .bind(agent_type)
    .bind(AgentRunStatus::Running)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .context("failed to insert agent run")?;

    Ok(run)
}

pub async fn get_agent_run(pool: &PgPool, id: Uuid) -> Result<Option<AgentRun>> {
    let run = sqlx::query_as::<_, AgentRun>("SELECT * FROM agent_runs WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent run")?;

    Ok(run)
}

/// All attempts recorded for a step, oldest first.
pub async fn list_agent_runs_for_step(pool: &PgPool, step_id: &str) -> Result<Vec<AgentRun>> {
    let runs = sqlx::query_as::<_, AgentRun>(
        "SELECT * FROM agent_runs WHERE step_id = $1 ORDER BY started_at",
    )
    .bind(step_id)
    .fetch_all(pool)
    .await
    .context("failed to list agent runs for step")?;

    Ok(runs)
}

/// Record the outcome of an attempt, optionally attaching the path to its
/// captured logs.
pub async fn finish_agent_run(
    pool: &PgPool,
    id: Uuid,
    status: AgentRunStatus,
    logs_path: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agent_runs SET status = $1, logs_path = $2, finished_at = $3 WHERE id = $4",
    )
    .bind(status)
    .bind(logs_path)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finish agent run")?;

    Ok(result.rows_affected())
}
