//! Query functions for `runner_events`: the append-only telemetry stream
//! for enqueue/execute/callback attempts. Writes here are best-effort; a
//! failure must never fail the step it describes.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{RunnerEvent, RunnerEventStatus};

/// Append a telemetry row. Callers should log and swallow errors from this
/// rather than propagate them into the execution path it is observing.
pub async fn insert_runner_event(
    pool: &PgPool,
    workflow_id: Uuid,
    step_id: &str,
    event_type: &str,
    status: RunnerEventStatus,
    runner_instance_id: Option<&str>,
    attempts: i32,
    latency_ms: Option<i64>,
    metadata: Option<Value>,
) -> Result<RunnerEvent> {
    let event = sqlx::query_as::<_, RunnerEvent>(
        "INSERT INTO runner_events \
         (workflow_id, step_id, event_type, status, runner_instance_id, attempts, latency_ms, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(step_id)
    .bind(event_type)
    .bind(status)
    .bind(runner_instance_id)
    .bind(attempts)
    .bind(latency_ms)
    .bind(metadata)
    .fetch_one(pool)
    .await
    .context("failed to insert runner event")?;

    Ok(event)
}

pub async fn list_runner_events_for_step(pool: &PgPool, step_id: &str) -> Result<Vec<RunnerEvent>> {
    let events = sqlx::query_as::<_, RunnerEvent>(
        "SELECT * FROM runner_events WHERE step_id = $1 ORDER BY created_at",
    )
    .bind(step_id)
    .fetch_all(pool)
    .await
    .context("failed to list runner events for step")?;

    Ok(events)
}

pub async fn list_runner_events_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<RunnerEvent>> {
    let events = sqlx::query_as::<_, RunnerEvent>(
        "SELECT * FROM runner_events WHERE workflow_id = $1 ORDER BY created_at",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list runner events for workflow")?;

    Ok(events)
}
