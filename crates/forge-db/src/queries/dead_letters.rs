//! Query functions for `runner_dead_letters`: the terminal record of a
//! step whose enqueue retries were exhausted.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::RunnerDeadLetter;

pub async fn insert_dead_letter(
    pool: &PgPool,
    workflow_id: Uuid,
    step_id: &str,
    last_runner_instance_id: Option<&str>,
    total_attempts: i32,
    error: &str,
) -> Result<RunnerDeadLetter> {
    let dead_letter = sqlx::query_as::<_, RunnerDeadLetter>(
        "INSERT INTO runner_dead_letters \
         (workflow_id, step_id, last_runner_instance_id, total_attempts, error) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(step_id)
    .bind(last_runner_instance_id)
    .bind(total_attempts)
    .bind(error)
    .fetch_one(pool)
    .await
    .context("failed to insert runner dead letter")?;

    Ok(dead_letter)
}

pub async fn list_dead_letters_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<RunnerDeadLetter>> {
    let dead_letters = sqlx::query_as::<_, RunnerDeadLetter>(
        "SELECT * FROM runner_dead_letters WHERE workflow_id = $1 ORDER BY created_at",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list dead letters for workflow")?;

    Ok(dead_letters)
}
