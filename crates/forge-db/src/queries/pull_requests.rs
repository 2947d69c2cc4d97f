//! Query functions for `pull_requests`, `pull_request_commits`, and
//! `pull_request_events`: the PR projection built from a step's produced
//! commit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PullRequest, PullRequestCommit, PullRequestEvent, PullRequestEventKind, PullRequestStatus};

/// Open a new pull request, logging the corresponding `opened` event in the
/// same transaction so the audit trail never misses the creation.
pub async fn insert_pull_request(
    pool: &PgPool,
    project_id: Uuid,
    title: &str,
    description: Option<&str>,
    source_branch: &str,
    target_branch: &str,
    author_user_id: &str,
) -> Result<PullRequest> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin pull request transaction")?;

    let pr = sqlx::query_as::<_, PullRequest>(
        "INSERT INTO pull_requests \
         (project_id, title, description, source_branch, target_branch, status, author_user_id) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(project_id)
    .bind(title)
    .bind(description)
    .bind(source_branch)
    .bind(target_branch)
    .bind(PullRequestStatus::Open)
    .bind(author_user_id)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert pull request")?;

    sqlx::query(
        "INSERT INTO pull_request_events (pull_request_id, kind, actor, data) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(pr.id)
    .bind(PullRequestEventKind::Opened)
    .bind(author_user_id)
    .bind(Value::Null)
    .execute(&mut *tx)
    .await
    .context("failed to log pull request opened event")?;

    tx.commit()
        .await
        .context("failed to commit pull request transaction")?;

    Ok(pr)
}

pub async fn get_pull_request(pool: &PgPool, id: Uuid) -> Result<Option<PullRequest>> {
    let pr = sqlx::query_as::<_, PullRequest>("SELECT * FROM pull_requests WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch pull request")?;

    Ok(pr)
}

pub async fn list_pull_requests_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<PullRequest>> {
    let prs = sqlx::query_as::<_, PullRequest>(
        "SELECT * FROM pull_requests WHERE project_id = $1 ORDER BY created_at DESC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list pull requests for project")?;

    Ok(prs)
}

/// Attach a commit to a PR's commit list and log a `commit_added` event.
pub async fn add_pull_request_commit(
    pool: &PgPool,
    pull_request_id: Uuid,
    commit_hash: &str,
    author: Option<&str>,
    authored_at: DateTime<Utc>,
) -> Result<PullRequestCommit> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to begin commit-attach transaction")?;

    let commit = sqlx::query_as::<_, PullRequestCommit>(
        "INSERT INTO pull_request_commits (pull_request_id, commit_hash, author, authored_at) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(pull_request_id)
    .bind(commit_hash)
    .bind(author)
    .bind(authored_at)
    .fetch_one(&mut *tx)
    .await
    .context("failed to insert pull request commit")?;

    sqlx::query(
        "INSERT INTO pull_request_events (pull_request_id, kind, actor, data) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(pull_request_id)
    .bind(PullRequestEventKind::CommitAdded)
    .bind(author)
    .bind(serde_json::json!({ "commit_hash": commit_hash }))
    .execute(&mut *tx)
    .await
    .context("failed to log commit added event")?;

    tx.commit()
        .await
        .context("failed to commit commit-attach transaction")?;

    Ok(commit)
}

pub async fn list_pull_request_commits(pool: &PgPool, pull_request_id: Uuid) -> Result<Vec<PullRequestCommit>> {
    let commits = sqlx::query_as::<_, PullRequestCommit>(
        "SELECT * FROM pull_request_commits WHERE pull_request_id = $1 ORDER BY authored_at",
    )
    .bind(pull_request_id)
    .fetch_all(pool)
    .await
    .context("failed to list pull request commits")?;

    Ok(commits)
}

/// Append an audit-trail event without otherwise mutating the PR row.
pub async fn log_pull_request_event(
    pool: &PgPool,
    pull_request_id: Uuid,
    kind: PullRequestEventKind,
    actor: Option<&str>,
    data: Value,
) -> Result<PullRequestEvent> {
    let event = sqlx::query_as::<_, PullRequestEvent>(
        "INSERT INTO pull_request_events (pull_request_id, kind, actor, data) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(pull_request_id)
    .bind(kind)
    .bind(actor)
    .bind(data)
    .fetch_one(pool)
    .await
    .context("failed to log pull request event")?;

    Ok(event)
}

pub async fn list_pull_request_events(pool: &PgPool, pull_request_id: Uuid) -> Result<Vec<PullRequestEvent>> {
    let events = sqlx::query_as::<_, PullRequestEvent>(
        "SELECT * FROM pull_request_events WHERE pull_request_id = $1 ORDER BY created_at",
    )
    .bind(pull_request_id)
    .fetch_all(pool)
    .await
    .context("failed to list pull request events")?;

    Ok(events)
}

/// Transition a PR to `merged` or `closed`, logging the matching event.
pub async fn close_pull_request(
    pool: &PgPool,
    id: Uuid,
    status: PullRequestStatus,
    actor: Option<&str>,
) -> Result<bool> {
    let kind = match status {
        PullRequestStatus::Merged => PullRequestEventKind::Merged,
        PullRequestStatus::Closed => PullRequestEventKind::Closed,
        PullRequestStatus::Open => {
            anyhow::bail!("close_pull_request cannot transition to open");
        }
    };

    let mut tx = pool
        .begin()
        .await
        .context("failed to begin close-pull-request transaction")?;

    let rows = sqlx::query(
        "UPDATE pull_requests SET status = $1, updated_at = now() \
         WHERE id = $2 AND status = 'open'",
    )
    .bind(status)
    .bind(id)
    .execute(&mut *tx)
    .await
    .context("failed to update pull request status")?;

    if rows.rows_affected() == 1 {
        sqlx::query(
            "INSERT INTO pull_request_events (pull_request_id, kind, actor, data) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(id)
        .bind(kind)
        .bind(actor)
        .bind(Value::Null)
        .execute(&mut *tx)
        .await
        .context("failed to log pull request close event")?;
    }

    tx.commit()
        .await
        .context("failed to commit close-pull-request transaction")?;

    Ok(rows.rows_affected() == 1)
}
