//! Pull-request projection: turns a step-produced commit into a tracked
//! pull request row, and handles the subsequent merge/close lifecycle.
//!
//! No direct teacher equivalent; the query functions it drives
//! (`forge_db::queries::pull_requests`) already carry the transactional
//! "mutate + log an event" idiom used throughout that crate, so this
//! module is a thin caller that adds branch validation and commit-range
//! materialisation via [`crate::worktree::WorktreeManager`].

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use forge_db::models::{PullRequest, PullRequestCommit, PullRequestStatus};
use forge_db::queries::pull_requests;

use crate::worktree::WorktreeManager;

/// Input to opening a pull request, mirroring the callback execution
/// phase's step (h).
#[derive(Debug, Clone)]
pub struct OpenPullRequestParams {
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub author_user_id: String,
}

/// Validate both branches exist, insert the PR row, and materialise the
/// commit list between `target..source`.
pub async fn open_pull_request(
    pool: &PgPool,
    worktree: &WorktreeManager,
    params: OpenPullRequestParams,
) -> Result<(PullRequest, Vec<PullRequestCommit>)> {
    if !worktree
        .branch_exists(&params.source_branch)
        .context("failed to check source branch existence")?
    {
        bail!("source branch '{}' does not exist", params.source_branch);
    }
    if !worktree
        .branch_exists(&params.target_branch)
        .context("failed to check target branch existence")?
    {
        bail!("target branch '{}' does not exist", params.target_branch);
    }

    let pr = pull_requests::insert_pull_request(
        pool,
        params.project_id,
        &params.title,
        params.description.as_deref(),
        &params.source_branch,
        &params.target_branch,
        &params.author_user_id,
    )
    .await
    .context("failed to insert pull request row")?;

    let commits = worktree
        .list_commits_between(&params.target_branch, &params.source_branch)
        .context("failed to materialise commit range")?;

    let mut recorded = Vec::with_capacity(commits.len());
    for commit in commits {
        let authored_at = commit.authored_at.unwrap_or_else(chrono::Utc::now);
        let row = pull_requests::add_pull_request_commit(
            pool,
            pr.id,
            &commit.hash,
            commit.author.as_deref(),
            authored_at,
        )
        .await
        .context("failed to record pull request commit")?;
        recorded.push(row);
    }

    Ok((pr, recorded))
}

/// Merge a pull request: performs a VCS-level merge of `source` into
/// `target`, restoring whatever branch was previously checked out, then
/// records the outcome as a `merged` event (or leaves the PR untouched on
/// conflict, for the caller to surface).
pub async fn merge_pull_request(
    pool: &PgPool,
    worktree: &WorktreeManager,
    pull_request_id: Uuid,
    actor: Option<&str>,
) -> Result<bool> {
    let pr = pull_requests::get_pull_request(pool, pull_request_id)
        .await
        .context("failed to fetch pull request")?
        .context("pull request not found")?;

    if pr.status != PullRequestStatus::Open {
        bail!("pull request {pull_request_id} is not open");
    }

    let merge_result = worktree
        .merge_into(&pr.target_branch, &pr.source_branch)
        .context("failed to merge pull request branches")?;

    match merge_result {
        crate::worktree::MergeResult::Success => {
            let transitioned =
                pull_requests::close_pull_request(pool, pull_request_id, PullRequestStatus::Merged, actor)
                    .await
                    .context("failed to record pull request as merged")?;
            Ok(transitioned)
        }
        crate::worktree::MergeResult::Conflict { details } => {
            bail!("merge of pull request {pull_request_id} conflicted: {details}");
        }
    }
}

/// Close a pull request without merging it.
pub async fn close_pull_request(
    pool: &PgPool,
    pull_request_id: Uuid,
    actor: Option<&str>,
) -> Result<bool> {
    pull_requests::close_pull_request(pool, pull_request_id, PullRequestStatus::Closed, actor)
        .await
        .context("failed to close pull request")
}
