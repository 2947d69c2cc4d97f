//! Isolation sessions: per-step git worktree sandboxes.
//!
//! A session wraps one `WorktreeManager`-created worktree for the lifetime
//! of a single step's execution. `start` materialises the branch/worktree,
//! `commit`/`finish` stage and record the agent's changes, `push_branch`
//! publishes the branch to a remote, and `abort`/`cleanup` tear the session
//! down. This replaces the teacher's container-backed isolation mode, which
//! has no counterpart in this design -- every session is a git worktree.

use std::path::PathBuf;

use thiserror::Error;
use tracing::warn;

use crate::worktree::{WorktreeError, WorktreeManager};

/// Input used to derive a session's branch name.
#[derive(Debug, Clone)]
pub struct BranchInfo {
    pub workflow_id: String,
    pub step_id: String,
    pub base_branch: String,
}

impl BranchInfo {
    pub fn branch_name(&self) -> String {
        WorktreeManager::branch_name(&self.workflow_id, &self.step_id)
    }
}

/// Commit author identity, sourced from `WORKFLOW_AUTHOR_NAME`/
/// `WORKFLOW_AUTHOR_EMAIL`.
#[derive(Debug, Clone)]
pub struct Author {
    pub name: String,
    pub email: String,
}

/// The workspace handed back by [`IsolationSession::start`].
#[derive(Debug, Clone)]
pub struct Workspace {
    pub workspace_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
}

/// The result of a successful [`IsolationSession::commit`] or
/// [`IsolationSession::finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    pub commit_hash: String,
    pub branch_name: String,
}

/// Failure classes surfaced by isolation session operations.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("branch conflict: {0}")]
    BranchConflict(String),
    #[error("worktree busy: {0}")]
    WorktreeBusy(String),
    #[error("no remotes configured: {0}")]
    NoRemotes(String),
    #[error("push rejected: {0}")]
    PushRejected(String),
    #[error("unknown isolation failure: {0}")]
    Unknown(String),
}

impl From<WorktreeError> for IsolationError {
    fn from(e: WorktreeError) -> Self {
        match &e {
            WorktreeError::BranchMismatch { .. } => IsolationError::BranchConflict(e.to_string()),
            WorktreeError::NoRemotes(_) => IsolationError::NoRemotes(e.to_string()),
            WorktreeError::PushRejected { .. } => IsolationError::PushRejected(e.to_string()),
            WorktreeError::GitExit { stderr, .. }
                if stderr.contains("already exists") || stderr.contains("already checked out") =>
            {
                IsolationError::WorktreeBusy(e.to_string())
            }
            _ => IsolationError::Unknown(e.to_string()),
        }
    }
}

/// A single step's isolated git worktree, open for the duration of one
/// agent run.
pub struct IsolationSession {
    manager: WorktreeManager,
    workspace: Workspace,
}

impl IsolationSession {
    /// Create the worktree/branch for a step.
    ///
    /// Idempotent: re-starting a session whose branch/worktree already
    /// exists reattaches to it rather than failing, matching
    /// [`WorktreeManager::create_worktree`]'s own idempotency.
    pub fn start(
        manager: WorktreeManager,
        branch_info: &BranchInfo,
    ) -> Result<Self, IsolationError> {
        let branch_name = branch_info.branch_name();
        let info = manager.create_worktree(&branch_name)?;
        let workspace = Workspace {
            workspace_path: info.path,
            branch_name,
            base_branch: branch_info.base_branch.clone(),
        };
        Ok(Self { manager, workspace })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// The worktree manager backing this session, for callers that need
    /// to run further repo-level git operations (e.g. PR projection)
    /// through the same serialising git lock.
    pub fn manager(&self) -> &WorktreeManager {
        &self.manager
    }

    /// Stage and commit everything the agent produced so far without
    /// closing the session. Returns `None` if the worktree was clean.
    pub fn commit(
        &self,
        message: &str,
        author: &Author,
    ) -> Result<Option<CommitResult>, IsolationError> {
        let hash = self.manager.commit_all(
            &self.workspace.workspace_path,
            message,
            &author.name,
            &author.email,
        )?;
        Ok(hash.map(|commit_hash| CommitResult {
            commit_hash,
            branch_name: self.workspace.branch_name.clone(),
        }))
    }

    /// Commit any remaining changes as the last step of a run. Semantically
    /// identical to `commit`; kept distinct so callers can tell an
    /// in-progress checkpoint from the closing commit in logs/telemetry.
    pub fn finish(
        &self,
        message: &str,
        author: &Author,
    ) -> Result<Option<CommitResult>, IsolationError> {
        self.commit(message, author)
    }

    /// Abandon the session, leaving its branch intact for inspection.
    /// Identical to `cleanup`: removes the worktree only, never the
    /// branch. Never fails visibly -- a failed step is already being
    /// reported through its own error path, so a worktree-removal hiccup
    /// here is logged and swallowed rather than compounding it.
    pub fn abort(self) {
        if let Err(e) = self.manager.remove_worktree(&self.workspace.workspace_path) {
            warn!(branch = %self.workspace.branch_name, error = %e, "failed to remove worktree on abort");
        }
    }

    /// Remove the worktree but keep the branch, which may still be
    /// referenced by an open pull request.
    pub fn cleanup(self) -> Result<(), IsolationError> {
        self.manager
            .remove_worktree(&self.workspace.workspace_path)?;
        Ok(())
    }

    /// Push the session's branch to a remote.
    ///
    /// Tries, in order: `preferred_remote`, `"rad"`, `"origin"`, then
    /// whichever remote is configured first.
    pub fn push_branch(&self, preferred_remote: Option<&str>) -> Result<String, IsolationError> {
        Ok(self.manager.push_branch(
            &self.workspace.workspace_path,
            &self.workspace.branch_name,
            preferred_remote,
        )?)
    }
}
