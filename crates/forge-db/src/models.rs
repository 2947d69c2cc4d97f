use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal statuses are never revisited by reconciliation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = WorkflowStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(WorkflowStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkflowStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkflowStatusParseError(pub String);

impl fmt::Display for WorkflowStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid workflow status: {:?}", self.0)
    }
}

impl std::error::Error for WorkflowStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for StepStatus {
    type Err = StepStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(StepStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`StepStatus`] string.
#[derive(Debug, Clone)]
pub struct StepStatusParseError(pub String);

impl fmt::Display for StepStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid step status: {:?}", self.0)
    }
}

impl std::error::Error for StepStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of an agent run (one execution attempt of a step).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRunStatus {
    type Err = AgentRunStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(AgentRunStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentRunStatus`] string.
#[derive(Debug, Clone)]
pub struct AgentRunStatusParseError(pub String);

impl fmt::Display for AgentRunStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent run status: {:?}", self.0)
    }
}

impl std::error::Error for AgentRunStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Merged,
    Closed,
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for PullRequestStatus {
    type Err = PullRequestStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            other => Err(PullRequestStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PullRequestStatus`] string.
#[derive(Debug, Clone)]
pub struct PullRequestStatusParseError(pub String);

impl fmt::Display for PullRequestStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pull request status: {:?}", self.0)
    }
}

impl std::error::Error for PullRequestStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of pull-request event, the append-only audit trail entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PullRequestEventKind {
    Opened,
    Closed,
    Merged,
    CommitAdded,
    ReviewRequested,
    ReviewRunStarted,
    ReviewRunCompleted,
    CommentAdded,
    CommentResolved,
}

impl fmt::Display for PullRequestEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Merged => "merged",
            Self::CommitAdded => "commit_added",
            Self::ReviewRequested => "review_requested",
            Self::ReviewRunStarted => "review_run_started",
            Self::ReviewRunCompleted => "review_run_completed",
            Self::CommentAdded => "comment_added",
            Self::CommentResolved => "comment_resolved",
        };
        f.write_str(s)
    }
}

impl FromStr for PullRequestEventKind {
    type Err = PullRequestEventKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opened" => Ok(Self::Opened),
            "closed" => Ok(Self::Closed),
            "merged" => Ok(Self::Merged),
            "commit_added" => Ok(Self::CommitAdded),
            "review_requested" => Ok(Self::ReviewRequested),
            "review_run_started" => Ok(Self::ReviewRunStarted),
            "review_run_completed" => Ok(Self::ReviewRunCompleted),
            "comment_added" => Ok(Self::CommentAdded),
            "comment_resolved" => Ok(Self::CommentResolved),
            other => Err(PullRequestEventKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PullRequestEventKind`] string.
#[derive(Debug, Clone)]
pub struct PullRequestEventKindParseError(pub String);

impl fmt::Display for PullRequestEventKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid pull request event kind: {:?}", self.0)
    }
}

impl std::error::Error for PullRequestEventKindParseError {}

// ---------------------------------------------------------------------------

/// Status of a runner-event telemetry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunnerEventStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
    Completed,
}

impl fmt::Display for RunnerEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for RunnerEventStatus {
    type Err = RunnerEventStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            "completed" => Ok(Self::Completed),
            other => Err(RunnerEventStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RunnerEventStatus`] string.
#[derive(Debug, Clone)]
pub struct RunnerEventStatusParseError(pub String);

impl fmt::Display for RunnerEventStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid runner event status: {:?}", self.0)
    }
}

impl std::error::Error for RunnerEventStatusParseError {}

/// Well-known runner-event types. The column itself is free-form text (the
/// spec leaves the type set open-ended with "…"), so these are constants
/// rather than an exhaustive enum.
pub mod runner_event_type {
    pub const ENQUEUE: &str = "runner.enqueue";
    pub const EXECUTE: &str = "runner.execute";
    pub const CALLBACK: &str = "runner.callback";
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A registered repository. Created once; immutable thereafter except
/// descriptive fields.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub repo_path: String,
    pub default_branch: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persistent execution of a planner DAG for one project.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub project_id: Uuid,
    pub planner_run_id: String,
    pub kind: Option<String>,
    pub status: WorkflowStatus,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single node of the workflow DAG, executed at most once successfully.
///
/// `id` is formed as `<workflow_id>:<task_id>` when materialised from a
/// planner task, giving it global uniqueness without a second index.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowStep {
    pub id: String,
    pub workflow_id: Uuid,
    pub task_id: Option<String>,
    pub status: StepStatus,
    pub sequence: i32,
    pub depends_on: Vec<String>,
    pub data: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub runner_instance_id: Option<String>,
    pub runner_attempts: i32,
    pub ready_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One execution attempt of a step; not re-used across retries.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentRun {
    pub id: Uuid,
    pub step_id: String,
    pub project_id: Uuid,
    pub branch: Option<String>,
    pub agent_type: Option<String>,
    pub status: AgentRunStatus,
    pub logs_path: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A pull request derived from a step's produced commit.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PullRequest {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub source_branch: String,
    pub target_branch: String,
    pub external_patch_id: Option<String>,
    pub status: PullRequestStatus,
    pub author_user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A commit re-materialised from the VCS as part of a PR's commit list.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PullRequestCommit {
    pub id: Uuid,
    pub pull_request_id: Uuid,
    pub commit_hash: String,
    pub author: Option<String>,
    pub authored_at: DateTime<Utc>,
}

/// An append-only audit log entry for a pull request.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PullRequestEvent {
    pub id: Uuid,
    pub pull_request_id: Uuid,
    pub kind: PullRequestEventKind,
    pub actor: Option<String>,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// The terminal record of a step whose enqueue attempts were exhausted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunnerDeadLetter {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub last_runner_instance_id: Option<String>,
    pub total_attempts: i32,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only telemetry row for a single enqueue or execute attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunnerEvent {
    pub id: i64,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub event_type: String,
    pub status: RunnerEventStatus,
    pub runner_instance_id: Option<String>,
    pub attempts: i32,
    pub latency_ms: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_status_display_roundtrip() {
        let variants = [
            WorkflowStatus::Pending,
            WorkflowStatus::Running,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: WorkflowStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn workflow_status_invalid() {
        assert!("bogus".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn workflow_status_terminal_classification() {
        assert!(!WorkflowStatus::Pending.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
    }

    #[test]
    fn step_status_display_roundtrip() {
        let variants = [
            StepStatus::Pending,
            StepStatus::Running,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: StepStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn step_status_invalid() {
        assert!("nope".parse::<StepStatus>().is_err());
    }

    #[test]
    fn step_status_terminal_classification() {
        assert!(!StepStatus::Pending.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Failed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
    }

    #[test]
    fn agent_run_status_display_roundtrip() {
        let variants = [
            AgentRunStatus::Pending,
            AgentRunStatus::Running,
            AgentRunStatus::Succeeded,
            AgentRunStatus::Failed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: AgentRunStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn agent_run_status_invalid() {
        assert!("dunno".parse::<AgentRunStatus>().is_err());
    }

    #[test]
    fn pull_request_status_display_roundtrip() {
        let variants = [
            PullRequestStatus::Open,
            PullRequestStatus::Merged,
            PullRequestStatus::Closed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PullRequestStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn pull_request_status_invalid() {
        assert!("draft".parse::<PullRequestStatus>().is_err());
    }

    #[test]
    fn pull_request_event_kind_display_roundtrip() {
        let variants = [
            PullRequestEventKind::Opened,
            PullRequestEventKind::Closed,
            PullRequestEventKind::Merged,
            PullRequestEventKind::CommitAdded,
            PullRequestEventKind::ReviewRequested,
            PullRequestEventKind::ReviewRunStarted,
            PullRequestEventKind::ReviewRunCompleted,
            PullRequestEventKind::CommentAdded,
            PullRequestEventKind::CommentResolved,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: PullRequestEventKind = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn pull_request_event_kind_invalid() {
        assert!("frobnicated".parse::<PullRequestEventKind>().is_err());
    }

    #[test]
    fn runner_event_status_display_roundtrip() {
        let variants = [
            RunnerEventStatus::Started,
            RunnerEventStatus::Succeeded,
            RunnerEventStatus::Failed,
            RunnerEventStatus::Skipped,
            RunnerEventStatus::Completed,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: RunnerEventStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn runner_event_status_invalid() {
        assert!("almost".parse::<RunnerEventStatus>().is_err());
    }
}
