//! Workflow runtime for multi-agent code-generation sessions: DAG
//! materialisation, the claim/lease protocol, the runner gateway, git
//! worktree isolation, PR projection, and provenance logging.
//!
//! `forge-db` owns the durable rows; this crate owns every state
//! transition applied to them.

pub mod error;
pub mod executor;
pub mod gateway;
pub mod isolation;
pub mod policy;
pub mod pr_projection;
pub mod provenance;
pub mod runtime;
pub mod token;
pub mod worktree;

pub use error::{Result, RuntimeError};
pub use executor::{AgentExecutor, ExecutorArgs, ExecutorOutcome, NoopExecutor};
pub use gateway::{backoff_ms, EnqueuePayload, GatewayError, ProcessGateway, RunnerGateway};
pub use isolation::{Author, BranchInfo, CommitResult, IsolationError, IsolationSession, Workspace};
pub use policy::{AllowAllPolicy, PolicyDecision, PolicyHook};
pub use pr_projection::OpenPullRequestParams;
pub use provenance::ProvenanceRecord;
pub use runtime::{PlannerRun, PlannerTask, RuntimeConfig, WorkflowDetail, WorkflowRuntime};
pub use forge_db::models::Project;
pub use worktree::{CommitInfo, MergeResult, WorktreeError, WorktreeInfo, WorktreeManager};
