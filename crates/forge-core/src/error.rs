//! The workflow runtime's error taxonomy.
//!
//! One enum covers every public entry point (`WorkflowRuntime`'s methods);
//! callers match on variants rather than string-sniffing `anyhow` chains,
//! mirroring the teacher's preference for `thiserror` at library seams and
//! `anyhow` only inside implementation bodies.

use uuid::Uuid;

use crate::isolation::IsolationError;

/// Errors surfaced by the workflow runtime's public contract.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("unknown project: {0}")]
    UnknownProject(Uuid),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(Uuid),

    #[error("unknown step: {0}")]
    UnknownStep(String),

    #[error("step {step_id} belongs to workflow {expected}, not {actual}")]
    WrongWorkflow {
        step_id: String,
        expected: Uuid,
        actual: Uuid,
    },

    #[error("step {0} is not running")]
    StepNotRunning(String),

    #[error("step {0} has no active lease")]
    NoLease(String),

    #[error("lease mismatch for step {step_id}: expected runner {expected}, got {actual}")]
    LeaseMismatch {
        step_id: String,
        expected: String,
        actual: String,
    },

    #[error("failed to enqueue step {step_id}: {source}")]
    EnqueueFailure {
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("step {step_id} was rejected by policy: {reason}")]
    PolicyRejected { step_id: String, reason: String },

    #[error("executor failed for step {step_id}: {source}")]
    ExecutorFailure {
        step_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("isolation session failed for step {step_id}: {source}")]
    SessionFailure {
        step_id: String,
        #[source]
        source: IsolationError,
    },

    #[error("durable store I/O failure: {0}")]
    StoreIoFailure(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
