//! Policy hook: a seam for rejecting a step before it is enqueued.
//!
//! New module with no direct teacher equivalent; shaped as a small
//! object-safe `#[async_trait]` trait for consistency with
//! [`crate::gateway::RunnerGateway`] and [`crate::executor::AgentExecutor`].
//! The default implementation allows everything, matching the spec's
//! stated default.

use async_trait::async_trait;
use forge_db::models::WorkflowStep;

/// The verdict returned by a policy check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Authorizes (or rejects) a step immediately before it is claimed and
/// enqueued.
#[async_trait]
pub trait PolicyHook: Send + Sync {
    async fn authorize_step(&self, step: &WorkflowStep) -> PolicyDecision;
}

const _: () = {
    fn _assert_object_safe(_: &dyn PolicyHook) {}
};

/// Default policy: allow every step. This is the only policy wired into
/// `WorkflowRuntime` unless a caller supplies their own.
#[derive(Debug, Default)]
pub struct AllowAllPolicy;

#[async_trait]
impl PolicyHook for AllowAllPolicy {
    async fn authorize_step(&self, _step: &WorkflowStep) -> PolicyDecision {
        PolicyDecision::allow()
    }
}
