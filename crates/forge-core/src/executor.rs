//! The `AgentExecutor` seam: what runs *inside* the sandbox once a step has
//! been enqueued and its isolation session opened.
//!
//! The spec treats the executor as an external interface this crate does
//! not implement -- the sandbox process invokes whatever agent tooling it
//! wants and reports back through the callback. What this crate owns is
//! the trait boundary itself, so `run_step_by_id` can be written and
//! tested against it. The shape follows the teacher's `Harness` trait
//! (object-safe `#[async_trait]`, one method per lifecycle concern), but
//! collapsed to the single call the spec actually names.

use async_trait::async_trait;

/// Arguments passed to an `AgentExecutor` invocation.
#[derive(Debug, Clone)]
pub struct ExecutorArgs {
    pub workspace_path: std::path::PathBuf,
    pub step_data: serde_json::Value,
    pub agent_provider: Option<String>,
    pub agent_model: Option<String>,
    pub agent_max_rounds: Option<u32>,
}

/// What an executor reports back after a run.
#[derive(Debug, Clone, Default)]
pub struct ExecutorOutcome {
    pub step_result: Option<serde_json::Value>,
    pub logs_path: Option<String>,
    pub commit_message: Option<String>,
    pub skip_commit: bool,
}

/// Runs an agent against a materialised workspace and reports what it did.
///
/// Object-safe so the runtime can hold `Box<dyn AgentExecutor>` without a
/// generic parameter threading through every caller, matching `Harness`'s
/// object-safety discipline.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, args: &ExecutorArgs) -> anyhow::Result<ExecutorOutcome>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn AgentExecutor) {}
};

/// Trivial executor used in tests and as a placeholder before a real
/// provider is wired in. Mirrors `NoopHarness` in the teacher's harness
/// trait tests.
#[derive(Debug, Default)]
pub struct NoopExecutor;

#[async_trait]
impl AgentExecutor for NoopExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self, _args: &ExecutorArgs) -> anyhow::Result<ExecutorOutcome> {
        Ok(ExecutorOutcome::default())
    }
}
