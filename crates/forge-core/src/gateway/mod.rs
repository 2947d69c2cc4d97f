//! Runner Gateway: the seam between a claimed step and an external sandbox.
//!
//! `Enqueue` is deliberately short and bounded -- it launches a sandbox
//! process (or dispatches to a remote runner fleet) and returns as soon as
//! the launch itself succeeds or fails. The actual step execution happens
//! later, out of process, when the sandbox calls back into
//! `WorkflowRuntime::run_step_by_id`. This mirrors the teacher's
//! `Harness`/`HarnessRegistry` object-safe adapter pattern, but the trait
//! shape is "fire and forget" rather than "spawn and stream events",
//! because ownership of the step's lifecycle passes out of this process
//! entirely once `enqueue` returns `Ok`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

/// Everything an external sandbox needs to run one step and call back.
#[derive(Debug, Clone)]
pub struct EnqueuePayload {
    pub workflow_id: Uuid,
    pub step_id: String,
    pub runner_instance_id: String,
    pub repo_path: String,
    pub callback_base_url: String,
    pub callback_token: String,
    pub agent_provider: Option<String>,
    pub agent_model: Option<String>,
    pub agent_max_rounds: Option<u32>,
    pub author_name: String,
    pub author_email: String,
    pub runner_mounts: Vec<String>,
}

impl EnqueuePayload {
    /// The environment variables a sandbox process is launched with, per
    /// the external-interfaces section of the spec.
    pub fn env_vars(&self) -> HashMap<String, String> {
        let mut env = HashMap::from([
            ("WORKFLOW_ID".to_string(), self.workflow_id.to_string()),
            ("WORKFLOW_STEP_ID".to_string(), self.step_id.clone()),
            (
                "WORKFLOW_RUNNER_ID".to_string(),
                self.runner_instance_id.clone(),
            ),
            ("WORKFLOW_REPO_PATH".to_string(), self.repo_path.clone()),
            (
                "WORKFLOW_CALLBACK_BASE_URL".to_string(),
                self.callback_base_url.clone(),
            ),
            (
                "WORKFLOW_CALLBACK_TOKEN".to_string(),
                self.callback_token.clone(),
            ),
            ("WORKFLOW_AUTHOR_NAME".to_string(), self.author_name.clone()),
            (
                "WORKFLOW_AUTHOR_EMAIL".to_string(),
                self.author_email.clone(),
            ),
        ]);
        if let Some(provider) = &self.agent_provider {
            env.insert("WORKFLOW_AGENT_PROVIDER".to_string(), provider.clone());
        }
        if let Some(model) = &self.agent_model {
            env.insert("WORKFLOW_AGENT_MODEL".to_string(), model.clone());
        }
        if let Some(rounds) = self.agent_max_rounds {
            env.insert(
                "WORKFLOW_AGENT_MAX_ROUNDS".to_string(),
                rounds.to_string(),
            );
        }
        if !self.runner_mounts.is_empty() {
            env.insert(
                "WORKFLOW_RUNNER_MOUNTS".to_string(),
                self.runner_mounts.join(","),
            );
        }
        env
    }
}

/// Errors from an enqueue attempt. The gateway distinguishes transient
/// failures (worth a bounded retry) from a rejection that should fail the
/// step immediately.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("sandbox launch timed out after {0:?}")]
    Timeout(Duration),

    #[error("sandbox launch failed: {0}")]
    LaunchFailed(String),

    #[error("sandbox launcher not available: {0}")]
    Unavailable(String),
}

/// Maximum time an `enqueue` call is allowed to block before the caller
/// treats it as failed and retries with backoff.
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_secs(900);

/// Launches an external sandbox to execute one step.
///
/// Object-safe so implementations can be stored as `Box<dyn RunnerGateway>`,
/// matching `Harness`'s object-safety discipline in the teacher.
#[async_trait]
pub trait RunnerGateway: Send + Sync {
    fn name(&self) -> &str;

    /// Launch a sandbox for `payload`. Must return within
    /// [`ENQUEUE_TIMEOUT`]; the caller enforces this with its own timeout
    /// wrapper so a hung launcher cannot stall the polling loop.
    async fn enqueue(&self, payload: &EnqueuePayload) -> Result<(), GatewayError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn RunnerGateway) {}
};

/// Default sandbox launcher: spawns a subprocess per step, in the style of
/// the teacher's `ClaudeCodeAdapter::spawn` (process spawn + piped I/O +
/// environment injection), but fire-and-forget rather than streamed --
/// `enqueue` returns once the process has successfully started, not once
/// it finishes.
#[derive(Debug, Clone)]
pub struct ProcessGateway {
    /// Path to the sandbox-launching binary/script. Defaults to
    /// `"forge-sandbox-run"`, resolved via `$PATH`.
    binary_path: String,
}

impl ProcessGateway {
    pub fn new() -> Self {
        Self {
            binary_path: "forge-sandbox-run".to_string(),
        }
    }

    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
        }
    }
}

impl Default for ProcessGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerGateway for ProcessGateway {
    fn name(&self) -> &str {
        "process"
    }

    async fn enqueue(&self, payload: &EnqueuePayload) -> Result<(), GatewayError> {
        let mut cmd = Command::new(&self.binary_path);
        for (key, value) in payload.env_vars() {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());

        let spawn_result = tokio::time::timeout(ENQUEUE_TIMEOUT, async { cmd.spawn() }).await;

        match spawn_result {
            Ok(Ok(mut child)) => {
                // Detach: we only care that it started, not that it finished.
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => debug!(?status, "sandbox process exited"),
                        Err(e) => warn!(error = %e, "error waiting on detached sandbox process"),
                    }
                });
                Ok(())
            }
            Ok(Err(e)) => Err(GatewayError::LaunchFailed(format!(
                "failed to spawn '{}': {e}",
                self.binary_path
            ))),
            Err(_) => Err(GatewayError::Timeout(ENQUEUE_TIMEOUT)),
        }
    }
}

/// Bounded exponential backoff with jitter for re-enqueue attempts.
///
/// `backoff(n) = min(2000 * 2^(n-1) * (0.5 + rand()), 60000)` milliseconds,
/// per the spec. `rand_factor` is injected so tests are deterministic;
/// production callers pass a fresh `rand::random::<f64>()` each call.
pub fn backoff_ms(attempt: u32, rand_factor: f64) -> u64 {
    debug_assert!((0.0..1.0).contains(&rand_factor));
    let attempt = attempt.max(1);
    let base = 2000f64 * 2f64.powi((attempt - 1) as i32);
    let jittered = base * (0.5 + rand_factor);
    jittered.min(60_000.0) as u64
}
