//! `WorkflowRuntime`: the central orchestrator tying together DAG
//! materialisation, the claim protocol, the runner gateway, isolation
//! sessions, the agent executor, PR projection, and provenance.
//!
//! The polling loop follows the teacher's `orchestrator` module in shape
//! (a single cooperative tick, sleep, repeat, stop-flag observed between
//! ticks) but claim+dispatch is now claim-then-enqueue-only: the actual
//! step execution happens out of process and returns later through
//! [`WorkflowRuntime::run_step_by_id`], not inline inside the loop.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::random;
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use forge_db::models::{
    AgentRunStatus, Project, RunnerEventStatus, StepStatus, Workflow, WorkflowStatus, WorkflowStep,
    runner_event_type,
};
use forge_db::queries::{agent_runs, dead_letters, projects, runner_events, steps, workflows};

use crate::error::{Result, RuntimeError};
use crate::executor::{AgentExecutor, ExecutorArgs};
use crate::gateway::{backoff_ms, EnqueuePayload, RunnerGateway};
use crate::isolation::{Author, BranchInfo, IsolationError, IsolationSession};
use crate::policy::PolicyHook;
use crate::pr_projection::{self, OpenPullRequestParams};
use crate::provenance::{self, ProvenanceRecord};
use crate::token::{self, TokenConfig};
use crate::worktree::WorktreeManager;

/// One task of a planner run, as handed to `CreateWorkflowFromPlan`.
#[derive(Debug, Clone)]
pub struct PlannerTask {
    pub id: String,
    pub title: String,
    pub instructions: String,
    pub depends_on: Vec<String>,
    pub metadata: Option<Value>,
}

/// A full planner run: the DAG of tasks to materialise as one workflow.
#[derive(Debug, Clone, Default)]
pub struct PlannerRun {
    pub tasks: Vec<PlannerTask>,
}

/// Validate a planner run: task ids unique, every `depends_on` id present,
/// and the dependency graph acyclic. Mirrors the Kahn's-algorithm
/// validation used for plan TOML in `crate::plan::parser`.
fn validate_planner_run(run: &PlannerRun) -> std::result::Result<(), String> {
    if run.tasks.is_empty() {
        return Err("planner run must contain at least one task".to_string());
    }

    let mut seen = HashSet::new();
    for task in &run.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(format!("duplicate task id: {:?}", task.id));
        }
    }

    for task in &run.tasks {
        for dep in &task.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(format!(
                    "task {:?} depends on unknown task {:?}",
                    task.id, dep
                ));
            }
        }
    }

    let idx: HashMap<&str, usize> = run
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.id.as_str(), i))
        .collect();

    let n = run.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];
    for task in &run.tasks {
        let task_idx = idx[task.id.as_str()];
        for dep in &task.depends_on {
            let dep_idx = idx[dep.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut visited = 0usize;
    while let Some(node) = queue.pop_front() {
        visited += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if visited != n {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d > 0)
            .map(|(i, _)| run.tasks[i].id.as_str())
            .collect();
        return Err(format!(
            "dependency cycle detected involving tasks: {}",
            cyclic.join(", ")
        ));
    }

    Ok(())
}

/// Everything `GetWorkflowDetail` returns.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkflowDetail {
    pub workflow: Workflow,
    pub steps: Vec<WorkflowStep>,
    pub agent_runs: Vec<forge_db::models::AgentRun>,
}

/// Tunables for the runtime: polling cadence, retry budget, and the
/// identity/credentials handed to enqueued sandboxes.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub poll_interval: Duration,
    pub claim_limit: usize,
    pub max_attempts: u32,
    pub callback_base_url: String,
    pub token_config: TokenConfig,
    pub author_name: String,
    pub author_email: String,
    pub default_agent_provider: Option<String>,
    pub default_agent_model: Option<String>,
    pub default_agent_max_rounds: Option<u32>,
    pub runner_mounts: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            claim_limit: 20,
            max_attempts: 5,
            callback_base_url: "http://localhost:8080".to_string(),
            token_config: TokenConfig::new(b"dev-only-secret".to_vec()),
            author_name: "Forge Bot".to_string(),
            author_email: "forge@example.com".to_string(),
            default_agent_provider: None,
            default_agent_model: None,
            default_agent_max_rounds: None,
            runner_mounts: Vec::new(),
        }
    }
}

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// The workflow runtime. Cheaply cloneable (every field is an `Arc` or a
/// `PgPool`, which is itself a pool handle), so it can be shared between
/// the polling loop and the HTTP callback handler.
#[derive(Clone)]
pub struct WorkflowRuntime {
    pool: PgPool,
    gateway: Arc<dyn RunnerGateway>,
    executor: Arc<dyn AgentExecutor>,
    policy: Arc<dyn PolicyHook>,
    config: RuntimeConfig,
    worker: Arc<AsyncMutex<Option<WorkerHandle>>>,
}

impl WorkflowRuntime {
    pub fn new(
        pool: PgPool,
        gateway: Arc<dyn RunnerGateway>,
        executor: Arc<dyn AgentExecutor>,
        policy: Arc<dyn PolicyHook>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            pool,
            gateway,
            executor,
            policy,
            config,
            worker: Arc::new(AsyncMutex::new(None)),
        }
    }

    // -- Project registry ---------------------------------------------

    pub async fn create_project(&self, name: &str, repo_path: &str, default_branch: &str) -> Result<Project> {
        projects::insert_project(&self.pool, name, repo_path, default_branch)
            .await
            .map_err(RuntimeError::StoreIoFailure)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project> {
        projects::get_project(&self.pool, id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownProject(id))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        projects::list_projects(&self.pool)
            .await
            .map_err(RuntimeError::StoreIoFailure)
    }

    // -- Public contract: plan materialisation & workflow lifecycle -----

    pub async fn create_workflow_from_plan(
        &self,
        project_id: Uuid,
        planner_run_id: &str,
        kind: Option<&str>,
        run: PlannerRun,
    ) -> Result<Workflow> {
        projects::get_project(&self.pool, project_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownProject(project_id))?;

        validate_planner_run(&run).map_err(RuntimeError::InvalidPlan)?;

        let workflow = workflows::insert_workflow(&self.pool, project_id, planner_run_id, kind, json!({}))
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        let new_steps: Vec<steps::NewStep> = run
            .tasks
            .iter()
            .enumerate()
            .map(|(sequence, task)| steps::NewStep {
                task_id: &task.id,
                sequence: sequence as i32,
                depends_on: task
                    .depends_on
                    .iter()
                    .map(|d| format!("{}:{d}", workflow.id))
                    .collect(),
                data: json!({
                    "title": task.title,
                    "instructions": task.instructions,
                    "metadata": task.metadata,
                }),
            })
            .collect();

        steps::insert_steps(&self.pool, workflow.id, &new_steps)
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        Ok(workflow)
    }

    async fn transition_workflow(&self, id: Uuid, status: WorkflowStatus) -> Result<Workflow> {
        workflows::get_workflow(&self.pool, id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownWorkflow(id))?;

        workflows::set_workflow_status(&self.pool, id, status)
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        if status == WorkflowStatus::Cancelled {
            steps::skip_remaining_steps(&self.pool, id)
                .await
                .map_err(RuntimeError::StoreIoFailure)?;
        }

        workflows::get_workflow(&self.pool, id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownWorkflow(id))
    }

    pub async fn start_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.transition_workflow(id, WorkflowStatus::Running).await
    }

    pub async fn pause_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.transition_workflow(id, WorkflowStatus::Paused).await
    }

    pub async fn cancel_workflow(&self, id: Uuid) -> Result<Workflow> {
        self.transition_workflow(id, WorkflowStatus::Cancelled).await
    }

    /// Returns `{workflow, steps, agent_runs}`. Reads directly off the
    /// shared pool; a momentarily stale-but-consistent snapshot (the
    /// poller or a callback mutating concurrently) is acceptable per the
    /// contract, and the pool itself already retries a dropped connection
    /// transparently before surfacing an I/O error here.
    pub async fn get_workflow_detail(&self, id: Uuid) -> Result<WorkflowDetail> {
        let workflow = workflows::get_workflow(&self.pool, id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownWorkflow(id))?;

        let steps = steps::list_steps_for_workflow(&self.pool, id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        let mut agent_runs_all = Vec::new();
        for step in &steps {
            let runs = agent_runs::list_agent_runs_for_step(&self.pool, &step.id)
                .await
                .map_err(RuntimeError::StoreIoFailure)?;
            agent_runs_all.extend(runs);
        }

        Ok(WorkflowDetail {
            workflow,
            steps,
            agent_runs: agent_runs_all,
        })
    }

    /// Fetch a single step by id, used by the callback handler to check the
    /// caller's token against the stored lease before invoking
    /// `run_step_by_id`.
    pub async fn get_step(&self, step_id: &str) -> Result<WorkflowStep> {
        steps::get_step(&self.pool, step_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or_else(|| RuntimeError::UnknownStep(step_id.to_string()))
    }

    pub async fn list_workflows(&self, project_id: Option<Uuid>) -> Result<Vec<Workflow>> {
        match project_id {
            Some(pid) => workflows::list_workflows_for_project(&self.pool, pid)
                .await
                .map_err(RuntimeError::StoreIoFailure),
            None => {
                let all_projects = projects::list_projects(&self.pool)
                    .await
                    .map_err(RuntimeError::StoreIoFailure)?;
                let mut all = Vec::new();
                for project in all_projects {
                    let wfs = workflows::list_workflows_for_project(&self.pool, project.id)
                        .await
                        .map_err(RuntimeError::StoreIoFailure)?;
                    all.extend(wfs);
                }
                all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                Ok(all)
            }
        }
    }

    pub async fn get_queue_metrics(&self, workflow_id: Uuid) -> Result<workflows::QueueMetrics> {
        workflows::get_queue_metrics(&self.pool, workflow_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)
    }

    // -- Polling loop -----------------------------------------------------

    /// Start the polling loop if it is not already running. Idempotent.
    pub async fn start_worker(&self) {
        let mut guard = self.worker.lock().await;
        if guard.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let runtime = self.clone();
        let stop_for_task = Arc::clone(&stop);
        let join = tokio::spawn(async move {
            while !stop_for_task.load(Ordering::SeqCst) {
                if let Err(e) = runtime.poll_tick().await {
                    error!(error = %e, "polling tick failed");
                }
                tokio::time::sleep(runtime.config.poll_interval).await;
            }
        });

        *guard = Some(WorkerHandle { stop, join });
    }

    /// Stop the polling loop, waiting for the in-flight tick to finish.
    pub async fn stop_worker(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            handle.stop.store(true, Ordering::SeqCst);
            let _ = handle.join.await;
        }
    }

    async fn poll_tick(&self) -> anyhow::Result<()> {
        let running = workflows::list_running_workflows(&self.pool).await?;
        for workflow in running {
            let ready = steps::get_ready_steps(&self.pool, workflow.id).await?;
            for step in ready.into_iter().take(self.config.claim_limit) {
                if let Err(e) = self.claim_and_enqueue(&workflow, &step).await {
                    warn!(step_id = %step.id, error = %e, "claim/enqueue failed");
                }
            }
        }
        Ok(())
    }

    async fn claim_and_enqueue(&self, workflow: &Workflow, step: &WorkflowStep) -> anyhow::Result<()> {
        let attempt = (step.runner_attempts + 1).max(1) as u32;
        let runner_instance_id =
            token::generate_runner_instance_id(&self.config.token_config, workflow.id, &step.id, attempt);

        let claimed = steps::claim_step(&self.pool, &step.id, &runner_instance_id).await?;
        if !claimed {
            return Ok(());
        }

        let project = projects::get_project(&self.pool, workflow.project_id)
            .await?
            .context_not_found(workflow.project_id)?;

        let payload = EnqueuePayload {
            workflow_id: workflow.id,
            step_id: step.id.clone(),
            runner_instance_id: runner_instance_id.clone(),
            repo_path: project.repo_path.clone(),
            callback_base_url: self.config.callback_base_url.clone(),
            callback_token: runner_instance_id.clone(),
            agent_provider: self.config.default_agent_provider.clone(),
            agent_model: self.config.default_agent_model.clone(),
            agent_max_rounds: self.config.default_agent_max_rounds,
            author_name: self.config.author_name.clone(),
            author_email: self.config.author_email.clone(),
            runner_mounts: self.config.runner_mounts.clone(),
        };

        let enqueue_result = self.gateway.enqueue(&payload).await;

        self.log_event(
            workflow.id,
            &step.id,
            runner_event_type::ENQUEUE,
            if enqueue_result.is_ok() {
                RunnerEventStatus::Succeeded
            } else {
                RunnerEventStatus::Failed
            },
            Some(&runner_instance_id),
            attempt as i32,
            None,
        )
        .await;

        if let Err(e) = enqueue_result {
            self.handle_enqueue_failure(workflow, step, &runner_instance_id, attempt, &e.to_string())
                .await?;
        }

        Ok(())
    }

    async fn handle_enqueue_failure(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        runner_instance_id: &str,
        attempt: u32,
        detail: &str,
    ) -> anyhow::Result<()> {
        if attempt < self.config.max_attempts {
            let delay_ms = backoff_ms(attempt, random::<f64>());
            let ready_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
            steps::release_step_for_retry(&self.pool, &step.id, runner_instance_id, ready_at).await?;
        } else {
            let result = json!({
                "error": RuntimeError::EnqueueFailure {
                    step_id: step.id.clone(),
                    source: anyhow::anyhow!(detail.to_string()),
                }
                .to_string(),
                "attempts": attempt,
                "detail": detail,
            });
            steps::complete_step(
                &self.pool,
                &step.id,
                runner_instance_id,
                StepStatus::Failed,
                result,
            )
            .await?;
            dead_letters::insert_dead_letter(
                &self.pool,
                workflow.id,
                &step.id,
                Some(runner_instance_id),
                attempt as i32,
                detail,
            )
            .await?;
            self.reconcile_workflow(workflow.id).await?;
        }
        Ok(())
    }

    async fn log_event(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        event_type: &str,
        status: RunnerEventStatus,
        runner_instance_id: Option<&str>,
        attempts: i32,
        latency_ms: Option<i64>,
    ) {
        if let Err(e) = runner_events::insert_runner_event(
            &self.pool,
            workflow_id,
            step_id,
            event_type,
            status,
            runner_instance_id,
            attempts,
            latency_ms,
            None,
        )
        .await
        {
            warn!(error = %e, step_id, event_type, "failed to record runner event (best-effort)");
        }
    }

    async fn reconcile_workflow(&self, workflow_id: Uuid) -> anyhow::Result<()> {
        if workflows::has_failed_step(&self.pool, workflow_id).await? {
            workflows::set_workflow_status(&self.pool, workflow_id, WorkflowStatus::Failed).await?;
        } else if workflows::is_workflow_complete(&self.pool, workflow_id).await? {
            workflows::set_workflow_status(&self.pool, workflow_id, WorkflowStatus::Completed).await?;
        }
        Ok(())
    }

    // -- Callback execution ----------------------------------------------

    /// `RunStepByID`: the only path that performs real work. Reconciles the
    /// requesting lease, then runs the execution phase a-l.
    pub async fn run_step_by_id(
        &self,
        workflow_id: Uuid,
        step_id: &str,
        runner_instance_id: &str,
    ) -> Result<WorkflowStep> {
        let step = steps::get_step(&self.pool, step_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or_else(|| RuntimeError::UnknownStep(step_id.to_string()))?;

        if step.workflow_id != workflow_id {
            return Err(RuntimeError::WrongWorkflow {
                step_id: step_id.to_string(),
                expected: step.workflow_id,
                actual: workflow_id,
            });
        }

        if step.status.is_terminal() {
            return Err(RuntimeError::StepNotRunning(step_id.to_string()));
        }

        let step = self.reconcile_lease(step, runner_instance_id).await?;

        match self.execute_step(&step, runner_instance_id).await {
            Ok(step) => Ok(step),
            Err(e) => {
                warn!(step_id, error = %e, "step execution failed");
                Err(e)
            }
        }
    }

    /// Steps 1-4 of *Callback execution*: wait briefly for the lease to
    /// settle, self-healing a benign pending/no-instance race left by
    /// restart recovery.
    async fn reconcile_lease(&self, mut step: WorkflowStep, runner_instance_id: &str) -> Result<WorkflowStep> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if step.status == StepStatus::Running
                && step.runner_instance_id.as_deref() == Some(runner_instance_id)
            {
                return Ok(step);
            }

            if step.status == StepStatus::Pending
                && (step.runner_instance_id.is_none()
                    || step.runner_instance_id.as_deref() == Some(runner_instance_id))
                && steps::claim_step(&self.pool, &step.id, runner_instance_id)
                    .await
                    .map_err(RuntimeError::StoreIoFailure)?
            {
                step.status = StepStatus::Running;
                step.runner_instance_id = Some(runner_instance_id.to_string());
                return Ok(step);
            }

            if tokio::time::Instant::now() >= deadline {
                return match step.runner_instance_id.clone() {
                    Some(expected) => Err(RuntimeError::LeaseMismatch {
                        step_id: step.id.clone(),
                        expected,
                        actual: runner_instance_id.to_string(),
                    }),
                    None => Err(RuntimeError::NoLease(step.id.clone())),
                };
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
            step = steps::get_step(&self.pool, &step.id)
                .await
                .map_err(RuntimeError::StoreIoFailure)?
                .ok_or_else(|| RuntimeError::UnknownStep(step.id.clone()))?;
        }
    }

    /// Execution phase a-l, run within an already-validated lease.
    async fn execute_step(&self, step: &WorkflowStep, runner_instance_id: &str) -> Result<WorkflowStep> {
        let workflow = workflows::get_workflow(&self.pool, step.workflow_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownWorkflow(step.workflow_id))?;

        // a. Verify workflow status.
        if workflow.status == WorkflowStatus::Cancelled {
            return self
                .finalize(&workflow, step, runner_instance_id, StepStatus::Skipped, json!({}))
                .await;
        }
        if workflow.status != WorkflowStatus::Running {
            return self
                .finalize(
                    &workflow,
                    step,
                    runner_instance_id,
                    StepStatus::Failed,
                    json!({"error": "workflow is not running"}),
                )
                .await;
        }

        let project = projects::get_project(&self.pool, workflow.project_id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or(RuntimeError::UnknownProject(workflow.project_id))?;

        // b. Policy hook.
        let decision = self.policy.authorize_step(step).await;
        let recorded_at = Utc::now();
        let policy_audit = json!({
            "runnerInstanceId": runner_instance_id,
            "decision": if decision.allowed { "allowed" } else { "denied" },
            "recordedAt": recorded_at,
        });
        if !decision.allowed {
            return self
                .finalize(
                    &workflow,
                    step,
                    runner_instance_id,
                    StepStatus::Failed,
                    json!({
                        "error": RuntimeError::PolicyRejected {
                            step_id: step.id.clone(),
                            reason: decision.reason.clone().unwrap_or_else(|| "policy denied".to_string()),
                        }
                        .to_string(),
                        "policyAudit": policy_audit,
                    }),
                )
                .await;
        }

        // c. Agent Run row.
        let branch_name = BranchInfo {
            workflow_id: workflow.id.to_string(),
            step_id: step.task_id.clone().unwrap_or_else(|| step.id.clone()),
            base_branch: project.default_branch.clone(),
        }
        .branch_name();
        let agent_run = agent_runs::insert_agent_run(
            &self.pool,
            &step.id,
            project.id,
            Some(&branch_name),
            self.config.default_agent_provider.as_deref(),
        )
        .await
        .map_err(RuntimeError::StoreIoFailure)?;

        let outcome = self
            .run_isolated(&workflow, &project, step, &policy_audit, &agent_run)
            .await;

        match outcome {
            Ok((status, result)) => {
                agent_runs::finish_agent_run(
                    &self.pool,
                    agent_run.id,
                    if status == StepStatus::Failed {
                        AgentRunStatus::Failed
                    } else {
                        AgentRunStatus::Succeeded
                    },
                    result.get("provenance").and_then(|p| p.get("logsPath")).and_then(Value::as_str),
                )
                .await
                .map_err(RuntimeError::StoreIoFailure)?;
                self.finalize(&workflow, step, runner_instance_id, status, result).await
            }
            Err(e) => {
                agent_runs::finish_agent_run(&self.pool, agent_run.id, AgentRunStatus::Failed, None)
                    .await
                    .map_err(RuntimeError::StoreIoFailure)?;
                self.finalize(
                    &workflow,
                    step,
                    runner_instance_id,
                    StepStatus::Failed,
                    json!({ "error": e.to_string(), "policyAudit": policy_audit }),
                )
                .await
            }
        }
    }

    /// d-j: open the isolation session, invoke the executor, project a PR,
    /// write provenance, and build the enriched step result. Returns the
    /// terminal status and merged result on success; propagates any error
    /// so the caller can classify the step failed (phase k).
    async fn run_isolated(
        &self,
        workflow: &Workflow,
        project: &forge_db::models::Project,
        step: &WorkflowStep,
        policy_audit: &Value,
        agent_run: &forge_db::models::AgentRun,
    ) -> anyhow::Result<(StepStatus, Value)> {
        let manager = WorktreeManager::new(&project.repo_path, None).map_err(|e| {
            RuntimeError::SessionFailure {
                step_id: step.id.clone(),
                source: IsolationError::from(e),
            }
        })?;
        let branch_info = BranchInfo {
            workflow_id: workflow.id.to_string(),
            step_id: step.task_id.clone().unwrap_or_else(|| step.id.clone()),
            base_branch: project.default_branch.clone(),
        };
        let session = IsolationSession::start(manager, &branch_info).map_err(|e| RuntimeError::SessionFailure {
            step_id: step.id.clone(),
            source: e,
        })?;
        let author = Author {
            name: self.config.author_name.clone(),
            email: self.config.author_email.clone(),
        };
        let workspace_path = session.workspace().workspace_path.clone();

        let args = ExecutorArgs {
            workspace_path: workspace_path.clone(),
            step_data: step.data.clone(),
            agent_provider: self.config.default_agent_provider.clone(),
            agent_model: self.config.default_agent_model.clone(),
            agent_max_rounds: self.config.default_agent_max_rounds,
        };

        let executor_outcome = match self.executor.run(&args).await {
            Ok(outcome) => outcome,
            Err(e) => {
                session.abort();
                return Err(RuntimeError::ExecutorFailure {
                    step_id: step.id.clone(),
                    source: e,
                }
                .into());
            }
        };

        let approved = executor_outcome
            .step_result
            .as_ref()
            .and_then(|r| r.get("agent"))
            .and_then(|a| a.get("outcome"))
            .and_then(Value::as_str)
            .map(|s| s == "approved")
            .unwrap_or(true);

        let mut result = executor_outcome.step_result.clone().unwrap_or_else(|| json!({}));
        let mut commit_info: Option<Value> = None;
        let mut pr_info: Option<Value> = None;
        let mut status = StepStatus::Completed;

        if executor_outcome.skip_commit {
            session.cleanup().map_err(|e| RuntimeError::SessionFailure {
                step_id: step.id.clone(),
                source: e,
            })?;
            if !approved {
                status = StepStatus::Failed;
            }
        } else {
            let message = executor_outcome
                .commit_message
                .clone()
                .unwrap_or_else(|| format!("{}: {}", workflow.kind.as_deref().unwrap_or("workflow"), step.id));

            let commit = session.finish(&message, &author).map_err(|e| RuntimeError::SessionFailure {
                step_id: step.id.clone(),
                source: e,
            })?;

            if !approved {
                status = StepStatus::Failed;
            }

            if let Some(commit) = commit {
                commit_info = Some(json!({
                    "branch": commit.branch_name,
                    "commitHash": commit.commit_hash,
                    "message": message,
                }));

                // h. Open a pull request for the produced commit.
                let pr_params = OpenPullRequestParams {
                    project_id: project.id,
                    title: message.clone(),
                    description: executor_outcome
                        .step_result
                        .as_ref()
                        .and_then(|r| r.get("summary"))
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                    source_branch: commit.branch_name.clone(),
                    target_branch: branch_info.base_branch.clone(),
                    author_user_id: self.config.author_name.clone(),
                };
                match pr_projection::open_pull_request(&self.pool, session.manager(), pr_params).await {
                    Ok((pr, _)) => pr_info = Some(json!({ "id": pr.id })),
                    Err(e) => warn!(step_id = %step.id, error = %e, "failed to project pull request"),
                }
            }
        }

        // i. Provenance is always written.
        let record = ProvenanceRecord {
            workflow_id: workflow.id,
            project_id: project.id,
            step_id: step.id.clone(),
            repository_path: project.repo_path.clone(),
            workspace_path: workspace_path.to_string_lossy().to_string(),
            agent_run_id: agent_run.id,
            commit_hash: commit_info
                .as_ref()
                .and_then(|c| c.get("commitHash"))
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
            created_at: Utc::now(),
        };
        let provenance_path = provenance::write_provenance(std::path::Path::new(&project.repo_path), &record)?;

        if let Some(obj) = result.as_object_mut() {
            if let Some(ws) = commit_info.as_ref() {
                obj.insert("commit".to_string(), ws.clone());
            }
            obj.insert(
                "workspace".to_string(),
                json!(workspace_path.to_string_lossy()),
            );
            if let Some(pr) = pr_info {
                obj.insert("pullRequest".to_string(), pr);
            }
            obj.insert(
                "provenance".to_string(),
                json!({ "logsPath": provenance_path.to_string_lossy() }),
            );
            obj.insert("policyAudit".to_string(), policy_audit.clone());
        } else {
            result = json!({
                "commit": commit_info,
                "workspace": workspace_path.to_string_lossy(),
                "pullRequest": pr_info,
                "provenance": { "logsPath": provenance_path.to_string_lossy() },
                "policyAudit": policy_audit,
            });
        }

        Ok((status, result))
    }

    async fn finalize(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        runner_instance_id: &str,
        status: StepStatus,
        result: Value,
    ) -> Result<WorkflowStep> {
        steps::complete_step(&self.pool, &step.id, runner_instance_id, status, result)
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        self.log_event(
            workflow.id,
            &step.id,
            runner_event_type::EXECUTE,
            match status {
                StepStatus::Completed => RunnerEventStatus::Completed,
                StepStatus::Skipped => RunnerEventStatus::Skipped,
                _ => RunnerEventStatus::Failed,
            },
            Some(runner_instance_id),
            (step.runner_attempts + 1) as i32,
            None,
        )
        .await;

        self.reconcile_workflow(workflow.id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?;

        steps::get_step(&self.pool, &step.id)
            .await
            .map_err(RuntimeError::StoreIoFailure)?
            .ok_or_else(|| RuntimeError::UnknownStep(step.id.clone()))
    }
}

trait OptionExt<T> {
    fn context_not_found(self, id: Uuid) -> anyhow::Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context_not_found(self, id: Uuid) -> anyhow::Result<T> {
        self.ok_or_else(|| anyhow::anyhow!("project {id} not found"))
    }
}
