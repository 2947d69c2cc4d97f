//! HTTP surface for `forge serve`: the runner callback endpoint plus a
//! small read-only inspection API used by operators and the CLI's own
//! `workflow show` / `queue-metrics` commands.

use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use forge_core::{RuntimeError, WorkflowRuntime};

/// Uniform JSON error body, mirroring the teacher's `{"error": "..."}`
/// convention.
struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::UnknownProject(_)
            | RuntimeError::UnknownWorkflow(_)
            | RuntimeError::UnknownStep(_) => StatusCode::NOT_FOUND,
            RuntimeError::WrongWorkflow { .. }
            | RuntimeError::StepNotRunning(_)
            | RuntimeError::NoLease(_)
            | RuntimeError::LeaseMismatch { .. } => StatusCode::CONFLICT,
            RuntimeError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            RuntimeError::EnqueueFailure { .. }
            | RuntimeError::PolicyRejected { .. }
            | RuntimeError::ExecutorFailure { .. }
            | RuntimeError::SessionFailure { .. }
            | RuntimeError::StoreIoFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: err.to_string(),
        }
    }
}

/// Body posted by a sandbox process once its agent run has finished.
#[derive(Debug, Deserialize)]
struct CallbackBody {
    #[serde(rename = "runnerInstanceId")]
    runner_instance_id: String,
}

async fn callback_handler(
    State(runtime): State<WorkflowRuntime>,
    Path((workflow_id, step_id)): Path<(Uuid, String)>,
    headers: HeaderMap,
    Json(body): Json<CallbackBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let token = headers
        .get("x-workflow-runner-token")
        .and_then(|v| v.to_str().ok());

    let step = runtime.get_step(&step_id).await?;

    if token != step.runner_instance_id.as_deref() {
        return Err(AppError {
            status: StatusCode::UNAUTHORIZED,
            message: "callback token does not match the step's stored runner instance id".to_string(),
        });
    }

    let step = runtime
        .run_step_by_id(workflow_id, &step_id, &body.runner_instance_id)
        .await?;

    Ok(Json(json!({
        "stepId": step.id,
        "status": step.status,
    })))
}

async fn list_projects_handler(
    State(runtime): State<WorkflowRuntime>,
) -> Result<Json<Vec<forge_core::Project>>, AppError> {
    let projects = runtime.list_projects().await?;
    Ok(Json(projects))
}

async fn list_project_workflows_handler(
    State(runtime): State<WorkflowRuntime>,
    Path(project_id): Path<Uuid>,
) -> Result<Json<Vec<forge_db::models::Workflow>>, AppError> {
    let workflows = runtime.list_workflows(Some(project_id)).await?;
    Ok(Json(workflows))
}

async fn get_workflow_handler(
    State(runtime): State<WorkflowRuntime>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<forge_core::runtime::WorkflowDetail>, AppError> {
    let detail = runtime.get_workflow_detail(workflow_id).await?;
    Ok(Json(detail))
}

async fn queue_metrics_handler(
    State(runtime): State<WorkflowRuntime>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<forge_db::queries::workflows::QueueMetrics>, AppError> {
    let metrics = runtime.get_queue_metrics(workflow_id).await?;
    Ok(Json(metrics))
}

pub fn build_router(runtime: WorkflowRuntime) -> Router {
    Router::new()
        .route(
            "/workflows/{workflow_id}/steps/{step_id}/callback",
            post(callback_handler),
        )
        .route("/projects", get(list_projects_handler))
        .route("/projects/{project_id}/workflows", get(list_project_workflows_handler))
        .route("/workflows/{workflow_id}", get(get_workflow_handler))
        .route("/workflows/{workflow_id}/queue-metrics", get(queue_metrics_handler))
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}

/// Bind and serve, running until ctrl-c. The caller is expected to have
/// already called [`WorkflowRuntime::start_worker`] on the same runtime if
/// this process should also poll for ready steps.
pub async fn run_serve(runtime: WorkflowRuntime, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(runtime);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "forge serve listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
