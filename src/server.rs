//! HTTP surface. Progress of a streamed run is sent as server-sent events,
//! one `data: {json}` frame per progress event.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::error::{AgentError, StoreError};
use crate::runner::{Authentication, TaskRequest, TaskRunner, MAX_STEPS_LIMIT};
use crate::sandbox::CreateSandbox;
use crate::store::{ListFilter, TaskRecord, TaskStatus};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound("Task not found".into()),
            StoreError::NotCancellable { status, .. } => {
                ApiError::BadRequest(format!("Task is in \"{status}\" state and cannot be cancelled"))
            }
            StoreError::InvalidTransition { .. } => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (status, Json(json!({ "success": false, "detail": self.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub struct AppState {
    pub runner: TaskRunner,
    pub log_level: String,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/agent/info", get(agent_info))
        .route("/api/sandbox/create", post(create_sandbox))
        .route("/api/agent/run", post(run_agent))
        .route("/api/agent/task/submit", post(submit_task))
        .route("/api/agent/task/status/{task_id}", get(task_status))
        .route("/api/agent/task/list", get(list_tasks))
        .route("/api/agent/tasks", get(active_tasks))
        .route("/api/agent/cancel", post(cancel))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn agent_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "version": concat!("sandbox-agent-", env!("CARGO_PKG_VERSION")),
        "maxConcurrentTasks": "unlimited",
        "log_level": state.log_level,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    #[serde(flatten)]
    pub sandbox: CreateSandbox,
    #[serde(default)]
    pub authentication: Option<Authentication>,
}

async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSandboxRequest>,
) -> ApiResult<Json<Value>> {
    let details = state
        .runner
        .create_sandbox(req.authentication.as_ref(), &req.sandbox)
        .await?;
    let mut body = serde_json::to_value(&details).map_err(|e| ApiError::Internal(e.to_string()))?;
    body["success"] = json!(true);
    body["message"] = json!(format!("Sandbox {} created successfully", details.sandbox_id));
    Ok(Json(body))
}

fn validate_request(req: &TaskRequest) -> ApiResult<()> {
    if req.instruction.trim().is_empty() {
        return Err(ApiError::BadRequest("instruction is required".into()));
    }
    if let Some(n) = req.max_steps.filter(|n| !(1..=MAX_STEPS_LIMIT).contains(n)) {
        return Err(ApiError::BadRequest(format!("max_steps must be between 1 and {MAX_STEPS_LIMIT}, got {n}")));
    }
    Ok(())
}

async fn run_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    validate_request(&req)?;
    let handle = state.runner.start(req).await?;
    info!(task_id = %handle.task_id, sandbox_id = %handle.sandbox_id, "streaming task");
    // dropping the stream closes the receiver, which cancels the task
    let stream = ReceiverStream::new(handle.events).map(|ev| Event::default().json_data(&ev));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TaskRequest>,
) -> ApiResult<Json<Value>> {
    validate_request(&req)?;
    let task_id = state.runner.submit(req).await?;
    Ok(Json(json!({
        "success": true,
        "task_id": task_id,
        "message": format!("Task {task_id} submitted successfully"),
    })))
}

fn status_body(task: &TaskRecord) -> Value {
    let mut body = json!({
        "success": true,
        "task_id": task.task_id,
        "status": task.status,
        "query": task.query,
        "max_steps": task.max_steps,
        "created_at": task.created_at,
        "updated_at": task.updated_at,
    });
    if matches!(task.status, TaskStatus::Finished | TaskStatus::HumanIntervention) {
        if let Some(out) = &task.finished_output {
            body["finished_output"] = json!(out);
        }
    }
    if matches!(task.status, TaskStatus::Error | TaskStatus::Failed) {
        if let Some(err) = &task.final_state {
            body["error_message"] = json!(err);
        }
    }
    if let Some(sb) = &task.sandbox_info {
        body["sandbox_info"] = sb.clone();
    }
    if let Some(stats) = &task.execution_statistics {
        body["execution_statistics"] = stats.clone();
    }
    body
}

async fn task_status(State(state): State<Arc<AppState>>, Path(task_id): Path<String>) -> ApiResult<Json<Value>> {
    let task = state
        .runner
        .status(&task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("Task not found".into()))?;
    Ok(Json(status_body(&task)))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl ListQuery {
    fn filter(&self) -> ApiResult<ListFilter> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse::<TaskStatus>().map_err(|e| ApiError::BadRequest(e.to_string()))?),
            None => None,
        };
        Ok(ListFilter { status, limit: self.limit, offset: self.offset })
    }
}

async fn list_tasks(State(state): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> ApiResult<Json<Value>> {
    let tasks = state.runner.list(q.filter()?).await?;
    let list: Vec<Value> = tasks
        .iter()
        .map(|t| {
            let mut v = json!({
                "task_id": t.task_id,
                "status": t.status,
                "query": t.query,
                "created_at": t.created_at,
                "updated_at": t.updated_at,
            });
            if t.status == TaskStatus::Finished {
                if let Some(out) = &t.finished_output {
                    v["finished_output"] = json!(out);
                }
            }
            v
        })
        .collect();
    Ok(Json(json!({ "success": true, "count": list.len(), "tasks": list })))
}

async fn active_tasks(State(state): State<Arc<AppState>>) -> Json<Value> {
    let tasks = state.runner.active_tasks();
    Json(json!({ "success": true, "count": tasks.len(), "tasks": tasks }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub authentication: Option<Authentication>,
}

async fn cancel(State(state): State<Arc<AppState>>, Json(req): Json<CancelRequest>) -> ApiResult<Json<Value>> {
    match req.task_id.as_deref().filter(|id| !id.is_empty()) {
        Some(task_id) => {
            let outcome = state.runner.cancel(task_id).await?;
            let message = if outcome.already_cancelled() {
                format!("Task {task_id} successfully cancelled")
            } else {
                format!("Cancellation requested for task {task_id}")
            };
            Ok(Json(json!({
                "success": true,
                "message": message,
                "already_cancelled": outcome.already_cancelled(),
            })))
        }
        None => {
            let n = state.runner.cancel_all().await?;
            Ok(Json(json!({
                "success": true,
                "message": format!("Cancellation requested for {n} task(s)"),
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_statuses() {
        let e: ApiError = StoreError::NotFound("t".into()).into();
        assert_eq!(e.into_response().status(), StatusCode::NOT_FOUND);

        let e: ApiError = StoreError::NotCancellable { task_id: "t".into(), status: TaskStatus::Finished }.into();
        assert_eq!(e.to_string(), "Task is in \"finished\" state and cannot be cancelled");
        assert_eq!(e.into_response().status(), StatusCode::BAD_REQUEST);

        let e: ApiError = StoreError::Backend("db down".into()).into();
        assert_eq!(e.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn requests_are_validated() {
        assert!(validate_request(&TaskRequest::new("  ")).is_err());
        assert!(validate_request(&TaskRequest::new("open mail")).is_ok());
        let req = TaskRequest { max_steps: Some(u32::MAX), ..TaskRequest::new("open mail") };
        assert!(matches!(validate_request(&req), Err(ApiError::BadRequest(_))));
        let req = TaskRequest { max_steps: Some(0), ..TaskRequest::new("open mail") };
        assert!(validate_request(&req).is_err());
        let req = TaskRequest { max_steps: Some(MAX_STEPS_LIMIT), ..TaskRequest::new("open mail") };
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn list_query_rejects_unknown_status() {
        let q = ListQuery { status: Some("sleeping".into()), ..Default::default() };
        assert!(q.filter().is_err());
        let q = ListQuery { status: Some("running".into()), limit: Some(2), offset: 1 };
        assert_eq!(q.filter().unwrap().status, Some(TaskStatus::Running));
    }

    #[test]
    fn status_body_exposes_outcome_fields() {
        let mut t = TaskRecord::new("t1", TaskStatus::Error, "go", 50).with_sandbox("sb");
        t.final_state = Some("boom".into());
        let body = status_body(&t);
        assert_eq!(body["error_message"], "boom");
        assert_eq!(body["sandbox_info"]["sandbox_id"], "sb");
        assert!(body.get("finished_output").is_none());
    }
}
