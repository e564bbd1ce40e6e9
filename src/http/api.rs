use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::auth::{AuthContext, AuthVerifier, bearer_token};
use crate::bus::StreamBus;
use crate::config::Settings;
use crate::control::CancelController;
use crate::db::DbHandle;
use crate::envelope::InputPayload;
use crate::errors::RunnerError;
use crate::mediator::IoMediator;
use crate::models::{Task, TaskStatus};
use crate::scheduler::{SubmitOptions, TaskScheduler};
use crate::storage::{ArtifactStorage, task_archive_path};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub settings: Settings,
    pub db: DbHandle,
    pub bus: Arc<dyn StreamBus>,
    pub storage: Arc<dyn ArtifactStorage>,
    pub mediator: Arc<IoMediator>,
    pub scheduler: Arc<TaskScheduler>,
    pub controller: CancelController,
    pub auth: Arc<dyn AuthVerifier>,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub struct ApiError(RunnerError);

impl From<RunnerError> for ApiError {
    fn from(err: RunnerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RunnerError::AuthInvalid => StatusCode::UNAUTHORIZED,
            RunnerError::PermissionDenied { .. } | RunnerError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            RunnerError::NotFound(_) => StatusCode::NOT_FOUND,
            RunnerError::NotWaiting
            | RunnerError::InputMismatch
            | RunnerError::Conflict(_) => StatusCode::BAD_REQUEST,
            RunnerError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RunnerError::BusUnavailable(_)
            | RunnerError::StorageUnavailable(_)
            | RunnerError::PersistenceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RunnerError::ProtocolViolation(_) | RunnerError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = self.0.to_string();
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct PaginationParams {
    pub page: Option<i64>,
    pub size: Option<i64>,
}

#[derive(Deserialize)]
pub struct DeleteParams {
    pub force: Option<bool>,
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/tasks", post(create_task).get(list_tasks))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/cancel", post(cancel_task))
        .route("/tasks/:id/input", post(task_input))
        .route("/tasks/:id/download", get(download_task))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn authenticate(state: &SharedState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let token = bearer_token(headers).ok_or(RunnerError::AuthInvalid)?;
    Ok(state.auth.verify(&token).await?)
}

/// Load a task owned by the caller; anything else reads as not found.
async fn load_owned_task(
    state: &SharedState,
    ctx: &AuthContext,
    task_id: &str,
) -> Result<Task, ApiError> {
    let id = task_id.to_string();
    let task = state
        .db
        .call(move |db| db.get_task(&id))
        .await?
        .filter(|task| !task.soft_deleted && task.client_id == ctx.client_id)
        .ok_or_else(|| RunnerError::not_found("Task"))?;
    Ok(task)
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn create_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;

    let mut filename: Option<String> = None;
    let mut content: Option<Vec<u8>> = None;
    let mut options = SubmitOptions::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RunnerError::ValidationFailed(format!("Bad multipart payload: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| RunnerError::ValidationFailed(format!("Bad file field: {}", e)))?;
                content = Some(bytes.to_vec());
            }
            Some("input_timeout") => {
                options.input_timeout = Some(parse_field(field, "input_timeout").await?);
            }
            Some("max_duration") => {
                options.max_duration = Some(parse_field(field, "max_duration").await?);
            }
            Some("env_vars") => {
                let raw = field.text().await.map_err(|e| {
                    RunnerError::ValidationFailed(format!("Bad env_vars field: {}", e))
                })?;
                options.env_vars = serde_json::from_str(&raw).map_err(|_| {
                    RunnerError::ValidationFailed(
                        "env_vars must be a JSON object of strings".into(),
                    )
                })?;
            }
            _ => {}
        }
    }

    let filename =
        filename.ok_or_else(|| RunnerError::ValidationFailed("A file must be provided".into()))?;
    let content =
        content.ok_or_else(|| RunnerError::ValidationFailed("A file must be provided".into()))?;

    let task = state
        .scheduler
        .submit(&ctx.client_id, &filename, content, options)
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn parse_field(field: axum::extract::multipart::Field<'_>, name: &str) -> Result<u64, ApiError> {
    let raw = field
        .text()
        .await
        .map_err(|e| RunnerError::ValidationFailed(format!("Bad {} field: {}", name, e)))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|_| RunnerError::ValidationFailed(format!("{} must be a number", name)).into())
}

async fn list_tasks(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<PaginationParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let page = params.page.unwrap_or(1);
    let size = params.size.unwrap_or(50);
    let tasks = state
        .db
        .call(move |db| db.list_tasks(&ctx.client_id, page, size))
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let task = load_owned_task(&state, &ctx, &task_id).await?;
    Ok(Json(task))
}

async fn cancel_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    load_owned_task(&state, &ctx, &task_id).await?;
    // Idempotent: a terminal task comes back unchanged.
    let task = state.controller.cancel(&task_id).await?;
    Ok(Json(task))
}

async fn task_input(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(payload): Json<InputPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let task = load_owned_task(&state, &ctx, &task_id).await?;
    if task.status != TaskStatus::WaitingForInput {
        return Err(RunnerError::NotWaiting.into());
    }
    if task.input_request_id.as_deref() != Some(payload.request_id.as_str()) {
        tracing::warn!(
            task = %task_id,
            got = %payload.request_id,
            expected = ?task.input_request_id,
            "Input request id mismatch"
        );
        return Err(RunnerError::InputMismatch.into());
    }
    state
        .mediator
        .submit_input(&task_id, &payload.request_id, &payload.data)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn download_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let task = load_owned_task(&state, &ctx, &task_id).await?;

    let bytes = state
        .storage
        .get(&task_archive_path(&task.client_id, &task.id))
        .await
        .map_err(|e| match e {
            RunnerError::NotFound(_) => RunnerError::not_found("Task archive"),
            other => other,
        })?;
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-tar")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.tar\"", task.id),
        )
        .body(Body::from(bytes))
        .map_err(|e| RunnerError::Internal(anyhow::anyhow!("Response build failed: {}", e)))?;
    Ok(response)
}

async fn delete_task(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<impl IntoResponse, ApiError> {
    let ctx = authenticate(&state, &headers).await?;
    let task = load_owned_task(&state, &ctx, &task_id).await?;
    let force = params.force.unwrap_or(false);

    if task.status.is_active() {
        if !force {
            return Err(RunnerError::Conflict(format!(
                "Cannot delete task with status {}",
                task.status
            ))
            .into());
        }
        state.controller.cancel(&task_id).await?;
    }

    let id = task_id.clone();
    state.db.call(move |db| db.soft_delete(&id).map(|_| ())).await?;

    // Artifacts and streams go in the background; the record is already
    // invisible.
    let scheduler = Arc::clone(&state.scheduler);
    let client_id = task.client_id.clone();
    tokio::spawn(async move {
        scheduler.collector().delete_artifacts(&task_id, &client_id).await;
    });

    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ─────────────────────────────────────────────────────────────
