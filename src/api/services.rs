use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use http_body_util::BodyExt;
use std::collections::HashMap;

use super::{
    models::{
        CreateTaskRequest, HealthResponse, HeartbeatRequest, ListQuery, RegisterWorkerRequest,
        ReportResponse, TaskReport, WorkerRemovedResponse,
    },
    state::AppState,
    utils::{parse_content_type, parse_status_filter, validate_body_size},
    validation::{validate_report, validate_task_request},
};
use crate::api::error::ApiError;
use crate::model::{TaskStatus, WorkerStatus};
use crate::supervisor::REASON_REMOVED;

/// Fleet summary (GET /status, GET /api/status)
pub async fn status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let summary = state.dispatcher.summary().await?;
    Ok(Json(summary))
}

/// GET /tasks, optionally filtered by `?status=`
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks = match parse_status_filter::<TaskStatus>(query.status.as_deref())? {
        Some(status) => state.dispatcher.tasks().list_by_status(status).await,
        None => state.dispatcher.tasks().list().await,
    }
    .map_err(ApiError::from)?;

    Ok(Json(tasks))
}

/// Task submission (POST /tasks)
///
/// Creates the task in `pending` and immediately offers it to the
/// assignment engine. The response reflects that attempt: `assigned` when a
/// worker took it, `pending` when the fleet had no eligible slot.
pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let body_bytes = read_body(body, state.config.server.max_payload_bytes).await?;

    let request: CreateTaskRequest = serde_json::from_slice(&body_bytes)?;
    validate_task_request(&request).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    let task = state.dispatcher.create_task(request.into()).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.dispatcher.tasks().get(&task_id).await?;
    Ok(Json(task))
}

/// Worker progress and result reports (PUT /tasks/{id})
///
/// Reports for terminal tasks, or from a worker that no longer owns the
/// task, are acknowledged with outcome `stale` and change nothing.
pub async fn update_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let body_bytes = read_body(body, state.config.server.max_payload_bytes).await?;

    let report: TaskReport = serde_json::from_slice(&body_bytes)?;
    validate_report(&report).map_err(|e| ApiError::InvalidPayload(e.to_string()))?;

    let (task, outcome) = state.dispatcher.report(&task_id, report).await?;
    Ok(Json(ReportResponse { task, outcome }))
}

/// DELETE /tasks/{id}
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state.dispatcher.cancel_task(&task_id).await?;
    Ok(Json(task))
}

/// GET /workers, optionally filtered by `?status=`
pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let registry = state.dispatcher.registry();
    let workers = match parse_status_filter::<WorkerStatus>(query.status.as_deref())? {
        Some(status) => registry.list_by_status(status).await,
        None => registry.snapshot().await,
    }
    .map_err(ApiError::from)?;

    Ok(Json(workers))
}

/// Worker registration (POST /workers)
///
/// Idempotent: re-registering the same id or the same `hostname:port`
/// returns the existing record.
pub async fn register_worker(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    require_json(&headers)?;
    let body_bytes = read_body(body, state.config.server.max_payload_bytes).await?;

    let registration: RegisterWorkerRequest = serde_json::from_slice(&body_bytes)?;
    let worker = state.dispatcher.register_worker(registration).await?;
    Ok(Json(worker))
}

pub async fn get_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let worker = state.dispatcher.registry().get(&worker_id).await?;
    Ok(Json(worker))
}

/// Heartbeat push (POST /workers/{id}/heartbeat)
///
/// The body is optional; an empty one just refreshes liveness.
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<impl IntoResponse, ApiError> {
    let body_bytes = read_body(body, state.config.server.max_payload_bytes).await?;

    let report = if body_bytes.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        require_json(&headers)?;
        serde_json::from_slice(&body_bytes)?
    };

    let worker = state.dispatcher.heartbeat(&worker_id, report).await?;
    Ok(Json(worker))
}

/// DELETE /workers/{id}
pub async fn remove_worker(
    State(state): State<AppState>,
    Path(worker_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let tasks_recycled = state
        .dispatcher
        .remove_worker(&worker_id, REASON_REMOVED)
        .await?;

    Ok(Json(WorkerRemovedResponse {
        worker_id,
        tasks_recycled,
    }))
}

/// Health check endpoint (GET /health)
///
/// Returns 503 Service Unavailable if the storage backend does not answer.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let mut components = HashMap::new();
    components.insert("api".to_string(), "healthy".to_string());

    let backend = state.dispatcher.backend();
    let storage = match backend.health_check().await {
        Ok(()) => "healthy".to_string(),
        Err(e) => {
            tracing::warn!(error = %e, backend = ?backend.kind(), "Storage health check failed");
            "unhealthy".to_string()
        }
    };
    components.insert("storage".to_string(), storage);

    let all_healthy = components.values().all(|status| status == "healthy");
    let (status_code, overall_status) = if all_healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };

    let response = HealthResponse {
        status: overall_status.to_string(),
        components,
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response))
}

/// Must be application/json (optionally with charset parameter)
fn require_json(headers: &HeaderMap) -> Result<(), ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::InvalidPayload("missing Content-Type header".into()))?;

    parse_content_type(content_type)?;
    Ok(())
}

/// Reads request body and validates size
///
/// Decompression is handled by RequestDecompressionLayer, so this sees the
/// decoded bytes.
async fn read_body(body: Body, max_size: usize) -> Result<Vec<u8>, ApiError> {
    let data = body
        .collect()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
        .to_bytes()
        .to_vec();

    validate_body_size(&data, max_size)?;
    Ok(data)
}
