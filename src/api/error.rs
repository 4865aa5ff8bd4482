use axum::{Json, http::StatusCode, response::IntoResponse};
use serde_json::json;
use thiserror::Error;

use super::models::ErrorResponse;
use crate::dispatcher::DispatchError;
use crate::registry::RegistryError;
use crate::tasks::TaskError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("payload invalid: {0}")]
    InvalidPayload(String),
    #[error("invalid status filter: {0}")]
    InvalidStatusFilter(String),
    #[error("missing or invalid API key")]
    Unauthorized,
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("unknown worker: {0}")]
    UnknownWorker(String),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidPayload(_) | ApiError::InvalidStatusFilter(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) | ApiError::UnknownWorker(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidTransition(_) | ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidPayload(_) => "INVALID_PAYLOAD",
            ApiError::InvalidStatusFilter(_) => "INVALID_STATUS_FILTER",
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::UnknownWorker(_) => "UNKNOWN_WORKER",
            ApiError::InvalidTransition(_) => "INVALID_TRANSITION",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };

        (status, Json(json!(body))).into_response()
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(value: serde_json::Error) -> Self {
        ApiError::InvalidPayload(value.to_string())
    }
}

impl From<TaskError> for ApiError {
    fn from(value: TaskError) -> Self {
        match value {
            TaskError::NotFound(id) => ApiError::NotFound(format!("task {id}")),
            TaskError::Transition(e) => ApiError::InvalidTransition(e.to_string()),
            e @ TaskError::DuplicateEngineHandle { .. } => ApiError::Conflict(e.to_string()),
            TaskError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::UnknownWorker(id) => ApiError::UnknownWorker(id),
            RegistryError::InvalidRegistration(msg) => ApiError::InvalidPayload(msg),
            e @ (RegistryError::NoCapacity(_) | RegistryError::Unavailable { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            RegistryError::Storage(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(value: DispatchError) -> Self {
        match value {
            DispatchError::Task(e) => e.into(),
            DispatchError::Registry(e) => e.into(),
            DispatchError::InvalidRequest(msg) => ApiError::InvalidPayload(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TaskStatus;
    use crate::tasks::TransitionError;

    #[test]
    fn test_codes_and_statuses() {
        let err = ApiError::InvalidStatusFilter("queued".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "INVALID_STATUS_FILTER");

        assert_eq!(ApiError::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::PayloadTooLarge(10).code(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn test_task_errors_map_to_api_errors() {
        let err: ApiError = TaskError::NotFound("task-1".into()).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

        let err: ApiError = TaskError::Transition(TransitionError::Terminal {
            task_id: "task-1".into(),
            status: TaskStatus::Cancelled,
        })
        .into();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_unknown_worker_maps_to_404() {
        let err: ApiError = DispatchError::Registry(RegistryError::UnknownWorker("w".into())).into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "UNKNOWN_WORKER");
    }
}
