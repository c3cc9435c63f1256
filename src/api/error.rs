use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::errors::QueueError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("a queue run is already in progress")]
    RunInProgress,

    #[error("queue run aborted: {0}")]
    RunAborted(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::RunInProgress => StatusCode::CONFLICT,
            ApiError::RunAborted(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Queue(QueueError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Queue(QueueError::Duplicate { .. }) => StatusCode::CONFLICT,
            ApiError::Queue(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound { .. } => "not_found",
            ApiError::RunInProgress => "run_in_progress",
            ApiError::RunAborted(_) => "run_aborted",
            ApiError::Queue(QueueError::NotFound { .. }) => "not_found",
            ApiError::Queue(QueueError::Duplicate { .. }) => "duplicate",
            ApiError::Queue(_) => "invalid_item",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status(),
            Json(json!({
                "error": self.code(),
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
