//! Error responses of the HTTP front end.

use crate::error::StoreError;
use crate::queue::{CancelError, Rejected};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    Conflict {
        message: String,
        running_job_id: Option<String>,
    },

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::Conflict { .. } => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    running_job_id: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("API error: {}", self);
        }

        let running_job_id = match &self {
            ApiError::Conflict { running_job_id, .. } => running_job_id.clone(),
            _ => None,
        };
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
            running_job_id,
        };
        (status, Json(body)).into_response()
    }
}

impl From<Rejected> for ApiError {
    fn from(err: Rejected) -> Self {
        match err {
            Rejected::Conflict { running_job_id } => ApiError::Conflict {
                message: "A job is already running, try again once it has finished".to_string(),
                running_job_id: Some(running_job_id),
            },
            Rejected::Invalid(e) => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<CancelError> for ApiError {
    fn from(err: CancelError) -> Self {
        match err {
            CancelError::NotFound(_) => ApiError::NotFound(err.to_string()),
            CancelError::NotActive { .. } => ApiError::Conflict {
                message: err.to_string(),
                running_job_id: None,
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
