// src/errors.rs
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Provider error: {message}")]
    Provider {
        message: String,
        detail: Option<serde_json::Value>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "Not found".to_string()),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "Conflict".to_string()),
            AppError::Provider { .. } => (StatusCode::BAD_REQUEST, "Payment provider error".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string()),
        };

        let detail = match &self {
            AppError::Provider { detail, .. } => detail.clone().unwrap_or(serde_json::Value::Null),
            _ => serde_json::Value::Null,
        };

        let body = Json(json!({
            "error": error_message,
            "message": self.to_string(),
            "detail": detail,
            "success": false,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }));

        (status, body).into_response()
    }
}

// Manual From implementations
impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Provider {
            message: format!("HTTP request failed: {}", err),
            detail: None,
        }
    }
}

// Helper conversion functions
impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        AppError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }

    pub fn provider(msg: impl Into<String>) -> Self {
        AppError::Provider {
            message: msg.into(),
            detail: None,
        }
    }

    pub fn provider_with_detail(msg: impl Into<String>, detail: serde_json::Value) -> Self {
        AppError::Provider {
            message: msg.into(),
            detail: Some(detail),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
