use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret {name} not found")]
    NotFound { name: String },

    #[error("Secret {name} is empty")]
    Empty { name: String },

    #[error("Failed to acquire vault credentials: {0}")]
    Credential(String),

    #[error("Vault request failed: {0}")]
    Vault(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store connection is closed")]
    Closed,

    #[error("Store operation failed: {0}")]
    Operation(String),

    #[error("Corrupt document {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Operation(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] StoreError),

    #[error("Bootstrap already started")]
    AlreadyStarted,
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),

    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Service unavailable, store not ready")]
    ServiceUnavailable,

    #[error("Error incrementing visit count: {0}")]
    CounterUpdateFailed(#[source] StoreError),

    #[error("Record not found")]
    NotFound,

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Malformed payload")]
    MalformedPayload,

    #[error("Internal error: {0}")]
    InternalError(#[from] StoreError),
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::ServiceUnavailable => "service_unavailable",
            AppError::CounterUpdateFailed(_) => "counter_update_failed",
            AppError::NotFound => "not_found",
            AppError::InvalidIdentifier(_) => "invalid_identifier",
            AppError::MalformedPayload => "malformed_payload",
            AppError::InternalError(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::CounterUpdateFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::InvalidIdentifier(_) => StatusCode::BAD_REQUEST,
            AppError::MalformedPayload => StatusCode::BAD_REQUEST,
            AppError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.code(),
            message: self.to_string(),
        });

        (self.status(), body).into_response()
    }
}
