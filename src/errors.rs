use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;
use uuid::Uuid;

/// Failures of the upload engine.
///
/// Transient provider failures are retried inside the transfer client and only reach
/// callers as [`UploadError::RetriesExhausted`]; every other kind carries enough
/// context (session id, part number) to resume by hand.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),

    #[error("part {part_number} is out of range for session `{session_id}` ({part_count} parts)")]
    PartOutOfRange {
        session_id: Uuid,
        part_number: u32,
        part_count: u32,
    },

    #[error("transient network failure for session `{session_id}`: {reason}")]
    TransientNetwork { session_id: Uuid, reason: String },

    #[error("destination for part {part_number} of session `{session_id}` expired: {reason}")]
    DestinationExpired {
        session_id: Uuid,
        part_number: u32,
        reason: String,
    },

    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("provider rejected finalize of session `{session_id}`: {reason}")]
    ProviderRejected { session_id: Uuid, reason: String },

    #[error("session `{session_id}` is incomplete: {detail}")]
    IncompleteUpload { session_id: Uuid, detail: String },

    #[error(
        "gave up on {} of session `{session_id}` after {attempts} attempts: {last_error}",
        describe_chunk(.part_number, .offset)
    )]
    RetriesExhausted {
        session_id: Uuid,
        part_number: Option<u32>,
        offset: u64,
        attempts: u32,
        last_error: String,
    },

    #[error("upload session `{0}` was cancelled")]
    Cancelled(Uuid),

    #[error("upload session `{0}` expired")]
    SessionExpired(Uuid),

    #[error("session `{session_id}` cannot move from {from} to {to}")]
    InvalidTransition {
        session_id: Uuid,
        from: String,
        to: String,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

fn describe_chunk(part_number: &Option<u32>, offset: &u64) -> String {
    match part_number {
        Some(n) => format!("part {n}"),
        None => format!("range at offset {offset}"),
    }
}

impl UploadError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// HTTP status used when the error crosses the API boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            UploadError::InvalidInput(_)
            | UploadError::PartOutOfRange { .. }
            | UploadError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            UploadError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            UploadError::IncompleteUpload { .. } | UploadError::Cancelled(_) => {
                StatusCode::CONFLICT
            }
            UploadError::SessionExpired(_) => StatusCode::GONE,
            UploadError::ProviderRejected { .. }
            | UploadError::DestinationExpired { .. }
            | UploadError::TransientNetwork { .. } => StatusCode::BAD_GATEWAY,
            UploadError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::RetriesExhausted { .. } => StatusCode::GATEWAY_TIMEOUT,
            UploadError::Database(_) | UploadError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = err.status();
        if status.is_server_error() {
            tracing::error!(error = %err, "upload request failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
