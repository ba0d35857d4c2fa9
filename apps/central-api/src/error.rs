//! Error types for the Central API.
//!
//! Request-level failures map to HTTP status codes. Per-entry problems in a
//! push batch (invalid payload, unit mismatch) are not errors at this level:
//! they become `rejected` outcomes inside a 200 response.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use tally_core::{CoreError, LedgerError};

pub type CentralResult<T> = Result<T, CentralError>;

/// Central API errors.
#[derive(Debug, Error)]
pub enum CentralError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The item's ledger needs a verified count before it can be compacted.
    #[error("Integrity violation: {0}")]
    Integrity(String),

    /// Unique index hit; used to detect a racing duplicate push.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for CentralError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CentralError::NotFound("record".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                CentralError::Duplicate(db_err.message().to_string())
            }
            other => CentralError::Database(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CentralError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CentralError::Migration(err.to_string())
    }
}

impl From<serde_json::Error> for CentralError {
    fn from(err: serde_json::Error) -> Self {
        CentralError::Internal(format!("JSON: {err}"))
    }
}

impl From<LedgerError> for CentralError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::IntegrityViolation { .. } => CentralError::Integrity(err.to_string()),
            other => CentralError::Core(CoreError::Ledger(other)),
        }
    }
}

impl CentralError {
    /// Whether a failure while applying one push entry makes that entry a
    /// terminal `rejected` outcome instead of failing the request.
    pub fn is_entry_rejection(&self) -> bool {
        matches!(
            self,
            CentralError::Core(_)
                | CentralError::Integrity(_)
                | CentralError::NotFound(_)
                | CentralError::InvalidRequest(_)
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            CentralError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            CentralError::Forbidden(_) => StatusCode::FORBIDDEN,
            CentralError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CentralError::NotFound(_) => StatusCode::NOT_FOUND,
            CentralError::Integrity(_) | CentralError::Duplicate(_) => StatusCode::CONFLICT,
            CentralError::Core(_) => StatusCode::UNPROCESSABLE_ENTITY,
            CentralError::Database(_) | CentralError::Migration(_) | CentralError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for CentralError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
