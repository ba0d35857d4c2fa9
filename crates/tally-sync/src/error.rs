//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │  (retryable)    │  │                         │ │
//! │  │  InvalidConfig  │  │  Connection     │  │  InvalidResponse        │ │
//! │  │  MissingDeviceId│  │  Timeout        │  │  SerializationFailed    │ │
//! │  │  InvalidUrl     │  │  ServerError 5xx│  │  Rejected (4xx)         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐                              │
//! │  │    Database     │  │   Lifecycle     │                              │
//! │  │                 │  │                 │                              │
//! │  │  DatabaseError  │  │  Cancelled      │                              │
//! │  │                 │  │  Unauthorized   │                              │
//! │  └─────────────────┘  └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Missing device ID (required for sync).
    #[error("Device ID not configured. Run initial setup first.")]
    MissingDeviceId,

    /// Missing account ID (required for sync).
    #[error("Account ID not configured")]
    MissingAccountId,

    /// Invalid central store URL.
    #[error("Invalid central URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Could not reach the central store.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A network call exceeded its deadline.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// The central store answered with a 5xx status.
    #[error("Central store error {status}: {message}")]
    ServerError { status: u16, message: String },

    /// The credential was refused (401/403).
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The central store refused the request itself (4xx other than auth).
    #[error("Request rejected with {status}: {message}")]
    RequestRejected { status: u16, message: String },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Response body did not match the protocol.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Failed to serialize a request.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Device store operation failed.
    #[error("Database error: {0}")]
    DatabaseError(#[from] tally_db::DbError),

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// The cycle was cancelled by shutdown.
    #[error("Sync cancelled")]
    Cancelled,

    /// Internal sync agent error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if this error is transient and the cycle can be retried.
    ///
    /// ## Retryable Errors
    /// - Connection failures (network issues)
    /// - Timeouts
    /// - HTTP 5xx from the central store
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - Rejected requests and credentials
    /// - Protocol mismatches
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ConnectionFailed(_) | SyncError::Timeout(_) | SyncError::ServerError { .. }
        )
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::MissingDeviceId
                | SyncError::MissingAccountId
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Maps an HTTP status and body to an error.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => SyncError::Unauthorized(message),
            500..=599 => SyncError::ServerError { status, message },
            _ => SyncError::RequestRejected { status, message },
        }
    }
}
