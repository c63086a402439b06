//! Error types for vitalsync

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Coarse classification used by retry decisions and error surfacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Timeouts, lost connectivity, transport failures
    Network,
    /// HTTP 5xx
    Server,
    /// HTTP 401 / missing credentials
    Auth,
    /// HTTP 4xx other than 401
    Validation,
    /// Cloud storage quota exhausted
    QuotaExceeded,
    /// A payload could not be decoded
    Decode,
    /// The local store failed
    Persistence,
    /// Everything else (programming or configuration errors)
    Internal,
}

/// Main error type for vitalsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({code}): {message}")]
    Server { code: u16, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Validation error ({code}): {message}")]
    Validation { code: u16, message: String },

    #[error("Cloud quota exceeded")]
    QuotaExceeded,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "http")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "http"))]
    Http(String),

    #[error("Zone already exists: {0}")]
    ZoneAlreadyExists(String),

    #[error("Zone error: {0}")]
    Zone(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No cached response for {0}")]
    CacheMiss(String),

    #[error("Invalid sync status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Map an HTTP status and response body to an error
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 => SyncError::Unauthorized(message),
            500..=599 => SyncError::Server { code, message },
            _ => SyncError::Validation { code, message },
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Network(_) | SyncError::NotConnected => ErrorKind::Network,
            SyncError::Server { .. } => ErrorKind::Server,
            SyncError::Unauthorized(_) | SyncError::AuthenticationRequired => ErrorKind::Auth,
            SyncError::Validation { .. } => ErrorKind::Validation,
            SyncError::QuotaExceeded => ErrorKind::QuotaExceeded,
            SyncError::Decode(_) | SyncError::Serialization(_) => ErrorKind::Decode,
            SyncError::Persistence(_) | SyncError::Database(_) | SyncError::Io(_) => {
                ErrorKind::Persistence
            }
            #[cfg(feature = "http")]
            SyncError::Http(e) => classify_reqwest(e),
            #[cfg(not(feature = "http"))]
            SyncError::Http(_) => ErrorKind::Network,
            SyncError::ZoneAlreadyExists(_)
            | SyncError::Zone(_)
            | SyncError::Subscription(_)
            | SyncError::CacheMiss(_)
            | SyncError::InvalidTransition { .. }
            | SyncError::NotFound(_)
            | SyncError::Config(_)
            | SyncError::Cancelled
            | SyncError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Check if error is retryable under the standard policy
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
    }

    /// HTTP status code carried by the error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            SyncError::Server { code, .. } | SyncError::Validation { code, .. } => Some(*code),
            SyncError::Unauthorized(_) => Some(401),
            #[cfg(feature = "http")]
            SyncError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(feature = "http")]
fn classify_reqwest(e: &reqwest::Error) -> ErrorKind {
    match e.status().map(|s| s.as_u16()) {
        Some(401) => ErrorKind::Auth,
        Some(code) if code >= 500 => ErrorKind::Server,
        Some(_) => ErrorKind::Validation,
        None if e.is_decode() => ErrorKind::Decode,
        None => ErrorKind::Network,
    }
}
