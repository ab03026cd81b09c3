//! Sync error types and their classification.

/// How an error affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff (timeouts, 5xx, connection reset).
    Transient,
    /// The remote could not be reached at all; fatal once repeated.
    Unreachable,
    /// Aborts the whole run (authentication, configuration).
    Fatal,
    /// A uniqueness conflict on the remote; never retried blindly.
    Conflict,
    /// A folder that does not match the expected structure or users.
    Validation,
    Canceled,
    /// Fails only the affected file.
    Permanent,
}

/// Errors produced by the sync pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] labsync_transfer::TransferError),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("repository unreachable: {0}")]
    Unreachable(String),

    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid folder: {0}")]
    InvalidFolder(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error("canceled")]
    Canceled,

    #[error("run aborted: {0}")]
    Aborted(String),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SyncError::Http { status, .. } => match status {
                401 | 403 => ErrorClass::Fatal,
                409 => ErrorClass::Conflict,
                408 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            SyncError::Timeout | SyncError::ConnectionReset => ErrorClass::Transient,
            SyncError::Unreachable(_) => ErrorClass::Unreachable,
            SyncError::Unauthorized(_) | SyncError::Config(_) | SyncError::Aborted(_) => {
                ErrorClass::Fatal
            }
            SyncError::Conflict(_) => ErrorClass::Conflict,
            SyncError::InvalidFolder(_) => ErrorClass::Validation,
            SyncError::Canceled => ErrorClass::Canceled,
            _ => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}
