use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum AuditError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid audit options: {0}")]
    InvalidOptions(String),

    #[error("Audit queue full: {pending} pending jobs (limit {limit})")]
    QueueFull { pending: usize, limit: usize },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Page fetch failed: {0}")]
    FetchFailed(String),

    #[error("Rendering backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Rendering failed: {0}")]
    RenderFailed(String),

    #[error("Unknown job: {0}")]
    JobNotFound(String),

    #[error("Audit cancelled")]
    Cancelled,

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Semaphore acquire error: {0}")]
    SemaphoreError(String),
}

impl AuditError {
    /// Stable machine-readable code recorded on failed jobs.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuditError::InvalidUrl(_) => "invalid_url",
            AuditError::InvalidOptions(_) => "invalid_options",
            AuditError::QueueFull { .. } => "capacity",
            AuditError::Timeout(_) => "timeout",
            AuditError::FetchFailed(_) => "fetch_failed",
            AuditError::BackendUnavailable(_) => "backend_unavailable",
            AuditError::RenderFailed(_) => "render_failed",
            AuditError::JobNotFound(_) => "not_found",
            AuditError::Cancelled => "cancelled",
            AuditError::BrowserLaunchFailed(_) => "browser_launch_failed",
            AuditError::ConfigurationError(_) => "configuration",
            AuditError::Internal(_) => "internal",
            AuditError::IoError(_) => "io",
            AuditError::SerializationError(_) => "serialization",
            AuditError::SemaphoreError(_) => "semaphore",
        }
    }

    /// Whether this error fails the whole job. Phase 2 errors never do: the
    /// pipeline downgrades the report to static-only instead.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuditError::InvalidUrl(_)
                | AuditError::InvalidOptions(_)
                | AuditError::FetchFailed(_)
                | AuditError::Timeout(_)
                | AuditError::Cancelled
                | AuditError::Internal(_)
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            AuditError::InvalidUrl(_) => ErrorSeverity::Low,
            AuditError::InvalidOptions(_) => ErrorSeverity::Low,
            AuditError::JobNotFound(_) => ErrorSeverity::Low,
            AuditError::QueueFull { .. } => ErrorSeverity::Medium,
            AuditError::BackendUnavailable(_) => ErrorSeverity::Medium,
            AuditError::RenderFailed(_) => ErrorSeverity::Medium,
            AuditError::ConfigurationError(_) => ErrorSeverity::High,
            AuditError::BrowserLaunchFailed(_) => ErrorSeverity::High,
            AuditError::Internal(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl From<AcquireError> for AuditError {
    fn from(err: AcquireError) -> Self {
        AuditError::SemaphoreError(err.to_string())
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for AuditError {
    fn from(err: url::ParseError) -> Self {
        AuditError::InvalidUrl(err.to_string())
    }
}
