//! Error types for idletrace-core

use thiserror::Error;

/// Errors surfaced by the tracing core
///
/// Lifecycle edge cases (double finish, heartbeat after finish, popping an
/// unknown activity) are not errors and never produce one of these.
#[derive(Debug, Error)]
pub enum TraceError {
    /// Timers need a tokio runtime to be spawned on
    #[error("No tokio runtime available to drive transaction timers")]
    NoRuntime,

    /// Invalid options
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error (file reporters)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A reporter refused or failed to accept an event
    #[error("Report failed: {0}")]
    Report(String),
}

impl TraceError {
    /// Check if this error came from a reporter sink
    pub fn is_report_error(&self) -> bool {
        matches!(
            self,
            TraceError::Report(_) | TraceError::Io(_) | TraceError::Serialization(_)
        )
    }
}

/// Result type for tracing operations
pub type TraceResult<T> = Result<T, TraceError>;
