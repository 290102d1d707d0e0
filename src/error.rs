//! Error types for the resource core.
//!
//! Programmer errors (double consumption, out-of-bounds reads) come back as
//! typed failures. Nothing in this crate aborts the process on misuse.

use std::time::Duration;
use thiserror::Error;

use crate::resource::ResourceId;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced while cleaning up a guarded resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CleanupError {
    #[error("Cleanup of {id} timed out after {}ms", .after.as_millis())]
    Timeout { id: ResourceId, after: Duration },

    #[error("Resource {0} was already cleaned up")]
    AlreadyCleanedUp(ResourceId),

    #[error("Cleanup failed: {0}")]
    Failed(String),

    #[error("Registry is shutting down")]
    ShuttingDown,

    #[error("Resource {0} is still held and has no pending cleanup")]
    NotPending(ResourceId),
}

impl CleanupError {
    /// Build a `Failed` error from any displayable cause.
    pub fn failed(cause: impl std::fmt::Display) -> Self {
        Self::Failed(cause.to_string())
    }

    /// Timeouts may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Duplicate cleanup is not an error condition for the caller.
    pub fn is_success_equivalent(&self) -> bool {
        matches!(self, Self::AlreadyCleanedUp(_))
    }

    /// Short label used for metrics and events.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::AlreadyCleanedUp(_) => "already_cleaned_up",
            Self::Failed(_) => "failed",
            Self::ShuttingDown => "shutting_down",
            Self::NotPending(_) => "not_pending",
        }
    }
}

/// Externally visible error categories an application error type can wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ResourceExhausted,
    Timeout,
    NotFound,
    InvalidLayout,
    Unavailable,
    Failed,
}

/// Errors returned by every component in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Resource {0} was already consumed")]
    ResourceConsumed(ResourceId),

    #[error(transparent)]
    Cleanup(#[from] CleanupError),

    #[error("Component is shutting down")]
    ShuttingDown,

    #[error("No tokio runtime is available to run {0}")]
    NoRuntime(&'static str),

    #[error("Timed out acquiring a connection after {}ms", .0.as_millis())]
    AcquireTimeout(Duration),

    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    #[error("Connection manager error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Invalid layout: {0}")]
    InvalidLayout(String),

    #[error("Index {index} out of bounds for view of {len} elements")]
    OutOfBounds { index: usize, len: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Map into the small set of categories surrounding systems understand.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceConsumed(_) | Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Exhausted(_) => ErrorCategory::ResourceExhausted,
            Self::Cleanup(CleanupError::Timeout { .. }) | Self::AcquireTimeout(_) => {
                ErrorCategory::Timeout
            }
            Self::Cleanup(CleanupError::AlreadyCleanedUp(_))
            | Self::Cleanup(CleanupError::NotPending(_)) => ErrorCategory::NotFound,
            Self::Cleanup(CleanupError::ShuttingDown)
            | Self::ShuttingDown
            | Self::NoRuntime(_) => ErrorCategory::Unavailable,
            Self::InvalidLayout(_) | Self::OutOfBounds { .. } => ErrorCategory::InvalidLayout,
            Self::Cleanup(CleanupError::Failed(_))
            | Self::Connection(_)
            | Self::InvalidConfig(_)
            | Self::Io(_) => ErrorCategory::Failed,
        }
    }

    /// Transient conditions that are safe to retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AcquireTimeout(_) => true,
            Self::Cleanup(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Terminal for the registry or pool instance that returned it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Cleanup(CleanupError::ShuttingDown))
    }

    pub(crate) fn connection<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let id = ResourceId::from_raw(7);
        assert_eq!(CoreError::ResourceConsumed(id).category(), ErrorCategory::NotFound);
        assert_eq!(
            CoreError::AcquireTimeout(Duration::from_millis(5)).category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            CoreError::OutOfBounds { index: 3, len: 2 }.category(),
            ErrorCategory::InvalidLayout
        );
        assert_eq!(CoreError::ShuttingDown.category(), ErrorCategory::Unavailable);
        assert_eq!(
            CoreError::Exhausted("pool".into()).category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            CoreError::NoRuntime("cleanup scheduler").category(),
            ErrorCategory::Unavailable
        );
    }

    #[test]
    fn test_retryable() {
        let id = ResourceId::from_raw(1);
        let timeout = CleanupError::Timeout { id, after: Duration::from_millis(10) };
        assert!(timeout.is_retryable());
        assert!(CoreError::from(timeout).is_retryable());
        assert!(!CoreError::InvalidLayout("odd".into()).is_retryable());
        assert!(!CleanupError::failed("boom").is_retryable());
    }

    #[test]
    fn test_already_cleaned_up_is_success_equivalent() {
        let err = CleanupError::AlreadyCleanedUp(ResourceId::from_raw(3));
        assert!(err.is_success_equivalent());
        assert_eq!(err.outcome(), "already_cleaned_up");
    }

    #[test]
    fn test_display() {
        let err = CoreError::OutOfBounds { index: 10, len: 4 };
        assert_eq!(err.to_string(), "Index 10 out of bounds for view of 4 elements");
        let err = CoreError::AcquireTimeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
