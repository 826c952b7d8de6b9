//! Error types for the task scheduler.

use super::types::ContextKey;
use thiserror::Error;

/// Errors that can occur in the task scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No execution context is attached under this key
    #[error("No execution context attached for {0}")]
    NotAttached(ContextKey),

    /// An execution context is already attached under this key
    #[error("Execution context already attached for {0}")]
    AlreadyAttached(ContextKey),

    /// Context is draining or detached and accepts no more work
    #[error("Execution context is closed")]
    Closed,

    /// Work was removed from the queue before it ran
    #[error("Work cancelled before execution")]
    Cancelled,

    /// Work panicked while running on a worker thread
    #[error("Work panicked on worker thread")]
    WorkPanicked,

    /// Failed to spawn a worker thread
    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),

    /// Completion sender dropped without a result
    #[error("Completion dropped without a result")]
    ResponseDropped,
}

impl From<SchedulerError> for String {
    fn from(err: SchedulerError) -> String {
        err.to_string()
    }
}
