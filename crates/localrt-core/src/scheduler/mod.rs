//! Task scheduler facility consumed by the system manager.
//!
//! A `System` attaches one execution context per opened device and routes
//! `submit` calls to it. The scheduler itself is an external collaborator
//! reached through [`TaskScheduler`]; [`WorkerPoolScheduler`] is the
//! thread-pool implementation shipped with the crate.
//!
//! # Sharing
//!
//! Contexts are keyed by [`ContextKey`] (system id plus device id), so one
//! scheduler can serve several systems. Use [`global`] for the lazily
//! created process-wide pool, or give each system its own instance.

pub mod error;
pub mod types;
pub mod worker_pool;

pub use error::SchedulerError;
pub use types::{
    Completion, ContextKey, ExecutionContext, SchedulerStats, SystemId, Work, WorkContext,
};
pub use worker_pool::WorkerPoolScheduler;

use once_cell::sync::OnceCell;
use std::sync::Arc;

/// Execution facility for device work.
///
/// Implementations must keep per-context FIFO dispatch and must resolve
/// every `Completion` they hand out, with `Cancelled` if the work never ran.
pub trait TaskScheduler: Send + Sync {
    /// Creates an execution context. Fails if the key is already attached.
    fn attach(&self, context: ExecutionContext) -> Result<(), SchedulerError>;

    /// Queues work on a context. Never blocks on the work itself.
    fn submit(&self, key: ContextKey, work: Work) -> Result<Completion, SchedulerError>;

    /// Cancels queued work and waits for in-flight work to finish.
    ///
    /// Returns the number of cancelled work items.
    fn drain(&self, key: ContextKey) -> Result<usize, SchedulerError>;

    /// Drains a context, then releases its resources.
    fn detach(&self, key: ContextKey) -> Result<(), SchedulerError>;

    fn stats(&self) -> SchedulerStats;
}

/// Process-wide scheduler, created on first use.
static GLOBAL: OnceCell<Arc<WorkerPoolScheduler>> = OnceCell::new();

/// Returns the shared process-wide scheduler.
pub fn global() -> Arc<dyn TaskScheduler> {
    GLOBAL
        .get_or_init(|| Arc::new(WorkerPoolScheduler::new("localrt-global")))
        .clone()
}

/// Creates a scheduler owned by a single system.
pub fn dedicated(system: SystemId) -> Arc<dyn TaskScheduler> {
    Arc::new(WorkerPoolScheduler::new(format!("localrt-{}", system.as_u64())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_is_shared() {
        let a = global();
        let b = global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_dedicated_is_distinct() {
        let a = dedicated(SystemId::next());
        let b = dedicated(SystemId::next());
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
