//! Core types for the task scheduler.
//!
//! Execution contexts are keyed by owning system and device, work items are
//! boxed closures, and every submission hands back a [`Completion`].

use super::error::SchedulerError;
use crate::device::DeviceId;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

static NEXT_SYSTEM_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one `System`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SystemId(u64);

impl SystemId {
    /// Allocates a fresh identity.
    pub fn next() -> Self {
        SystemId(NEXT_SYSTEM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        SystemId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "system#{}", self.0)
    }
}

/// Key of one execution context: the owning system plus the device.
///
/// Two systems sharing a scheduler use distinct keys even for the same
/// physical device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ContextKey {
    pub system: SystemId,
    pub device: DeviceId,
}

impl ContextKey {
    pub fn new(system: SystemId, device: DeviceId) -> Self {
        Self { system, device }
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.system, self.device)
    }
}

/// Parameters for attaching an execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    pub key: ContextKey,
    /// Number of work items executed concurrently (worker threads).
    pub width: usize,
}

/// What a running work item knows about where it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkContext {
    pub device: DeviceId,
    /// Index of the worker thread within the context.
    pub worker: usize,
}

/// A unit of work submitted to an execution context.
pub type Work = Box<dyn FnOnce(&WorkContext) + Send + 'static>;

/// Pending result of one submitted work item.
///
/// Resolves to `Ok(())` once the work ran, or to an error if it was
/// cancelled, panicked, or the scheduler went away. Await it from async
/// code, or call [`Completion::wait`] from a plain thread.
#[must_use = "a Completion does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), SchedulerError>>,
}

pub(crate) type CompletionSender = oneshot::Sender<Result<(), SchedulerError>>;

impl Completion {
    pub(crate) fn channel() -> (CompletionSender, Completion) {
        let (tx, rx) = oneshot::channel();
        (tx, Completion { rx })
    }

    /// Blocks the current thread until the work finishes.
    ///
    /// Must not be called from within an async runtime.
    pub fn wait(self) -> Result<(), SchedulerError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(SchedulerError::ResponseDropped))
    }
}

impl Future for Completion {
    type Output = Result<(), SchedulerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(SchedulerError::ResponseDropped)))
    }
}

/// Scheduler statistics for monitoring.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Attached execution contexts
    pub contexts: usize,
    /// Work items waiting in queues
    pub queued: usize,
    /// Work items currently running
    pub in_flight: usize,
    /// Work items finished (including panicked ones)
    pub completed: u64,
    /// Work items cancelled before running
    pub cancelled: u64,
}
