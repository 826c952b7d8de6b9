//! Thread-pool task scheduler.
//!
//! Every attached execution context gets its own FIFO queue and `width`
//! dedicated worker threads. Work from one submitter to one context is
//! dispatched in submission order; contexts never share threads, so a slow
//! device cannot starve another.
//!
//! ```text
//! ┌──────────────┐  submit   ┌───────────────────┐  pop   ┌──────────────┐
//! │   System     │──────────▶│ queue (per key)   │───────▶│ worker 0..N  │
//! │ (any thread) │           │ Mutex<VecDeque>   │        │ named thread │
//! └──────────────┘           └───────────────────┘        └──────────────┘
//!        ▲                                                        │
//!        └──────────────────── Completion (oneshot) ◀─────────────┘
//! ```

use super::error::SchedulerError;
use super::types::{
    Completion, CompletionSender, ContextKey, ExecutionContext, SchedulerStats, Work, WorkContext,
};
use super::TaskScheduler;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Scheduler that runs each execution context on dedicated worker threads.
///
/// # Thread Safety
///
/// - Queue state: one `Mutex` per context, never held while work runs
/// - Context table: `Mutex<HashMap>`, held only to look up or swap entries
/// - Statistics: atomics, readable without locking
///
/// `drain` and `detach` block until in-flight work finishes, so they must
/// not be called from inside a work item of the same context.
pub struct WorkerPoolScheduler {
    /// Prefix for worker thread names
    name: String,
    contexts: Mutex<HashMap<ContextKey, Attached>>,
    stats: Arc<StatsInner>,
}

struct Attached {
    queue: Arc<ContextQueue>,
    workers: Vec<JoinHandle<()>>,
}

struct ContextQueue {
    state: Mutex<QueueState>,
    /// Signalled when work is pushed or the queue closes
    available: Condvar,
    /// Signalled when the queue becomes empty with nothing in flight
    idle: Condvar,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    in_flight: usize,
    closed: bool,
}

struct Job {
    work: Work,
    done: CompletionSender,
}

#[derive(Default)]
struct StatsInner {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    cancelled: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ContextQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            idle: Condvar::new(),
        }
    }

    fn close(&self) {
        lock(&self.state).closed = true;
        self.available.notify_all();
    }

    /// Removes every queued job and resolves it as cancelled.
    fn cancel_queued(&self, stats: &StatsInner) -> usize {
        let jobs: Vec<Job> = lock(&self.state).jobs.drain(..).collect();
        let count = jobs.len();
        stats.queued.fetch_sub(count, Ordering::Relaxed);
        stats.cancelled.fetch_add(count as u64, Ordering::Relaxed);
        for job in jobs {
            let _ = job.done.send(Err(SchedulerError::Cancelled));
        }
        count
    }

    fn wait_idle(&self) {
        let mut state = lock(&self.state);
        while state.in_flight > 0 || !state.jobs.is_empty() {
            state = self
                .idle
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl WorkerPoolScheduler {
    /// Creates an empty scheduler. Threads are spawned per attached context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contexts: Mutex::new(HashMap::new()),
            stats: Arc::new(StatsInner::default()),
        }
    }

    fn queue(&self, key: &ContextKey) -> Result<Arc<ContextQueue>, SchedulerError> {
        lock(&self.contexts)
            .get(key)
            .map(|attached| attached.queue.clone())
            .ok_or(SchedulerError::NotAttached(*key))
    }

    fn spawn_worker(
        &self,
        queue: Arc<ContextQueue>,
        ctx: WorkContext,
    ) -> Result<JoinHandle<()>, SchedulerError> {
        let stats = self.stats.clone();
        thread::Builder::new()
            .name(format!("{}-{}-w{}", self.name, ctx.device, ctx.worker))
            .spawn(move || Self::worker_loop(queue, ctx, stats))
            .map_err(|e| SchedulerError::ThreadSpawnFailed(e.to_string()))
    }

    /// Worker thread main loop.
    fn worker_loop(queue: Arc<ContextQueue>, ctx: WorkContext, stats: Arc<StatsInner>) {
        debug!("Worker {} for {} started", ctx.worker, ctx.device);

        loop {
            // Phase 1: wait for the next job, or exit once closed and empty
            let job = {
                let mut state = lock(&queue.state);
                loop {
                    if let Some(job) = state.jobs.pop_front() {
                        state.in_flight += 1;
                        break job;
                    }
                    if state.closed {
                        debug!("Worker {} for {} exiting", ctx.worker, ctx.device);
                        return;
                    }
                    state = queue
                        .available
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            };
            stats.queued.fetch_sub(1, Ordering::Relaxed);
            stats.in_flight.fetch_add(1, Ordering::Relaxed);

            // Phase 2: run it outside the lock
            let Job { work, done } = job;
            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(&ctx))) {
                Ok(()) => Ok(()),
                Err(_) => {
                    warn!("Work item panicked on {} worker {}", ctx.device, ctx.worker);
                    Err(SchedulerError::WorkPanicked)
                }
            };
            // Counted before the completion resolves so waiters see it
            stats.in_flight.fetch_sub(1, Ordering::Relaxed);
            stats.completed.fetch_add(1, Ordering::Relaxed);
            let _ = done.send(outcome);

            let mut state = lock(&queue.state);
            state.in_flight -= 1;
            if state.in_flight == 0 && state.jobs.is_empty() {
                queue.idle.notify_all();
            }
        }
    }

    fn join_workers(key: &ContextKey, workers: Vec<JoinHandle<()>>) {
        for worker in workers {
            if worker.join().is_err() {
                warn!("Worker thread for {} terminated abnormally", key);
            }
        }
    }
}

impl TaskScheduler for WorkerPoolScheduler {
    fn attach(&self, context: ExecutionContext) -> Result<(), SchedulerError> {
        let key = context.key;
        let mut contexts = lock(&self.contexts);
        if contexts.contains_key(&key) {
            return Err(SchedulerError::AlreadyAttached(key));
        }

        let queue = Arc::new(ContextQueue::new());
        let width = context.width.max(1);
        let mut workers = Vec::with_capacity(width);
        for worker in 0..width {
            let ctx = WorkContext {
                device: key.device,
                worker,
            };
            match self.spawn_worker(queue.clone(), ctx) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    queue.close();
                    Self::join_workers(&key, workers);
                    return Err(e);
                }
            }
        }

        info!("Attached execution context {} ({} workers)", key, width);
        contexts.insert(key, Attached { queue, workers });
        Ok(())
    }

    fn submit(&self, key: ContextKey, work: Work) -> Result<Completion, SchedulerError> {
        let queue = self.queue(&key)?;
        let (done, completion) = Completion::channel();
        {
            let mut state = lock(&queue.state);
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            state.jobs.push_back(Job { work, done });
            self.stats.queued.fetch_add(1, Ordering::Relaxed);
        }
        queue.available.notify_one();
        Ok(completion)
    }

    fn drain(&self, key: ContextKey) -> Result<usize, SchedulerError> {
        let queue = self.queue(&key)?;
        let cancelled = queue.cancel_queued(&self.stats);
        queue.wait_idle();
        debug!("Drained {} ({} queued items cancelled)", key, cancelled);
        Ok(cancelled)
    }

    fn detach(&self, key: ContextKey) -> Result<(), SchedulerError> {
        let attached = lock(&self.contexts)
            .remove(&key)
            .ok_or(SchedulerError::NotAttached(key))?;
        attached.queue.close();
        attached.queue.cancel_queued(&self.stats);
        attached.queue.wait_idle();
        Self::join_workers(&key, attached.workers);
        info!("Detached execution context {}", key);
        Ok(())
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            contexts: lock(&self.contexts).len(),
            queued: self.stats.queued.load(Ordering::Relaxed),
            in_flight: self.stats.in_flight.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            cancelled: self.stats.cancelled.load(Ordering::Relaxed),
        }
    }
}

impl Drop for WorkerPoolScheduler {
    fn drop(&mut self) {
        let contexts: Vec<(ContextKey, Attached)> = lock(&self.contexts).drain().collect();
        for (key, attached) in contexts {
            attached.queue.close();
            attached.queue.cancel_queued(&self.stats);
            Self::join_workers(&key, attached.workers);
        }
    }
}
