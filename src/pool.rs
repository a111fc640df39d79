//! Bounded worker pool with caller-runs backpressure.
//!
//! Wraps a rayon thread pool with:
//! - A fixed queue capacity counted across submitted-but-not-started tasks
//! - Caller-runs fallback: when the queue is full the submitting thread runs
//!   the task itself, trading submitter latency for bounded memory
//! - Graceful, idempotent shutdown: stop accepting, drain for a bounded time,
//!   then cancel whatever is still queued
//!
//! A cancelled task is dropped without running, so any guard it captured
//! observes the cancellation in its `Drop`.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, ShutdownReport};

thread_local! {
    /// Set while this thread runs a task inline under caller-runs.
    static RUNNING_INLINE: Cell<bool> = const { Cell::new(false) };
}

/// Where a submitted task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Queued for a worker thread
    Queued,
    /// Run to completion on the submitting thread because the queue was full
    CallerRan,
}

#[derive(Debug, Default)]
struct PoolState {
    /// Submitted to rayon but not yet picked up by a worker
    queued: AtomicUsize,
    /// Queued + running, including caller-runs tasks
    in_flight: Mutex<usize>,
    idle: Condvar,
    shutdown: AtomicBool,
    cancelled: AtomicBool,
    caller_runs: AtomicUsize,
}

impl PoolState {
    fn in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until nothing is in flight or `timeout` passes. Returns the
    /// number of tasks still in flight.
    fn wait_idle(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut in_flight = self.in_flight();
        while *in_flight > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            in_flight = self
                .idle
                .wait_timeout(in_flight, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        *in_flight
    }
}

/// Counts a task as in flight until dropped, even if the task panics.
struct InFlightGuard {
    state: Arc<PoolState>,
}

impl InFlightGuard {
    fn enter(state: &Arc<PoolState>) -> Self {
        *state.in_flight() += 1;
        Self {
            state: Arc::clone(state),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.state.in_flight();
        *in_flight = in_flight.saturating_sub(1);
        if *in_flight == 0 {
            self.state.idle.notify_all();
        }
    }
}

/// Fixed-size worker pool shared by tracking and reward tasks.
pub struct WorkerPool {
    threads: rayon::ThreadPool,
    state: Arc<PoolState>,
    size: usize,
    queue_capacity: usize,
}

impl WorkerPool {
    pub fn new(size: usize, queue_capacity: usize) -> Result<Self, EngineError> {
        let size = size.max(1);
        let threads = rayon::ThreadPoolBuilder::new()
            .num_threads(size)
            .thread_name(|i| format!("reward-worker-{}", i))
            .panic_handler(|_| error!("[WorkerPool] Task panicked on a worker thread"))
            .build()
            .map_err(|e| EngineError::ThreadSpawn(e.to_string()))?;

        info!(
            "[WorkerPool] Started {} workers, queue capacity {}",
            size, queue_capacity
        );

        Ok(Self {
            threads,
            state: Arc::new(PoolState::default()),
            size,
            queue_capacity: queue_capacity.max(1),
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        Self::new(config.pool_size(), config.queue_capacity)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }

    /// Tasks queued or running.
    pub fn in_flight(&self) -> usize {
        *self.state.in_flight()
    }

    /// How many tasks ran on a submitting thread because the queue was full.
    pub fn caller_runs(&self) -> usize {
        self.state.caller_runs.load(Ordering::Relaxed)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.shutdown.load(Ordering::SeqCst)
    }

    /// Submit a task.
    ///
    /// Queues the task when there is room; otherwise runs it on the calling
    /// thread before returning. Fails with [`EngineError::Shutdown`] once
    /// shutdown has begun, and with [`EngineError::Capacity`] when the queue
    /// is full and the caller is already running a task inline.
    pub fn submit<F>(&self, task: F) -> Result<Dispatch, EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        // Count the task before checking the flag so a concurrent shutdown
        // either sees it in flight or rejects it
        let guard = InFlightGuard::enter(&self.state);
        if self.is_shutdown() {
            return Err(EngineError::Shutdown);
        }

        let reserved = self
            .state
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                (queued < self.queue_capacity).then_some(queued + 1)
            })
            .is_ok();

        if reserved {
            let state = Arc::clone(&self.state);
            self.threads.spawn(move || {
                let _guard = guard;
                state.queued.fetch_sub(1, Ordering::AcqRel);
                if state.cancelled.load(Ordering::Acquire) {
                    drop(task);
                    return;
                }
                task();
            });
            return Ok(Dispatch::Queued);
        }

        if RUNNING_INLINE.with(Cell::get) {
            return Err(EngineError::Capacity {
                pending: self.queued(),
                capacity: self.queue_capacity,
            });
        }

        self.state.caller_runs.fetch_add(1, Ordering::Relaxed);
        debug!("[WorkerPool] Queue full ({}), running task on the caller", self.queue_capacity);

        RUNNING_INLINE.with(|inline| inline.set(true));
        let result = panic::catch_unwind(AssertUnwindSafe(task));
        RUNNING_INLINE.with(|inline| inline.set(false));
        drop(guard);

        if result.is_err() {
            error!("[WorkerPool] Task panicked on the submitting thread");
        }
        Ok(Dispatch::CallerRan)
    }

    /// Block until no task is queued or running, or `timeout` passes.
    /// Returns true if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.state.wait_idle(timeout) == 0
    }

    /// Stop accepting work and drain.
    ///
    /// Waits up to `drain_timeout` for in-flight tasks. Anything still queued
    /// afterwards is cancelled; tasks already running finish on their own.
    /// Calling this again is a no-op that reports `initiated: false`.
    pub fn shutdown(&self, drain_timeout: Duration) -> ShutdownReport {
        if self.state.shutdown.swap(true, Ordering::SeqCst) {
            debug!("[WorkerPool] Shutdown already requested");
            let outstanding = self.in_flight();
            return ShutdownReport {
                initiated: false,
                drained: outstanding == 0,
                outstanding,
                waited: Duration::ZERO,
            };
        }

        let start = Instant::now();
        info!(
            "[WorkerPool] Shutting down, draining {} in-flight tasks (timeout {:?})",
            self.in_flight(),
            drain_timeout
        );

        let outstanding = self.state.wait_idle(drain_timeout);
        if outstanding > 0 {
            self.state.cancelled.store(true, Ordering::Release);
            warn!(
                "[WorkerPool] {} tasks still in flight after {:?}, cancelling queued work",
                outstanding, drain_timeout
            );
        } else {
            info!("[WorkerPool] Drained in {:?}", start.elapsed());
        }

        ShutdownReport {
            initiated: true,
            drained: outstanding == 0,
            outstanding,
            waited: start.elapsed(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queue_capacity", &self.queue_capacity)
            .field("queued", &self.queued())
            .field("in_flight", &self.in_flight())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
