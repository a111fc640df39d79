//! Batch orchestration over the worker pool.
//!
//! A batch fans one task per user out to the [`WorkerPool`] in fixed-size
//! sub-batches and hands back a [`BatchHandle`], the single completion signal
//! for the whole batch.
//!
//! ## Lifecycle
//!
//! ```text
//! Submitted ──▶ Running ──▶ Completed
//!                    │
//!                    ├────▶ TimedOut   (wait_timeout expired)
//!                    └────▶ Cancelled  (cancel() or pool shutdown)
//! ```
//!
//! Every user settles exactly once as completed, failed or cancelled, so
//! `completed + failed + cancelled == total` once the batch has finished.
//! One user's failure never stops its siblings. Nothing is retried; a
//! caller that wants another attempt submits a new batch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::pool::{Dispatch, WorkerPool};
use crate::rewards::RewardAccumulator;
use crate::tracker::LocationTracker;
use crate::user::User;

/// What a batch does for each user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BatchKind {
    Tracking,
    Rewards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BatchState {
    Submitted,
    Running,
    Completed,
    TimedOut,
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Cancelled)
    }
}

/// Snapshot of a batch's progress.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchReport {
    pub kind: BatchKind,
    pub state: BatchState,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Users whose task returned an error or panicked
    pub failed_users: Vec<Uuid>,
    /// Users whose task never ran
    pub cancelled_users: Vec<Uuid>,
    pub elapsed: Duration,
}

impl BatchReport {
    /// Users whose task has finished one way or another.
    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    pub fn is_finished(&self) -> bool {
        self.settled() == self.total
    }

    /// Share of users processed successfully, in `[0, 1]`.
    pub fn completed_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.completed as f64 / self.total as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct Progress {
    state: BatchState,
    completed: usize,
    failed: usize,
    cancelled: usize,
    failed_users: Vec<Uuid>,
    cancelled_users: Vec<Uuid>,
    finished_at: Option<Instant>,
}

impl Progress {
    fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

#[derive(Debug)]
struct BatchShared {
    kind: BatchKind,
    total: usize,
    started: Instant,
    cancel_requested: AtomicBool,
    progress: Mutex<Progress>,
    settled: Condvar,
}

impl BatchShared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, progress: &Progress) -> BatchReport {
        let end = progress.finished_at.unwrap_or_else(Instant::now);
        BatchReport {
            kind: self.kind,
            state: progress.state,
            total: self.total,
            completed: progress.completed,
            failed: progress.failed,
            cancelled: progress.cancelled,
            failed_users: progress.failed_users.clone(),
            cancelled_users: progress.cancelled_users.clone(),
            elapsed: end.duration_since(self.started),
        }
    }

    fn mark_running(&self) {
        let mut progress = self.progress();
        if progress.state == BatchState::Submitted {
            progress.state = BatchState::Running;
        }
    }

    fn settle(&self, user_id: Uuid, outcome: TaskOutcome) {
        let mut progress = self.progress();
        match outcome {
            TaskOutcome::Completed => progress.completed += 1,
            TaskOutcome::Failed => {
                progress.failed += 1;
                progress.failed_users.push(user_id);
            }
            TaskOutcome::Cancelled => {
                progress.cancelled += 1;
                progress.cancelled_users.push(user_id);
            }
        }

        if progress.settled() < self.total {
            return;
        }
        self.finish(&mut progress);
        info!(
            "[Batch] {:?} batch finished as {:?}: {}/{} completed, {} failed, {} cancelled in {:?}",
            self.kind,
            progress.state,
            progress.completed,
            self.total,
            progress.failed,
            progress.cancelled,
            self.started.elapsed()
        );
    }

    fn finish(&self, progress: &mut Progress) {
        progress.finished_at = Some(Instant::now());
        progress.state = match progress.state {
            BatchState::TimedOut => BatchState::TimedOut,
            _ if self.cancel_requested.load(Ordering::Acquire) || progress.cancelled > 0 => {
                BatchState::Cancelled
            }
            _ => BatchState::Completed,
        };
        self.settled.notify_all();
    }
}

/// Aggregate completion signal for one batch. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    shared: Arc<BatchShared>,
}

impl BatchHandle {
    fn new(kind: BatchKind, total: usize) -> Self {
        let shared = Arc::new(BatchShared {
            kind,
            total,
            started: Instant::now(),
            cancel_requested: AtomicBool::new(false),
            progress: Mutex::new(Progress {
                state: BatchState::Submitted,
                completed: 0,
                failed: 0,
                cancelled: 0,
                failed_users: Vec::new(),
                cancelled_users: Vec::new(),
                finished_at: None,
            }),
            settled: Condvar::new(),
        });
        if total == 0 {
            shared.finish(&mut shared.progress());
        }
        Self { shared }
    }

    fn ticket(&self, user_id: Uuid) -> TaskTicket {
        TaskTicket {
            shared: Arc::clone(&self.shared),
            user_id,
            settled: false,
        }
    }

    pub fn kind(&self) -> BatchKind {
        self.shared.kind
    }

    pub fn total(&self) -> usize {
        self.shared.total
    }

    pub fn state(&self) -> BatchState {
        self.shared.progress().state
    }

    pub fn is_finished(&self) -> bool {
        self.shared.progress().settled() == self.shared.total
    }

    /// Current progress without waiting.
    pub fn report(&self) -> BatchReport {
        let progress = self.shared.progress();
        self.shared.report(&progress)
    }

    /// Ask queued tasks of this batch to skip their work.
    ///
    /// Best effort: tasks already running, and provider calls already
    /// issued, run to completion.
    pub fn cancel(&self) {
        if !self.shared.cancel_requested.swap(true, Ordering::AcqRel) {
            info!("[Batch] Cancellation requested for {:?} batch", self.shared.kind);
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel_requested.load(Ordering::Acquire)
    }

    /// Block until every user has settled or `timeout` passes, leaving the
    /// batch state alone. Returns whether the batch finished.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress();
        while progress.settled() < self.shared.total {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            progress = self
                .shared
                .settled
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Block until every user has settled.
    pub fn wait(&self) -> BatchReport {
        let mut progress = self.shared.progress();
        while progress.settled() < self.shared.total {
            progress = self
                .shared
                .settled
                .wait(progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.shared.report(&progress)
    }

    /// Block until every user has settled or `timeout` passes.
    ///
    /// On timeout the batch moves to [`BatchState::TimedOut`], its queued
    /// work is cancelled, and the returned report shows how far it got.
    pub fn wait_timeout(&self, timeout: Duration) -> BatchReport {
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress();
        while progress.settled() < self.shared.total {
            let now = Instant::now();
            if now >= deadline {
                progress.state = BatchState::TimedOut;
                self.shared.cancel_requested.store(true, Ordering::Release);
                let report = self.shared.report(&progress);
                warn!(
                    "[Batch] {:?} batch timed out after {:?}: {:.1}% completed ({}/{})",
                    self.shared.kind,
                    timeout,
                    report.completed_fraction() * 100.0,
                    report.completed,
                    report.total
                );
                return report;
            }
            progress = self
                .shared
                .settled
                .wait_timeout(progress, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        self.shared.report(&progress)
    }
}

/// One user's slot in a batch. Settles exactly once.
///
/// Dropped without settling it counts as cancelled, or as failed when
/// dropped during a panic.
struct TaskTicket {
    shared: Arc<BatchShared>,
    user_id: Uuid,
    settled: bool,
}

impl TaskTicket {
    fn finish(mut self, outcome: TaskOutcome) {
        self.settled = true;
        self.shared.settle(self.user_id, outcome);
    }
}

impl Drop for TaskTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let outcome = if thread::panicking() {
            TaskOutcome::Failed
        } else {
            TaskOutcome::Cancelled
        };
        self.shared.settle(self.user_id, outcome);
    }
}

fn run_task<W>(ticket: TaskTicket, user: &Arc<User>, work: &W)
where
    W: Fn(&Arc<User>) -> Result<(), String>,
{
    if ticket.shared.cancel_requested.load(Ordering::Acquire) {
        ticket.finish(TaskOutcome::Cancelled);
        return;
    }

    ticket.shared.mark_running();
    match work(user) {
        Ok(()) => ticket.finish(TaskOutcome::Completed),
        Err(reason) => {
            warn!("[Batch] User {} failed: {}", user.user_name(), reason);
            ticket.finish(TaskOutcome::Failed);
        }
    }
}

/// Runs tracking or reward computation for many users at once.
#[derive(Debug)]
pub struct BatchOrchestrator {
    pool: Arc<WorkerPool>,
    tracker: Arc<LocationTracker>,
    accumulator: Arc<RewardAccumulator>,
    sub_batch_size: usize,
}

impl BatchOrchestrator {
    pub fn new(
        pool: Arc<WorkerPool>,
        tracker: Arc<LocationTracker>,
        accumulator: Arc<RewardAccumulator>,
        sub_batch_size: usize,
    ) -> Self {
        Self {
            pool,
            tracker,
            accumulator,
            sub_batch_size: sub_batch_size.max(1),
        }
    }

    /// Track every user's current location.
    ///
    /// A GPS failure marks that user failed; rewards are scheduled per user
    /// and are not part of this batch's completion.
    pub fn track_all(&self, users: &[Arc<User>]) -> Result<BatchHandle, EngineError> {
        let tracker = Arc::clone(&self.tracker);
        self.submit(BatchKind::Tracking, users, move |user| {
            tracker.track(user).map(|_| ()).map_err(|e| e.to_string())
        })
    }

    /// Compute rewards for every user.
    ///
    /// A user is marked failed when scoring failed for any of its qualifying
    /// attractions, so callers can tell whose rewards may be incomplete.
    pub fn calculate_rewards_for_all(&self, users: &[Arc<User>]) -> Result<BatchHandle, EngineError> {
        let accumulator = Arc::clone(&self.accumulator);
        self.submit(BatchKind::Rewards, users, move |user| {
            let outcome = accumulator.calculate_rewards(user);
            if outcome.provider_failures > 0 {
                return Err(format!(
                    "scoring failed for {} attractions",
                    outcome.provider_failures
                ));
            }
            Ok(())
        })
    }

    fn submit<W>(&self, kind: BatchKind, users: &[Arc<User>], work: W) -> Result<BatchHandle, EngineError>
    where
        W: Fn(&Arc<User>) -> Result<(), String> + Send + Sync + 'static,
    {
        if self.pool.is_shutdown() {
            return Err(EngineError::Shutdown);
        }

        let handle = BatchHandle::new(kind, users.len());
        let work = Arc::new(work);
        info!(
            "[Batch] Submitting {:?} batch of {} users in sub-batches of {}",
            kind,
            users.len(),
            self.sub_batch_size
        );

        for (index, chunk) in users.chunks(self.sub_batch_size).enumerate() {
            let mut caller_ran = 0;
            for user in chunk {
                let user_id = user.id();
                let ticket = handle.ticket(user_id);
                let user = Arc::clone(user);
                let work = Arc::clone(&work);

                match self.pool.submit(move || run_task(ticket, &user, work.as_ref())) {
                    Ok(Dispatch::Queued) => {}
                    Ok(Dispatch::CallerRan) => caller_ran += 1,
                    // The rejected task was dropped, settling its ticket as cancelled
                    Err(e) => warn!("[Batch] User {} not submitted: {}", user_id, e),
                }
            }
            debug!(
                "[Batch] Sub-batch {} submitted: {} users, {} ran on the caller",
                index,
                chunk.len(),
                caller_ran
            );
        }

        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKeyPolicy, RewardPointCache};
    use crate::catalog::AttractionCatalog;
    use crate::simulation::{SimulatedGps, SimulatedRewardCentral};
    use crate::{Attraction, Coordinate, VisitedLocation};

    struct Fixture {
        pool: Arc<WorkerPool>,
        gps: Arc<SimulatedGps>,
        orchestrator: BatchOrchestrator,
    }

    fn fixture(gps: SimulatedGps, scoring: SimulatedRewardCentral, workers: usize, queue: usize) -> Fixture {
        let attractions = vec![
            Attraction::new("origin", "", "", Coordinate::new(0.0, 0.0)),
            Attraction::new("north", "", "", Coordinate::new(45.0, 0.0)),
        ];
        fixture_with(attractions, gps, scoring, workers, queue)
    }

    fn fixture_with(
        attractions: Vec<Attraction>,
        gps: SimulatedGps,
        scoring: SimulatedRewardCentral,
        workers: usize,
        queue: usize,
    ) -> Fixture {
        let catalog = Arc::new(AttractionCatalog::from_attractions(attractions));
        let cache = Arc::new(RewardPointCache::new(
            Arc::new(scoring),
            Duration::from_secs(3600),
            1000,
            CacheKeyPolicy::PerAttraction,
        ));
        let accumulator = Arc::new(RewardAccumulator::new(catalog, cache, 10.0));
        let pool = Arc::new(WorkerPool::new(workers, queue).unwrap());
        let gps = Arc::new(gps);
        let tracker = Arc::new(LocationTracker::new(
            Arc::clone(&gps) as Arc<dyn crate::GpsProvider>,
            Arc::clone(&accumulator),
            Arc::clone(&pool),
        ));
        let orchestrator = BatchOrchestrator::new(Arc::clone(&pool), tracker, accumulator, 10);
        Fixture { pool, gps, orchestrator }
    }

    fn users(n: usize) -> Vec<Arc<User>> {
        (0..n)
            .map(|i| Arc::new(User::new(Uuid::new_v4(), format!("user{}", i), "000", "user@example.com")))
            .collect()
    }

    #[test]
    fn test_track_all_settles_every_user() {
        let f = fixture(SimulatedGps::instant(), SimulatedRewardCentral::instant(), 4, 50);
        let users = users(250);

        let report = f.orchestrator.track_all(&users).unwrap().wait();

        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.completed, 250);
        assert_eq!(report.completed + report.failed, users.len());
        assert!(users.iter().all(|u| u.visited_location_count() == 1));
        assert!(f.pool.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_gps_failure_is_isolated_to_its_user() {
        let f = fixture(SimulatedGps::instant(), SimulatedRewardCentral::instant(), 4, 50);
        let users = users(20);
        f.gps.fail_for(users[3].id());
        f.gps.fail_for(users[11].id());

        let report = f.orchestrator.track_all(&users).unwrap().wait();

        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.completed, 18);
        assert_eq!(report.failed, 2);
        assert!(report.failed_users.contains(&users[3].id()));
        assert!(report.failed_users.contains(&users[11].id()));
        assert_eq!(users[4].visited_location_count(), 1);
    }

    #[test]
    fn test_rewards_for_all_awards_each_user() {
        let f = fixture(SimulatedGps::instant(), SimulatedRewardCentral::instant(), 4, 50);
        let users = users(10);
        for user in &users {
            user.add_visited_location(VisitedLocation::now(user.id(), Coordinate::new(0.0, 0.0)));
        }

        let report = f.orchestrator.calculate_rewards_for_all(&users).unwrap().wait();

        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.completed, 10);
        assert!(users.iter().all(|u| u.reward_count() == 1));
    }

    #[test]
    fn test_rewards_for_all_marks_scoring_failures() {
        let origin = Attraction::new("origin", "", "", Coordinate::new(0.0, 0.0));
        let broken = Attraction::new("broken", "", "", Coordinate::new(0.0, 0.05));
        let scoring = SimulatedRewardCentral::instant();
        scoring.fail_for(broken.id);
        let f = fixture_with(vec![origin, broken], SimulatedGps::instant(), scoring, 4, 50);
        let users = users(6);
        for user in &users[..3] {
            user.add_visited_location(VisitedLocation::now(user.id(), Coordinate::new(0.0, 0.0)));
        }

        let report = f.orchestrator.calculate_rewards_for_all(&users).unwrap().wait();

        // Users without history have nothing to score
        assert_eq!(report.completed, 3);
        assert_eq!(report.failed, 3);
        assert_eq!(report.completed + report.failed, users.len());
        assert!(users[..3].iter().all(|u| u.reward_count() == 1));
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let f = fixture(SimulatedGps::instant(), SimulatedRewardCentral::instant(), 2, 10);

        let handle = f.orchestrator.calculate_rewards_for_all(&[]).unwrap();

        assert!(handle.is_finished());
        assert_eq!(handle.state(), BatchState::Completed);
        assert_eq!(handle.wait().completed_fraction(), 1.0);
    }

    #[test]
    fn test_timeout_reports_partial_progress() {
        let f = fixture(
            SimulatedGps::new(Duration::from_millis(50)),
            SimulatedRewardCentral::instant(),
            2,
            100,
        );
        let users = users(40);

        let handle = f.orchestrator.track_all(&users).unwrap();
        let report = handle.wait_timeout(Duration::from_millis(120));

        assert_eq!(report.state, BatchState::TimedOut);
        assert!(report.completed < users.len());
        assert!(report.completed_fraction() < 1.0);

        // Outstanding work is cancelled, so the batch still settles
        let last = handle.wait();
        assert_eq!(last.state, BatchState::TimedOut);
        assert_eq!(last.settled(), users.len());
        assert!(last.cancelled > 0);
    }

    #[test]
    fn test_cancel_skips_queued_users() {
        let f = fixture(
            SimulatedGps::new(Duration::from_millis(20)),
            SimulatedRewardCentral::instant(),
            1,
            100,
        );
        let users = users(30);

        let handle = f.orchestrator.track_all(&users).unwrap();
        handle.cancel();
        let report = handle.wait();

        assert_eq!(report.state, BatchState::Cancelled);
        assert_eq!(report.settled(), 30);
        assert!(report.cancelled > 0);
        assert_eq!(report.cancelled_users.len(), report.cancelled);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let f = fixture(SimulatedGps::instant(), SimulatedRewardCentral::instant(), 2, 10);
        f.pool.shutdown(Duration::from_secs(1));

        let err = f.orchestrator.track_all(&users(3)).unwrap_err();

        assert_eq!(err, EngineError::Shutdown);
    }

    #[test]
    fn test_wait_finished_leaves_state_alone() {
        let f = fixture(
            SimulatedGps::new(Duration::from_millis(50)),
            SimulatedRewardCentral::instant(),
            1,
            10,
        );
        let users = users(3);

        let handle = f.orchestrator.track_all(&users).unwrap();

        assert!(!handle.wait_finished(Duration::from_millis(10)));
        assert!(!handle.state().is_terminal());
        assert!(handle.wait_finished(Duration::from_secs(5)));
        assert_eq!(handle.state(), BatchState::Completed);
    }

    #[test]
    fn test_state_moves_through_running() {
        let f = fixture(
            SimulatedGps::new(Duration::from_millis(100)),
            SimulatedRewardCentral::instant(),
            1,
            10,
        );
        let users = users(2);

        let handle = f.orchestrator.track_all(&users).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(handle.state(), BatchState::Running);

        assert_eq!(handle.wait().state, BatchState::Completed);
    }
}
