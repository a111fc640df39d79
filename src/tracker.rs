//! Location tracking for single users, and the periodic tracking loop.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::batch::{BatchHandle, BatchOrchestrator, BatchReport};
use crate::error::{EngineError, TrackingError};
use crate::pool::{Dispatch, WorkerPool};
use crate::providers::GpsProvider;
use crate::rewards::{RewardAccumulator, RewardOutcome};
use crate::user::{User, UserRegistry};
use crate::{Attraction, Coordinate, VisitedLocation};

/// An attraction close to a user, with how far away it is and what it is
/// worth to that user.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NearbyAttraction {
    pub attraction: Arc<Attraction>,
    pub user_location: Coordinate,
    pub distance_miles: f64,
    /// None when the scoring provider failed for this attraction
    pub reward_points: Option<i32>,
}

/// Fetches user positions and records them.
pub struct LocationTracker {
    gps: Arc<dyn GpsProvider>,
    accumulator: Arc<RewardAccumulator>,
    pool: Arc<WorkerPool>,
}

impl LocationTracker {
    pub fn new(gps: Arc<dyn GpsProvider>, accumulator: Arc<RewardAccumulator>, pool: Arc<WorkerPool>) -> Self {
        Self { gps, accumulator, pool }
    }

    pub fn accumulator(&self) -> &Arc<RewardAccumulator> {
        &self.accumulator
    }

    /// Fetch the user's position, append it to the history and schedule
    /// reward computation in the background.
    ///
    /// Returns as soon as the location is recorded. A GPS failure is returned
    /// to the caller and leaves the history untouched. A failure to schedule
    /// the rewards is only logged; they are picked up on the next round.
    pub fn track(&self, user: &Arc<User>) -> Result<VisitedLocation, TrackingError> {
        let location = self.record_location(user)?;

        if let Err(e) = self.schedule_rewards(user) {
            warn!(
                "[LocationTracker] Location recorded for {} but rewards not scheduled: {}",
                user.user_name(),
                e
            );
        }
        Ok(location)
    }

    /// Like [`track`](Self::track) but computes rewards on the calling thread
    /// and returns once they are recorded.
    pub fn track_and_reward(&self, user: &User) -> Result<(VisitedLocation, RewardOutcome), TrackingError> {
        let location = self.record_location(user)?;
        let outcome = self.accumulator.calculate_rewards(user);
        Ok((location, outcome))
    }

    /// Queue reward computation for `user` on the worker pool.
    pub fn schedule_rewards(&self, user: &Arc<User>) -> Result<Dispatch, EngineError> {
        let accumulator = Arc::clone(&self.accumulator);
        let user = Arc::clone(user);
        self.pool.submit(move || {
            accumulator.calculate_rewards(&user);
        })
    }

    /// The user's latest known location, tracking them first if they have no
    /// history yet.
    pub fn user_location(&self, user: &Arc<User>) -> Result<VisitedLocation, TrackingError> {
        match user.last_visited_location() {
            Some(location) => Ok(location),
            None => self.track(user),
        }
    }

    /// The `count` attractions closest to the user's latest location, nearest
    /// first, with the points each is worth to the user.
    pub fn nearby_attractions(&self, user: &Arc<User>, count: usize) -> Result<Vec<NearbyAttraction>, TrackingError> {
        let location = self.user_location(user)?;
        let cache = self.accumulator.cache();

        let nearby = self
            .accumulator
            .catalog()
            .nearest(&location.coordinate, count)
            .into_iter()
            .map(|(attraction, distance_miles)| {
                let reward_points = match cache.get_points(attraction.id, user.id()) {
                    Ok(points) => Some(points),
                    Err(e) => {
                        warn!("[LocationTracker] No points for {}: {}", attraction.name, e);
                        None
                    }
                };
                NearbyAttraction {
                    attraction,
                    user_location: location.coordinate,
                    distance_miles,
                    reward_points,
                }
            })
            .collect();
        Ok(nearby)
    }

    fn record_location(&self, user: &User) -> Result<VisitedLocation, TrackingError> {
        let start = Instant::now();
        let coordinate = self
            .gps
            .user_location(user.id())
            .map_err(|e| TrackingError::new(user.id(), e))?;

        let location = VisitedLocation::now(user.id(), coordinate);
        user.add_visited_location(location.clone());
        debug!(
            "[LocationTracker] {} at ({:.4}, {:.4}) in {:?}",
            user.user_name(),
            coordinate.latitude,
            coordinate.longitude,
            start.elapsed()
        );
        Ok(location)
    }
}

/// How often a waiting round checks for a stop request.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Background loop that tracks every registered user once per interval.
///
/// Each round is a [`BatchOrchestrator::track_all`] batch. A round still
/// running after one interval times out and its queued work is cancelled.
/// Stopping cancels the running round without waiting for provider calls
/// already issued, then joins the thread.
pub struct PeriodicTracker {
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

enum RoundEnd {
    Finished(BatchReport),
    Stopped,
}

/// Wait for `handle` until it settles, `deadline` passes or a stop arrives.
fn await_round(handle: &BatchHandle, deadline: Instant, stop_rx: &Receiver<()>) -> RoundEnd {
    loop {
        if handle.wait_finished(STOP_POLL) {
            return RoundEnd::Finished(handle.report());
        }
        match stop_rx.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => {
                handle.cancel();
                return RoundEnd::Stopped;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return RoundEnd::Finished(handle.wait_timeout(Duration::ZERO));
        }
    }
}

impl PeriodicTracker {
    pub fn start(
        orchestrator: Arc<BatchOrchestrator>,
        users: Arc<UserRegistry>,
        interval: Duration,
    ) -> Result<Self, EngineError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("reward-tracker".to_string())
            .spawn(move || {
                info!("[PeriodicTracker] Started, interval {:?}", interval);
                let mut round: u64 = 0;
                loop {
                    let snapshot = users.all_users();
                    let start = Instant::now();
                    match orchestrator.track_all(&snapshot) {
                        Ok(handle) => match await_round(&handle, start + interval, &stop_rx) {
                            RoundEnd::Finished(report) => info!(
                                "[PeriodicTracker] Round {} {:?}: tracked {}/{} users ({} failed) in {:?}",
                                round,
                                report.state,
                                report.completed,
                                report.total,
                                report.failed,
                                start.elapsed()
                            ),
                            RoundEnd::Stopped => {
                                info!("[PeriodicTracker] Stop requested during round {}", round);
                                break;
                            }
                        },
                        Err(EngineError::Shutdown) => {
                            info!("[PeriodicTracker] Engine shut down, stopping");
                            break;
                        }
                        Err(e) => warn!("[PeriodicTracker] Round {} not submitted: {}", round, e),
                    }
                    round += 1;

                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("[PeriodicTracker] Stopped after {} rounds", round);
            })
            .map_err(|e| EngineError::ThreadSpawn(e.to_string()))?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop and wait for the thread to exit. Safe to call more than
    /// once.
    pub fn stop(&self) {
        let Some(stop_tx) = self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return;
        };
        drop(stop_tx);

        let thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("[PeriodicTracker] Tracking thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for LocationTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocationTracker")
            .field("accumulator", &self.accumulator)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for PeriodicTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTracker")
            .field("running", &self.is_running())
            .finish()
    }
}

impl Drop for PeriodicTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKeyPolicy, RewardPointCache};
    use crate::catalog::AttractionCatalog;
    use crate::simulation::{SimulatedGps, SimulatedRewardCentral};
    use uuid::Uuid;

    struct Fixture {
        pool: Arc<WorkerPool>,
        gps: Arc<SimulatedGps>,
        tracker: Arc<LocationTracker>,
    }

    fn fixture(gps: SimulatedGps) -> Fixture {
        let catalog = Arc::new(AttractionCatalog::from_attractions(
            (0..8)
                .map(|i| Attraction::new(format!("a{}", i), "", "", Coordinate::new(i as f64, 0.0)))
                .collect(),
        ));
        let cache = Arc::new(RewardPointCache::new(
            Arc::new(SimulatedRewardCentral::instant().with_points(25)),
            Duration::from_secs(3600),
            1000,
            CacheKeyPolicy::PerAttraction,
        ));
        let accumulator = Arc::new(RewardAccumulator::new(catalog, cache, 10.0));
        let pool = Arc::new(WorkerPool::new(2, 100).unwrap());
        let gps = Arc::new(gps);
        let tracker = Arc::new(LocationTracker::new(
            Arc::clone(&gps) as Arc<dyn GpsProvider>,
            accumulator,
            Arc::clone(&pool),
        ));
        Fixture { pool, gps, tracker }
    }

    fn jon() -> Arc<User> {
        Arc::new(User::new(Uuid::new_v4(), "jon", "000", "jon@example.com"))
    }

    #[test]
    fn test_track_appends_and_schedules_rewards() {
        let f = fixture(SimulatedGps::at(Coordinate::new(0.0, 0.0)));
        let jon = jon();

        let location = f.tracker.track(&jon).unwrap();

        assert_eq!(location.user_id, jon.id());
        assert_eq!(jon.visited_location_count(), 1);
        assert!(f.pool.wait_idle(Duration::from_secs(5)));
        assert_eq!(jon.reward_count(), 1);
    }

    #[test]
    fn test_gps_failure_leaves_history_untouched() {
        let f = fixture(SimulatedGps::instant());
        let jon = jon();
        f.gps.fail_for(jon.id());

        let err = f.tracker.track(&jon).unwrap_err();

        assert_eq!(err.user_id, jon.id());
        assert!(err.is_provider_failure());
        assert_eq!(jon.visited_location_count(), 0);
    }

    #[test]
    fn test_track_and_reward_waits_for_rewards() {
        let f = fixture(SimulatedGps::at(Coordinate::new(3.0, 0.0)));
        let jon = jon();

        let (location, outcome) = f.tracker.track_and_reward(&jon).unwrap();

        assert_eq!(location.coordinate, Coordinate::new(3.0, 0.0));
        assert_eq!(outcome.awarded, 1);
        assert_eq!(jon.rewards()[0].points, 25);
    }

    #[test]
    fn test_tracking_after_shutdown_still_records_location() {
        let f = fixture(SimulatedGps::at(Coordinate::new(0.0, 0.0)));
        f.pool.shutdown(Duration::from_secs(1));
        let jon = jon();

        assert!(f.tracker.track(&jon).is_ok());
        assert_eq!(jon.visited_location_count(), 1);
        assert_eq!(f.tracker.schedule_rewards(&jon), Err(EngineError::Shutdown));
    }

    #[test]
    fn test_user_location_reuses_history() {
        let f = fixture(SimulatedGps::at(Coordinate::new(1.0, 1.0)));
        let jon = jon();
        jon.add_visited_location(VisitedLocation::now(jon.id(), Coordinate::new(5.0, 5.0)));

        let location = f.tracker.user_location(&jon).unwrap();

        assert_eq!(location.coordinate, Coordinate::new(5.0, 5.0));
        assert_eq!(f.gps.calls(), 0);
    }

    #[test]
    fn test_nearby_attractions_sorted_and_limited() {
        let f = fixture(SimulatedGps::at(Coordinate::new(2.2, 0.0)));
        let jon = jon();

        let nearby = f.tracker.nearby_attractions(&jon, 5).unwrap();

        assert_eq!(nearby.len(), 5);
        assert_eq!(nearby[0].attraction.name, "a2");
        assert!(nearby.windows(2).all(|w| w[0].distance_miles <= w[1].distance_miles));
        assert!(nearby.iter().all(|n| n.reward_points == Some(25)));
    }

    #[test]
    fn test_periodic_tracker_runs_rounds_until_stopped() {
        let f = fixture(SimulatedGps::instant());
        let orchestrator = Arc::new(BatchOrchestrator::new(
            Arc::clone(&f.pool),
            Arc::clone(&f.tracker),
            Arc::clone(f.tracker.accumulator()),
            10,
        ));
        let users: Arc<UserRegistry> = Arc::new(
            (0..5)
                .map(|i| Arc::new(User::new(Uuid::new_v4(), format!("user{}", i), "000", "u@example.com")))
                .collect(),
        );

        let periodic = PeriodicTracker::start(orchestrator, Arc::clone(&users), Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(150));
        periodic.stop();
        periodic.stop();

        assert!(!periodic.is_running());
        assert!(users.all_users().iter().all(|u| u.visited_location_count() >= 2));
    }

    #[test]
    fn test_periodic_stop_does_not_wait_for_slow_gps() {
        let f = fixture(SimulatedGps::new(Duration::from_secs(5)));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            Arc::clone(&f.pool),
            Arc::clone(&f.tracker),
            Arc::clone(f.tracker.accumulator()),
            10,
        ));
        let users: Arc<UserRegistry> = Arc::new(std::iter::once(jon()).collect());

        let periodic = PeriodicTracker::start(orchestrator, users, Duration::from_secs(3600)).unwrap();
        thread::sleep(Duration::from_millis(50));
        let start = Instant::now();
        periodic.stop();

        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!periodic.is_running());
    }
}
