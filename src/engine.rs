//! The engine facade.
//!
//! [`RewardEngine`] owns the catalog, the point cache, the worker pool and the
//! components built on them, and exposes the operations callers need. It is
//! built once from the three providers and an [`EngineConfig`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;

use crate::batch::{BatchHandle, BatchOrchestrator};
use crate::cache::RewardPointCache;
use crate::catalog::AttractionCatalog;
use crate::config::EngineConfig;
use crate::error::{EngineError, ShutdownReport, TrackingError};
use crate::geo_utils;
use crate::pool::{Dispatch, WorkerPool};
use crate::providers::{AttractionSource, GpsProvider, ScoringProvider};
use crate::rewards::{RewardAccumulator, RewardOutcome};
use crate::tracker::{LocationTracker, NearbyAttraction, PeriodicTracker};
use crate::user::{User, UserRegistry};
use crate::{Attraction, Coordinate, VisitedLocation};

#[derive(Debug)]
pub struct RewardEngine {
    config: EngineConfig,
    catalog: Arc<AttractionCatalog>,
    cache: Arc<RewardPointCache>,
    pool: Arc<WorkerPool>,
    accumulator: Arc<RewardAccumulator>,
    tracker: Arc<LocationTracker>,
    orchestrator: Arc<BatchOrchestrator>,
}

impl RewardEngine {
    /// Load the catalog, warm the cache and start the worker pool.
    pub fn new(
        gps: Arc<dyn GpsProvider>,
        scoring: Arc<dyn ScoringProvider>,
        source: &dyn AttractionSource,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let start = Instant::now();

        let catalog = Arc::new(AttractionCatalog::load(source)?);
        let cache = Arc::new(RewardPointCache::from_config(scoring, &config));
        if config.preload_reward_points {
            cache.preload(&catalog);
        }

        let pool = Arc::new(WorkerPool::from_config(&config)?);
        let accumulator = Arc::new(RewardAccumulator::new(
            Arc::clone(&catalog),
            Arc::clone(&cache),
            config.tracking_threshold_miles,
        ));
        let tracker = Arc::new(LocationTracker::new(gps, Arc::clone(&accumulator), Arc::clone(&pool)));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            Arc::clone(&pool),
            Arc::clone(&tracker),
            Arc::clone(&accumulator),
            config.effective_sub_batch_size(),
        ));

        info!(
            "[RewardEngine] Ready in {:?}: {} attractions, {} workers, queue {}, threshold {} mi",
            start.elapsed(),
            catalog.len(),
            pool.size(),
            pool.queue_capacity(),
            config.tracking_threshold_miles
        );

        Ok(Self {
            config,
            catalog,
            cache,
            pool,
            accumulator,
            tracker,
            orchestrator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<AttractionCatalog> {
        &self.catalog
    }

    pub fn attractions(&self) -> &[Arc<Attraction>] {
        self.catalog.attractions()
    }

    pub fn cache(&self) -> &Arc<RewardPointCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn accumulator(&self) -> &Arc<RewardAccumulator> {
        &self.accumulator
    }

    pub fn tracker(&self) -> &Arc<LocationTracker> {
        &self.tracker
    }

    pub fn orchestrator(&self) -> &Arc<BatchOrchestrator> {
        &self.orchestrator
    }

    // ------------------------------------------------------------------
    // Single user
    // ------------------------------------------------------------------

    pub fn track_user(&self, user: &Arc<User>) -> Result<VisitedLocation, TrackingError> {
        self.tracker.track(user)
    }

    pub fn track_and_reward(&self, user: &User) -> Result<(VisitedLocation, RewardOutcome), TrackingError> {
        self.tracker.track_and_reward(user)
    }

    /// Compute rewards for `user` on the calling thread.
    pub fn calculate_rewards(&self, user: &User) -> RewardOutcome {
        self.accumulator.calculate_rewards(user)
    }

    pub fn schedule_rewards(&self, user: &Arc<User>) -> Result<Dispatch, EngineError> {
        self.tracker.schedule_rewards(user)
    }

    pub fn user_location(&self, user: &Arc<User>) -> Result<VisitedLocation, TrackingError> {
        self.tracker.user_location(user)
    }

    /// The configured number of attractions closest to the user.
    pub fn nearby_attractions(&self, user: &Arc<User>) -> Result<Vec<NearbyAttraction>, TrackingError> {
        self.tracker
            .nearby_attractions(user, self.config.nearby_attraction_count)
    }

    /// Whether `coordinate` is inside the loose attraction proximity radius.
    /// This never decides rewards.
    pub fn is_within_attraction_proximity(&self, attraction: &Attraction, coordinate: &Coordinate) -> bool {
        geo_utils::is_near(attraction, coordinate, self.config.attraction_proximity_miles)
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    pub fn track_all(&self, users: &[Arc<User>]) -> Result<BatchHandle, EngineError> {
        self.orchestrator.track_all(users)
    }

    pub fn calculate_rewards_for_all(&self, users: &[Arc<User>]) -> Result<BatchHandle, EngineError> {
        self.orchestrator.calculate_rewards_for_all(users)
    }

    /// Track every user in `users` once per configured interval until the
    /// returned tracker is stopped or dropped.
    pub fn start_periodic_tracking(&self, users: Arc<UserRegistry>) -> Result<PeriodicTracker, EngineError> {
        if self.pool.is_shutdown() {
            return Err(EngineError::Shutdown);
        }
        PeriodicTracker::start(Arc::clone(&self.orchestrator), users, self.config.tracking_interval)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drop every cached point value.
    pub fn clear_reward_cache(&self) {
        self.cache.invalidate_all();
    }

    /// Block until all queued and running work has finished, or `timeout`
    /// passes. Returns true if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.pool.wait_idle(timeout)
    }

    /// Stop accepting work, drain the pool for up to the configured shutdown
    /// timeout, then cancel what is still queued. Idempotent.
    pub fn shutdown(&self) -> ShutdownReport {
        let report = self.pool.shutdown(self.config.shutdown_timeout);
        if report.initiated {
            let stats = self.cache.stats();
            info!(
                "[RewardEngine] Shut down: drained={}, cache {} hits / {} misses / {} provider calls",
                report.drained, stats.hits, stats.misses, stats.provider_calls
            );
        }
        report
    }
}

impl Drop for RewardEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchState;
    use crate::simulation::{generate_users, SimulatedGps, SimulatedRewardCentral, StaticCatalog};
    use rstest::rstest;
    use uuid::Uuid;

    fn engine_with(gps: SimulatedGps, attractions: Vec<Attraction>, config: EngineConfig) -> (RewardEngine, Arc<SimulatedGps>) {
        let gps = Arc::new(gps);
        let engine = RewardEngine::new(
            Arc::clone(&gps) as Arc<dyn GpsProvider>,
            Arc::new(SimulatedRewardCentral::instant()),
            &StaticCatalog::new(attractions),
            config,
        )
        .unwrap();
        (engine, gps)
    }

    fn small_config() -> EngineConfig {
        EngineConfig {
            worker_threads: Some(4),
            queue_capacity: 200,
            shutdown_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        }
    }

    fn user(name: &str) -> Arc<User> {
        Arc::new(User::new(Uuid::new_v4(), name, "000", format!("{}@example.com", name)))
    }

    #[test]
    fn test_jon_at_attraction_gets_one_reward() {
        let (engine, _) = engine_with(
            SimulatedGps::at(Coordinate::new(0.0, 0.0)),
            vec![Attraction::new("origin", "", "", Coordinate::new(0.0, 0.0))],
            small_config(),
        );
        let jon = user("jon");

        let (_, outcome) = engine.track_and_reward(&jon).unwrap();

        assert_eq!(outcome.awarded, 1);
        assert_eq!(jon.reward_count(), 1);
    }

    #[test]
    fn test_maximal_threshold_rewards_every_sample_attraction() {
        let config = EngineConfig {
            tracking_threshold_miles: f64::MAX,
            ..small_config()
        };
        let (engine, _) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), config);
        let users = generate_users(1, 1);

        engine.calculate_rewards(&users[0]);

        assert_eq!(users[0].reward_count(), engine.attractions().len());
    }

    #[rstest]
    #[case(10)]
    #[case(100)]
    #[case(1000)]
    fn test_track_all_gives_every_user_a_location(#[case] count: usize) {
        let (engine, _) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), small_config());
        let users: Vec<Arc<User>> = (0..count).map(|i| user(&format!("user{}", i))).collect();

        let report = engine.track_all(&users).unwrap().wait_timeout(Duration::from_secs(60));

        assert_eq!(report.state, BatchState::Completed);
        assert_eq!(report.completed + report.failed, count);
        assert!(users.iter().all(|u| u.visited_location_count() >= 1));
    }

    #[test]
    fn test_gps_failure_surfaces_and_spares_siblings() {
        let (engine, gps) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), small_config());
        let users: Vec<Arc<User>> = (0..50).map(|i| user(&format!("user{}", i))).collect();
        gps.fail_for(users[0].id());

        let err = engine.track_user(&users[0]).unwrap_err();
        assert!(err.is_provider_failure());

        let report = engine.track_all(&users).unwrap().wait();
        assert_eq!(report.completed + report.failed, users.len());
        assert_eq!(report.failed_users, vec![users[0].id()]);
        assert!(users[1..].iter().all(|u| u.visited_location_count() == 1));
    }

    #[test]
    fn test_rewards_batch_over_generated_users() {
        let config = EngineConfig {
            tracking_threshold_miles: f64::MAX,
            ..small_config()
        };
        let (engine, _) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), config);
        let users = generate_users(200, 3);

        let report = engine.calculate_rewards_for_all(&users).unwrap().wait();

        assert_eq!(report.completed, 200);
        assert!(users.iter().all(|u| u.reward_count() == 26));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (engine, _) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), small_config());

        assert!(engine.shutdown().initiated);
        assert!(!engine.shutdown().initiated);
        assert_eq!(engine.track_all(&[user("late")]).unwrap_err(), EngineError::Shutdown);
        assert!(engine.start_periodic_tracking(Arc::new(UserRegistry::new())).is_err());
    }

    #[test]
    fn test_nearby_attractions_use_configured_count() {
        let (engine, _) = engine_with(
            SimulatedGps::at(Coordinate::new(33.8, -117.9)),
            StaticCatalog::sample().attractions().unwrap(),
            small_config(),
        );
        let jon = user("jon");

        let nearby = engine.nearby_attractions(&jon).unwrap();

        assert_eq!(nearby.len(), 5);
        assert_eq!(nearby[0].attraction.name, "Disneyland");
        assert!(nearby.windows(2).all(|w| w[0].distance_miles <= w[1].distance_miles));
    }

    #[test]
    fn test_attraction_proximity_is_looser_than_reward_threshold() {
        let (engine, _) = engine_with(SimulatedGps::instant(), vec![], small_config());
        let attraction = Attraction::new("origin", "", "", Coordinate::new(0.0, 0.0));
        // ~138 miles north
        let nearby = Coordinate::new(2.0, 0.0);

        assert!(engine.is_within_attraction_proximity(&attraction, &nearby));
        assert!(!geo_utils::is_near(&attraction, &nearby, engine.config().tracking_threshold_miles));
        assert!(!engine.is_within_attraction_proximity(&attraction, &Coordinate::new(10.0, 0.0)));
    }

    #[test]
    fn test_preload_warms_cache() {
        let (engine, _) = engine_with(SimulatedGps::instant(), StaticCatalog::sample().attractions().unwrap(), small_config());

        assert_eq!(engine.cache().len(), 26);
        engine.clear_reward_cache();
        assert!(engine.cache().is_empty());
    }
}
