//! Engine configuration.

use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

use crate::cache::CacheKeyPolicy;

/// Configuration for the reward engine.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Maximum distance at which a visit counts toward a reward.
    /// Default: 10.0 miles
    pub tracking_threshold_miles: f64,

    /// Looser radius for "is this attraction in the area" checks. Never used
    /// as the reward gate.
    /// Default: 200.0 miles
    pub attraction_proximity_miles: f64,

    /// Time-to-live of a cached reward point value, measured from insertion.
    /// Default: 1 hour
    pub cache_ttl: Duration,

    /// Maximum number of cached point values before least-recently-used
    /// entries are evicted.
    /// Default: 100_000
    pub cache_capacity: usize,

    /// Whether cached points are shared across users or kept per user.
    /// Default: `CacheKeyPolicy::PerAttraction`
    pub cache_key_policy: CacheKeyPolicy,

    /// Warm the point cache for every attraction when the engine starts.
    /// Only meaningful with `CacheKeyPolicy::PerAttraction`.
    /// Default: true
    pub preload_reward_points: bool,

    /// Worker threads per available CPU when `worker_threads` is unset.
    /// Default: 4
    pub worker_multiplier: usize,

    /// Explicit worker pool size, overriding `worker_multiplier`.
    /// Default: None
    pub worker_threads: Option<usize>,

    /// Tasks that may wait in the pool queue before submitters run tasks
    /// themselves.
    /// Default: 1000
    pub queue_capacity: usize,

    /// Users per sub-batch when a batch is split for submission.
    /// Default: 100
    pub sub_batch_size: usize,

    /// How long shutdown waits for in-flight work before cancelling what is
    /// still queued.
    /// Default: 30 seconds
    pub shutdown_timeout: Duration,

    /// Number of attractions returned by the nearby listing.
    /// Default: 5
    pub nearby_attraction_count: usize,

    /// Pause between rounds of the periodic tracker.
    /// Default: 5 minutes
    pub tracking_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tracking_threshold_miles: 10.0,
            attraction_proximity_miles: 200.0,
            cache_ttl: Duration::from_secs(60 * 60),
            cache_capacity: 100_000,
            cache_key_policy: CacheKeyPolicy::PerAttraction,
            preload_reward_points: true,
            worker_multiplier: 4,
            worker_threads: None,
            queue_capacity: 1000,
            sub_batch_size: 100,
            shutdown_timeout: Duration::from_secs(30),
            nearby_attraction_count: 5,
            tracking_interval: Duration::from_secs(5 * 60),
        }
    }
}

impl EngineConfig {
    /// Effective worker pool size. Always at least one.
    pub fn pool_size(&self) -> usize {
        let size = self.worker_threads.unwrap_or_else(|| {
            let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
            cpus.saturating_mul(self.worker_multiplier)
        });
        size.max(1)
    }

    /// Sub-batch size clamped to at least one user.
    pub fn effective_sub_batch_size(&self) -> usize {
        self.sub_batch_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.tracking_threshold_miles, 10.0);
        assert_eq!(config.attraction_proximity_miles, 200.0);
        assert_eq!(config.cache_ttl, Duration::from_secs(3600));
        assert_eq!(config.cache_capacity, 100_000);
        assert_eq!(config.sub_batch_size, 100);
        assert_eq!(config.nearby_attraction_count, 5);
    }

    #[test]
    fn test_pool_size_scales_with_parallelism() {
        let cpus = thread::available_parallelism().map_or(1, NonZeroUsize::get);
        let config = EngineConfig::default();
        assert_eq!(config.pool_size(), cpus * 4);
    }

    #[test]
    fn test_pool_size_overrides() {
        let config = EngineConfig {
            worker_threads: Some(3),
            ..EngineConfig::default()
        };
        assert_eq!(config.pool_size(), 3);

        let config = EngineConfig {
            worker_threads: Some(0),
            sub_batch_size: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.pool_size(), 1);
        assert_eq!(config.effective_sub_batch_size(), 1);
    }
}
