//! Per-user reward computation.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};

use crate::cache::RewardPointCache;
use crate::catalog::AttractionCatalog;
use crate::geo_utils;
use crate::user::User;
use crate::UserReward;

/// What one `calculate_rewards` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RewardOutcome {
    /// Rewards this call added to the user
    pub awarded: usize,
    /// Qualifying attractions skipped because scoring failed
    pub provider_failures: usize,
}

/// Finds attractions a user has newly qualified for and records one reward
/// per attraction.
#[derive(Debug)]
pub struct RewardAccumulator {
    catalog: Arc<AttractionCatalog>,
    cache: Arc<RewardPointCache>,
    tracking_threshold_miles: f64,
}

impl RewardAccumulator {
    pub fn new(
        catalog: Arc<AttractionCatalog>,
        cache: Arc<RewardPointCache>,
        tracking_threshold_miles: f64,
    ) -> Self {
        Self {
            catalog,
            cache,
            tracking_threshold_miles,
        }
    }

    pub fn catalog(&self) -> &Arc<AttractionCatalog> {
        &self.catalog
    }

    pub fn cache(&self) -> &Arc<RewardPointCache> {
        &self.cache
    }

    pub fn tracking_threshold_miles(&self) -> f64 {
        self.tracking_threshold_miles
    }

    /// Award every attraction the user's history qualifies for and that the
    /// user does not hold yet.
    ///
    /// Works on a snapshot of the history, so appends made while this runs
    /// are picked up by the next call. Safe to run concurrently for the same
    /// user: the insert into the reward ledger is an atomic insert-if-absent,
    /// so overlapping calls never duplicate an attraction and never drop a
    /// sibling's reward.
    ///
    /// A scoring failure is logged and treated as no reward for that
    /// attraction this round; it stays eligible for the next call.
    pub fn calculate_rewards(&self, user: &User) -> RewardOutcome {
        let start = Instant::now();
        let locations = user.visited_locations();
        let mut settled = user.rewarded_attraction_ids();
        let mut outcome = RewardOutcome::default();

        for location in &locations {
            for attraction in self.catalog.attractions() {
                if settled.contains(&attraction.id) {
                    continue;
                }
                if !geo_utils::is_near(attraction, &location.coordinate, self.tracking_threshold_miles) {
                    continue;
                }

                settled.insert(attraction.id);
                // A sibling call may have won the race since the snapshot
                if user.has_reward_for(&attraction.id) {
                    continue;
                }

                match self.cache.get_points(attraction.id, user.id()) {
                    Ok(points) => {
                        let reward = UserReward::new(location.clone(), Arc::clone(attraction), points);
                        if user.try_add_reward(reward) {
                            outcome.awarded += 1;
                        }
                    }
                    Err(e) => {
                        outcome.provider_failures += 1;
                        warn!(
                            "[RewardAccumulator] No reward for user {} at attraction {} ({}) this round: {}",
                            user.user_name(),
                            attraction.name,
                            attraction.id,
                            e
                        );
                    }
                }
            }
        }

        debug!(
            "[RewardAccumulator] {}: {} locations, {} new rewards, {} failures in {:?}",
            user.user_name(),
            locations.len(),
            outcome.awarded,
            outcome.provider_failures,
            start.elapsed()
        );
        outcome
    }
}
