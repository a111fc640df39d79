//! Single-flight cache of reward point values.
//!
//! Turns O(users × attractions) scoring calls into O(distinct keys) calls:
//! - Each key owns a slot guarded by its own mutex, so a miss computes the
//!   value once while other callers for the same key wait on that slot
//! - Callers for different keys never contend beyond a `DashMap` shard lock
//! - Values expire a fixed time after insertion
//! - Overflowing the capacity evicts expired slots first, then the
//!   least-recently-used ones
//!
//! Failed provider calls are not cached; the next caller for the key retries.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::AttractionCatalog;
use crate::config::EngineConfig;
use crate::error::ProviderError;
use crate::providers::ScoringProvider;

/// Divisor for the eviction batch: one overflow evicts capacity / 64 slots
/// (at least one) so a full cache does not rescan on every miss.
const EVICTION_BATCH_DIVISOR: usize = 64;

/// How cached point values are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CacheKeyPolicy {
    /// One value per attraction, shared by every user. The first user to
    /// miss decides the value everyone receives until it expires.
    #[default]
    PerAttraction,
    /// One value per (attraction, user) pair. Faithful to per-user scoring at
    /// the cost of one miss per user.
    PerAttractionAndUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    attraction_id: Uuid,
    user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy)]
struct CachedPoints {
    points: i32,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
struct Slot {
    value: Mutex<Option<CachedPoints>>,
    /// Logical clock tick of the last access, for LRU ordering
    last_access: AtomicU64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub provider_calls: usize,
    pub provider_failures: usize,
    pub evictions: usize,
    pub entries: usize,
}

/// Memoizes `(attraction, user) -> points` lookups against a slow scoring
/// provider.
pub struct RewardPointCache {
    provider: Arc<dyn ScoringProvider>,
    slots: DashMap<CacheKey, Arc<Slot>>,
    ttl: Duration,
    capacity: usize,
    policy: CacheKeyPolicy,
    clock: AtomicU64,
    hits: AtomicUsize,
    misses: AtomicUsize,
    provider_calls: AtomicUsize,
    provider_failures: AtomicUsize,
    evictions: AtomicUsize,
}

impl RewardPointCache {
    pub fn new(
        provider: Arc<dyn ScoringProvider>,
        ttl: Duration,
        capacity: usize,
        policy: CacheKeyPolicy,
    ) -> Self {
        Self {
            provider,
            slots: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
            policy,
            clock: AtomicU64::new(0),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
            provider_calls: AtomicUsize::new(0),
            provider_failures: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
        }
    }

    pub fn from_config(provider: Arc<dyn ScoringProvider>, config: &EngineConfig) -> Self {
        Self::new(
            provider,
            config.cache_ttl,
            config.cache_capacity,
            config.cache_key_policy,
        )
    }

    pub fn policy(&self) -> CacheKeyPolicy {
        self.policy
    }

    /// Points for `attraction_id` as seen by `user_id`.
    ///
    /// On a miss the provider is called once; concurrent callers for the same
    /// key block until that call finishes and then share its result.
    pub fn get_points(&self, attraction_id: Uuid, user_id: Uuid) -> Result<i32, ProviderError> {
        let key = self.key(attraction_id, user_id);
        let slot = self.slot(key);
        slot.last_access.store(self.tick(), Ordering::Relaxed);

        let mut value = slot.value.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = *value {
            if cached.inserted_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(cached.points);
            }
            debug!("[RewardPointCache] Entry for attraction {} expired", attraction_id);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.provider_calls.fetch_add(1, Ordering::Relaxed);
        match self.provider.attraction_reward_points(attraction_id, user_id) {
            Ok(points) => {
                *value = Some(CachedPoints {
                    points,
                    inserted_at: Instant::now(),
                });
                Ok(points)
            }
            Err(e) => {
                *value = None;
                self.provider_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Warm the cache with one provider call per attraction.
    ///
    /// Each call uses a synthetic user id derived from the attraction id. Only
    /// runs under [`CacheKeyPolicy::PerAttraction`]; per-user keys cannot be
    /// warmed without knowing the users. Returns the number of values loaded.
    pub fn preload(&self, catalog: &AttractionCatalog) -> usize {
        if self.policy != CacheKeyPolicy::PerAttraction {
            debug!("[RewardPointCache] Skipping preload for per-user keys");
            return 0;
        }

        let start = Instant::now();
        let mut loaded = 0;
        for attraction in catalog.attractions() {
            let synthetic_user = Uuid::new_v5(&Uuid::NAMESPACE_OID, attraction.id.as_bytes());
            match self.get_points(attraction.id, synthetic_user) {
                Ok(_) => loaded += 1,
                Err(e) => warn!(
                    "[RewardPointCache] Preload failed for attraction {} ({}): {}",
                    attraction.name, attraction.id, e
                ),
            }
        }
        info!(
            "[RewardPointCache] Preloaded {}/{} attractions in {:?}",
            loaded,
            catalog.len(),
            start.elapsed()
        );
        loaded
    }

    /// Drop every cached value.
    pub fn invalidate_all(&self) {
        let dropped = self.slots.len();
        self.slots.clear();
        info!("[RewardPointCache] Cleared {} entries", dropped);
    }

    /// Remove slots whose value has expired. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| !self.is_expired(slot));
        before.saturating_sub(self.slots.len())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_failures: self.provider_failures.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.slots.len(),
        }
    }

    fn key(&self, attraction_id: Uuid, user_id: Uuid) -> CacheKey {
        match self.policy {
            CacheKeyPolicy::PerAttraction => CacheKey {
                attraction_id,
                user_id: None,
            },
            CacheKeyPolicy::PerAttractionAndUser => CacheKey {
                attraction_id,
                user_id: Some(user_id),
            },
        }
    }

    /// Fetch or create the slot for `key`, evicting if the insert overflowed.
    fn slot(&self, key: CacheKey) -> Arc<Slot> {
        if let Some(slot) = self.slots.get(&key) {
            return Arc::clone(slot.value());
        }

        // Stamped before it becomes visible so a concurrent eviction never
        // sees a fresh slot as the oldest
        let slot = Arc::clone(
            self.slots
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(Slot {
                        value: Mutex::new(None),
                        last_access: AtomicU64::new(self.tick()),
                    })
                })
                .value(),
        );
        if self.slots.len() > self.capacity {
            self.evict(key);
        }
        slot
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// A slot whose computation is in flight is never idle.
    fn is_in_flight(slot: &Slot) -> bool {
        slot.value.try_lock().is_err()
    }

    /// A slot whose computation is in flight counts as live.
    fn is_expired(&self, slot: &Slot) -> bool {
        match slot.value.try_lock() {
            Ok(value) => value.map_or(false, |v| v.inserted_at.elapsed() >= self.ttl),
            Err(_) => false,
        }
    }

    fn evict(&self, keep: CacheKey) {
        let expired = self.purge_expired();
        if expired > 0 {
            self.evictions.fetch_add(expired, Ordering::Relaxed);
        }

        let excess = self.slots.len().saturating_sub(self.capacity);
        if excess == 0 {
            return;
        }
        let batch = excess.max(self.capacity / EVICTION_BATCH_DIVISOR).max(1);

        let mut candidates: Vec<(CacheKey, u64)> = self
            .slots
            .iter()
            .filter(|e| *e.key() != keep && !Self::is_in_flight(e.value()))
            .map(|e| (*e.key(), e.value().last_access.load(Ordering::Relaxed)))
            .collect();
        candidates.sort_unstable_by_key(|&(_, tick)| tick);

        let mut evicted = 0;
        for (key, tick) in candidates.into_iter().take(batch) {
            // Skip slots touched or locked since the scan
            let removed = self.slots.remove_if(&key, |_, slot| {
                slot.last_access.load(Ordering::Relaxed) == tick && !Self::is_in_flight(slot)
            });
            if removed.is_some() {
                evicted += 1;
            }
        }
        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!(
            "[RewardPointCache] Evicted {} expired + {} least-recently-used entries",
            expired, evicted
        );
    }
}

impl std::fmt::Debug for RewardPointCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardPointCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}
