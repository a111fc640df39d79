//! Users and their append-only histories.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::{UserReward, VisitedLocation};

/// A tracked user.
///
/// Both sequences are append-only and safe to append to from many worker
/// threads at once:
/// - visited locations live in an `RwLock<Vec<_>>` append log, read through
///   point-in-time snapshots
/// - rewards live in a map keyed by attraction id; inserting is an atomic
///   insert-if-absent, so a user can never hold two rewards for the same
///   attraction
///
/// Histories grow without bound. Ageing out old visits would hook in next to
/// [`User::add_visited_location`].
#[derive(Debug)]
pub struct User {
    id: Uuid,
    user_name: String,
    phone: String,
    email: String,
    visited_locations: RwLock<Vec<VisitedLocation>>,
    rewards: DashMap<Uuid, (u64, UserReward)>,
    reward_seq: AtomicU64,
}

impl User {
    pub fn new(
        id: Uuid,
        user_name: impl Into<String>,
        phone: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            id,
            user_name: user_name.into(),
            phone: phone.into(),
            email: email.into(),
            visited_locations: RwLock::new(Vec::new()),
            rewards: DashMap::new(),
            reward_seq: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    // ------------------------------------------------------------------
    // Visited locations
    // ------------------------------------------------------------------

    pub fn add_visited_location(&self, location: VisitedLocation) {
        self.visited_locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(location);
    }

    /// Point-in-time copy of the history, in append order.
    pub fn visited_locations(&self) -> Vec<VisitedLocation> {
        self.visited_locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_visited_location(&self) -> Option<VisitedLocation> {
        self.visited_locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn visited_location_count(&self) -> usize {
        self.visited_locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    // ------------------------------------------------------------------
    // Rewards
    // ------------------------------------------------------------------

    /// Record `reward` unless the user already holds one for its attraction.
    ///
    /// Returns whether the reward was added.
    pub fn try_add_reward(&self, reward: UserReward) -> bool {
        match self.rewards.entry(reward.attraction_id()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let seq = self.reward_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert((seq, reward));
                true
            }
        }
    }

    pub fn has_reward_for(&self, attraction_id: &Uuid) -> bool {
        self.rewards.contains_key(attraction_id)
    }

    /// Ids of every attraction the user has been rewarded for.
    pub fn rewarded_attraction_ids(&self) -> HashSet<Uuid> {
        self.rewards.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of the rewards, oldest first.
    pub fn rewards(&self) -> Vec<UserReward> {
        let mut ordered: Vec<(u64, UserReward)> = self
            .rewards
            .iter()
            .map(|e| e.value().clone())
            .collect();
        ordered.sort_unstable_by_key(|(seq, _)| *seq);
        ordered.into_iter().map(|(_, reward)| reward).collect()
    }

    pub fn reward_count(&self) -> usize {
        self.rewards.len()
    }

    /// Sum of points over every reward.
    pub fn total_reward_points(&self) -> i64 {
        self.rewards.iter().map(|e| i64::from(e.value().1.points)).sum()
    }
}

/// In-memory registry of users keyed by user name.
#[derive(Debug, Default)]
pub struct UserRegistry {
    users: DashMap<String, Arc<User>>,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user` unless the name is taken. Returns whether it was added.
    pub fn add_user(&self, user: Arc<User>) -> bool {
        match self.users.entry(user.user_name().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(user);
                true
            }
        }
    }

    pub fn user(&self, user_name: &str) -> Option<Arc<User>> {
        self.users.get(user_name).map(|u| Arc::clone(u.value()))
    }

    pub fn all_users(&self) -> Vec<Arc<User>> {
        self.users.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl FromIterator<Arc<User>> for UserRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<User>>>(iter: I) -> Self {
        let registry = Self::new();
        for user in iter {
            registry.add_user(user);
        }
        registry
    }
}
