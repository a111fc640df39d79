//! # Reward Tracker
//!
//! Concurrent location tracking and attraction reward computation.
//!
//! This library provides:
//! - Great-circle proximity checks between users and attractions
//! - Exactly-once reward accounting per (user, attraction) pair
//! - A single-flight cache in front of a slow scoring provider
//! - Batch tracking and reward computation over a bounded worker pool
//!   with caller-runs backpressure and graceful shutdown
//!
//! ## Features
//!
//! - **`serde`** - Derive `Serialize`/`Deserialize` on the data model and batch reports
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use reward_tracker::{EngineConfig, RewardEngine, User};
//! use reward_tracker::simulation::{SimulatedGps, SimulatedRewardCentral, StaticCatalog};
//!
//! let engine = RewardEngine::new(
//!     Arc::new(SimulatedGps::instant()),
//!     Arc::new(SimulatedRewardCentral::instant()),
//!     &StaticCatalog::sample(),
//!     EngineConfig::default(),
//! ).unwrap();
//!
//! let users: Vec<Arc<User>> = (0..10)
//!     .map(|i| Arc::new(User::new(uuid::Uuid::new_v4(), format!("user{}", i), "000", "user@example.com")))
//!     .collect();
//!
//! let report = engine.track_all(&users).unwrap().wait();
//! assert_eq!(report.completed, 10);
//! engine.shutdown();
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod batch;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo_utils;
pub mod pool;
pub mod providers;
pub mod rewards;
pub mod simulation;
pub mod tracker;
pub mod user;

pub use batch::{BatchHandle, BatchKind, BatchOrchestrator, BatchReport, BatchState};
pub use cache::{CacheKeyPolicy, CacheStats, RewardPointCache};
pub use catalog::AttractionCatalog;
pub use config::EngineConfig;
pub use engine::RewardEngine;
pub use error::{EngineError, ProviderError, ShutdownReport, TrackingError};
pub use pool::{Dispatch, WorkerPool};
pub use providers::{AttractionSource, GpsProvider, ScoringProvider};
pub use rewards::{RewardAccumulator, RewardOutcome};
pub use tracker::{LocationTracker, NearbyAttraction, PeriodicTracker};
pub use user::{User, UserRegistry};

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate in degrees.
///
/// # Example
/// ```
/// use reward_tracker::Coordinate;
/// let disneyland = Coordinate::new(33.817595, -117.922008);
/// assert!(disneyland.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Check if the coordinate is finite and inside the valid lat/lng ranges.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A fixed point of interest.
///
/// Built once when the catalog loads and shared read-only behind an `Arc`
/// by every worker afterwards.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Attraction {
    pub id: Uuid,
    pub name: String,
    pub city: String,
    pub state: String,
    pub coordinate: Coordinate,
}

impl Attraction {
    /// Create an attraction with a fresh random id.
    pub fn new(
        name: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        coordinate: Coordinate,
    ) -> Self {
        Self::with_id(Uuid::new_v4(), name, city, state, coordinate)
    }

    pub fn with_id(
        id: Uuid,
        name: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
        coordinate: Coordinate,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            city: city.into(),
            state: state.into(),
            coordinate,
        }
    }
}

/// A timestamped observation of a user's position.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VisitedLocation {
    pub user_id: Uuid,
    pub coordinate: Coordinate,
    pub timestamp: DateTime<Utc>,
}

impl VisitedLocation {
    pub fn new(user_id: Uuid, coordinate: Coordinate, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id,
            coordinate,
            timestamp,
        }
    }

    /// Observation stamped with the current wall-clock time.
    pub fn now(user_id: Uuid, coordinate: Coordinate) -> Self {
        Self::new(user_id, coordinate, Utc::now())
    }
}

/// Points granted to a user for visiting an attraction.
///
/// A user holds at most one of these per attraction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UserReward {
    /// The visit that qualified the user
    pub visited_location: VisitedLocation,
    pub attraction: Arc<Attraction>,
    pub points: i32,
}

impl UserReward {
    pub fn new(visited_location: VisitedLocation, attraction: Arc<Attraction>, points: i32) -> Self {
        Self {
            visited_location,
            attraction,
            points,
        }
    }

    pub fn attraction_id(&self) -> Uuid {
        self.attraction.id
    }
}

// ============================================================================
// Tests
// ============================================================================
