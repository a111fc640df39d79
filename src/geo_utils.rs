//! # Geographic Utilities
//!
//! Proximity checks between users and attractions.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`distance_miles`] | Great-circle distance between two coordinates in statute miles |
//! | [`is_near`] | Whether an attraction lies within a threshold of a coordinate |
//! | [`nearest`] | The `k` closest attractions to a coordinate, no distance gate |
//!
//! ## Algorithm Notes
//!
//! ### Spherical Law of Cosines
//!
//! The central angle between two points is
//! `acos(sin φ1·sin φ2 + cos φ1·cos φ2·cos(λ1 − λ2))`. Converted to degrees it
//! gives nautical miles at 60 per degree, then statute miles at
//! 1.15077945 per nautical mile.
//!
//! Rounding can push the `acos` argument a hair past 1.0 for coincident
//! points, so it is clamped to `[-1, 1]`.
//!
//! ### Thresholds
//!
//! Callers always pass the threshold in. The reward gate uses the tracking
//! threshold (10 miles by default); the looser attraction proximity check
//! uses its own threshold (200 miles by default). Ranking with [`nearest`]
//! takes no threshold at all.

use std::sync::Arc;

use crate::{Attraction, Coordinate};

pub const STATUTE_MILES_PER_NAUTICAL_MILE: f64 = 1.15077945;

const NAUTICAL_MILES_PER_DEGREE: f64 = 60.0;

// =============================================================================
// Distance Functions
// =============================================================================

/// Great-circle distance between two coordinates in statute miles.
///
/// Symmetric, and exactly zero for identical coordinates.
///
/// # Example
///
/// ```rust
/// use reward_tracker::{Coordinate, geo_utils};
///
/// let london = Coordinate::new(51.5074, -0.1278);
/// let paris = Coordinate::new(48.8566, 2.3522);
///
/// let miles = geo_utils::distance_miles(&london, &paris);
/// assert!((miles - 213.0).abs() < 2.0);
/// ```
pub fn distance_miles(a: &Coordinate, b: &Coordinate) -> f64 {
    if a == b {
        return 0.0;
    }

    let lat1 = a.latitude.to_radians();
    let lon1 = a.longitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let lon2 = b.longitude.to_radians();

    let cos_angle = (lat1.sin() * lat2.sin() + lat1.cos() * lat2.cos() * (lon1 - lon2).cos())
        .clamp(-1.0, 1.0);
    let nautical_miles = cos_angle.acos().to_degrees() * NAUTICAL_MILES_PER_DEGREE;

    STATUTE_MILES_PER_NAUTICAL_MILE * nautical_miles
}

/// Check whether `attraction` lies within `threshold_miles` of `coordinate`.
///
/// The boundary is inclusive.
#[inline]
pub fn is_near(attraction: &Attraction, coordinate: &Coordinate, threshold_miles: f64) -> bool {
    distance_miles(&attraction.coordinate, coordinate) <= threshold_miles
}

// =============================================================================
// Ranking
// =============================================================================

/// The `k` attractions closest to `coordinate`, nearest first, with their
/// distance in miles.
///
/// Equal distances keep catalog order. Returns fewer than `k` entries when the
/// catalog is smaller.
pub fn nearest(
    attractions: &[Arc<Attraction>],
    coordinate: &Coordinate,
    k: usize,
) -> Vec<(Arc<Attraction>, f64)> {
    let mut ranked: Vec<(Arc<Attraction>, f64)> = attractions
        .iter()
        .map(|a| (Arc::clone(a), distance_miles(&a.coordinate, coordinate)))
        .collect();

    // Stable sort keeps catalog order for ties
    ranked.sort_by(|x, y| x.1.total_cmp(&y.1));
    ranked.truncate(k);
    ranked
}

// =============================================================================
// Tests
// =============================================================================
