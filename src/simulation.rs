//! In-process providers for tests, demos and load runs.
//!
//! - [`SimulatedGps`] returns random coordinates after a configurable delay
//! - [`SimulatedRewardCentral`] returns random point values after a
//!   configurable delay
//! - [`StaticCatalog`] serves a fixed attraction list
//!
//! Both providers can be told to fail for specific ids.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashSet;
use rand::Rng;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::providers::{AttractionSource, GpsProvider, ScoringProvider};
use crate::user::User;
use crate::{Attraction, Coordinate, VisitedLocation};

/// Latitude bound of the Web Mercator projection.
pub const MAX_LATITUDE: f64 = 85.051_128_78;

fn random_coordinate<R: Rng>(rng: &mut R) -> Coordinate {
    Coordinate::new(
        rng.gen_range(-MAX_LATITUDE..=MAX_LATITUDE),
        rng.gen_range(-180.0..=180.0),
    )
}

/// GPS provider answering from a random number generator.
#[derive(Debug, Default)]
pub struct SimulatedGps {
    latency: Duration,
    fixed: Option<Coordinate>,
    failing: DashSet<Uuid>,
    calls: AtomicUsize,
}

impl SimulatedGps {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn instant() -> Self {
        Self::default()
    }

    /// Always report `coordinate`.
    pub fn at(coordinate: Coordinate) -> Self {
        Self {
            fixed: Some(coordinate),
            ..Self::default()
        }
    }

    /// Make every call for `user_id` fail.
    pub fn fail_for(&self, user_id: Uuid) {
        self.failing.insert(user_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl GpsProvider for SimulatedGps {
    fn user_location(&self, user_id: Uuid) -> Result<Coordinate, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.failing.contains(&user_id) {
            return Err(ProviderError::Gps {
                user_id,
                message: "no fix".to_string(),
            });
        }
        Ok(self.fixed.unwrap_or_else(|| random_coordinate(&mut rand::thread_rng())))
    }
}

/// Scoring provider returning random points in `1..=1000`.
#[derive(Debug, Default)]
pub struct SimulatedRewardCentral {
    latency: Duration,
    points: Option<i32>,
    failing: DashSet<Uuid>,
    calls: AtomicUsize,
}

impl SimulatedRewardCentral {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn instant() -> Self {
        Self::default()
    }

    /// Always answer `points`.
    pub fn with_points(mut self, points: i32) -> Self {
        self.points = Some(points);
        self
    }

    /// Make every call for `attraction_id` fail.
    pub fn fail_for(&self, attraction_id: Uuid) {
        self.failing.insert(attraction_id);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ScoringProvider for SimulatedRewardCentral {
    fn attraction_reward_points(&self, attraction_id: Uuid, user_id: Uuid) -> Result<i32, ProviderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if self.failing.contains(&attraction_id) {
            return Err(ProviderError::Scoring {
                attraction_id,
                user_id,
                message: "service unavailable".to_string(),
            });
        }
        Ok(self
            .points
            .unwrap_or_else(|| rand::thread_rng().gen_range(1..=1000)))
    }
}

/// Fixed attraction list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    attractions: Vec<Attraction>,
}

impl StaticCatalog {
    pub fn new(attractions: Vec<Attraction>) -> Self {
        Self { attractions }
    }

    /// Twenty-six attractions across the United States.
    pub fn sample() -> Self {
        const SAMPLE: &[(&str, &str, &str, f64, f64)] = &[
            ("Disneyland", "Anaheim", "CA", 33.817595, -117.922008),
            ("Jackson Hole", "Jackson Hole", "WY", 43.582767, -110.821999),
            ("Mojave National Preserve", "Kelso", "CA", 35.141689, -115.510399),
            ("Joshua Tree National Park", "Joshua Tree National Park", "CA", 33.881866, -115.90065),
            ("Buffalo National River", "St Joe", "AR", 35.985512, -92.757652),
            ("Hot Springs National Park", "Hot Springs", "AR", 34.52153, -93.042267),
            ("Kartchner Caverns State Park", "Benson", "AZ", 31.837551, -110.347382),
            ("Legend Valley", "Thornville", "OH", 39.937778, -82.40667),
            ("Flowers Bakery of London", "Flowers Bakery of London", "KY", 37.131527, -84.07486),
            ("McKinley Tower", "Anchorage", "AK", 61.218887, -149.877502),
            ("Flatiron Building", "New York City", "NY", 40.741112, -73.989723),
            ("Fallingwater", "Mill Run", "PA", 39.906113, -79.468056),
            ("Union Station", "Washington D.C.", "CA", 38.897095, -77.006332),
            ("Roger Dean Stadium", "Jupiter", "FL", 26.890959, -80.116577),
            ("Texas Memorial Stadium", "Austin", "TX", 30.284, -97.732515),
            ("Bryant-Denny Stadium", "Tuscaloosa", "AL", 33.208351, -87.550384),
            ("Tiger Stadium", "Baton Rouge", "LA", 30.412035, -91.183815),
            ("Neyland Stadium", "Knoxville", "TN", 35.955013, -83.925011),
            ("Kyle Field", "College Station", "TX", 30.610278, -96.340278),
            ("San Diego Zoo", "San Diego", "CA", 32.735317, -117.149048),
            ("Zoo Tampa at Lowry Park", "Tampa", "FL", 28.012804, -82.469269),
            ("Franklin Park Zoo", "Boston", "MA", 42.302601, -71.086731),
            ("El Paso Zoo", "El Paso", "TX", 31.769125, -106.44487),
            ("Kansas City Zoo", "Kansas City", "MO", 39.007504, -94.529625),
            ("Bronx Zoo", "Bronx", "NY", 40.852905, -73.872971),
            ("Cinderella Castle", "Orlando", "FL", 28.419411, -81.5812),
        ];

        Self::new(
            SAMPLE
                .iter()
                .map(|&(name, city, state, lat, lng)| Attraction::new(name, city, state, Coordinate::new(lat, lng)))
                .collect(),
        )
    }
}

impl AttractionSource for StaticCatalog {
    fn attractions(&self) -> Result<Vec<Attraction>, ProviderError> {
        Ok(self.attractions.clone())
    }
}

/// Generate `count` internal users, each with `history_len` random visits
/// spread over the last 30 days.
pub fn generate_users(count: usize, history_len: usize) -> Vec<Arc<User>> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let name = format!("internal-user-{}", i);
            let user = User::new(Uuid::new_v4(), name.as_str(), "000", format!("{}@example.com", name));
            for _ in 0..history_len {
                let timestamp = Utc::now() - ChronoDuration::days(rng.gen_range(0..30));
                user.add_visited_location(VisitedLocation::new(user.id(), random_coordinate(&mut rng), timestamp));
            }
            Arc::new(user)
        })
        .collect()
}
