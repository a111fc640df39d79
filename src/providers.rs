//! Interfaces to the external collaborators.
//!
//! All three may be slow. Implementations block the calling worker for the
//! duration of the call; the engine never calls them while holding a lock
//! shared across keys or users.

use uuid::Uuid;

use crate::error::ProviderError;
use crate::{Attraction, Coordinate};

/// Current position of a user.
pub trait GpsProvider: Send + Sync {
    fn user_location(&self, user_id: Uuid) -> Result<Coordinate, ProviderError>;
}

/// Point value of an attraction for a user.
pub trait ScoringProvider: Send + Sync {
    fn attraction_reward_points(&self, attraction_id: Uuid, user_id: Uuid) -> Result<i32, ProviderError>;
}

/// Source of the attraction catalog. Consulted once at startup.
pub trait AttractionSource {
    fn attractions(&self) -> Result<Vec<Attraction>, ProviderError>;
}
