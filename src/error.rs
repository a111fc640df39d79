//! Error types shared across the engine.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// A call to one of the external providers failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("gps provider failed for user {user_id}: {message}")]
    Gps { user_id: Uuid, message: String },

    #[error("scoring provider failed for attraction {attraction_id} (user {user_id}): {message}")]
    Scoring {
        attraction_id: Uuid,
        user_id: Uuid,
        message: String,
    },

    #[error("attraction catalog unavailable: {0}")]
    Catalog(String),
}

/// Errors raised by the engine itself rather than by a provider.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// The queue is full and the submitting thread cannot run the task inline.
    #[error("worker pool saturated: {pending} tasks queued (capacity {capacity})")]
    Capacity { pending: usize, capacity: usize },

    #[error("engine is shutting down")]
    Shutdown,

    #[error("failed to start worker threads: {0}")]
    ThreadSpawn(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A single tracking call failed. Carries the user it was issued for.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("tracking failed for user {user_id}: {source}")]
pub struct TrackingError {
    pub user_id: Uuid,
    #[source]
    pub source: EngineError,
}

impl TrackingError {
    pub fn new(user_id: Uuid, source: impl Into<EngineError>) -> Self {
        Self {
            user_id,
            source: source.into(),
        }
    }

    /// True when the failure came from the GPS or scoring provider.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self.source, EngineError::Provider(_))
    }
}

/// Outcome of draining the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// False when an earlier call had already shut the pool down.
    pub initiated: bool,
    /// True when all in-flight work finished inside the drain timeout.
    pub drained: bool,
    /// Tasks still queued or running when the drain gave up.
    pub outstanding: usize,
    pub waited: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_error_wraps_provider_failure() {
        let user_id = Uuid::new_v4();
        let err = TrackingError::new(
            user_id,
            ProviderError::Gps {
                user_id,
                message: "socket closed".to_string(),
            },
        );

        assert!(err.is_provider_failure());
        assert!(err.to_string().contains("socket closed"));
        assert!(!TrackingError::new(user_id, EngineError::Shutdown).is_provider_failure());
    }
}
