//! The immutable attraction catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};
use uuid::Uuid;

use crate::error::ProviderError;
use crate::geo_utils;
use crate::providers::AttractionSource;
use crate::{Attraction, Coordinate};

/// Attractions loaded once at startup and shared read-only afterwards.
///
/// No interior mutability: concurrent readers need no synchronization.
#[derive(Debug, Clone, Default)]
pub struct AttractionCatalog {
    attractions: Vec<Arc<Attraction>>,
    by_id: HashMap<Uuid, usize>,
}

impl AttractionCatalog {
    /// Load the catalog from its source. The source is called exactly once.
    pub fn load<S: AttractionSource + ?Sized>(source: &S) -> Result<Self, ProviderError> {
        let start = Instant::now();
        let attractions = source.attractions()?;
        let catalog = Self::from_attractions(attractions);
        info!(
            "[AttractionCatalog] Loaded {} attractions in {:?}",
            catalog.len(),
            start.elapsed()
        );
        Ok(catalog)
    }

    /// Build a catalog directly. Later duplicates of an id are dropped.
    pub fn from_attractions(attractions: Vec<Attraction>) -> Self {
        let mut kept = Vec::with_capacity(attractions.len());
        let mut by_id = HashMap::with_capacity(attractions.len());

        for attraction in attractions {
            if by_id.contains_key(&attraction.id) {
                warn!(
                    "[AttractionCatalog] Duplicate attraction id {} ({}), keeping the first",
                    attraction.id, attraction.name
                );
                continue;
            }
            if !attraction.coordinate.is_valid() {
                warn!(
                    "[AttractionCatalog] Attraction {} has out-of-range coordinate {:?}",
                    attraction.name, attraction.coordinate
                );
            }
            by_id.insert(attraction.id, kept.len());
            kept.push(Arc::new(attraction));
        }

        Self {
            attractions: kept,
            by_id,
        }
    }

    pub fn attractions(&self) -> &[Arc<Attraction>] {
        &self.attractions
    }

    pub fn get(&self, id: &Uuid) -> Option<&Arc<Attraction>> {
        self.by_id.get(id).map(|&i| &self.attractions[i])
    }

    /// The `k` closest attractions to `coordinate`, nearest first.
    pub fn nearest(&self, coordinate: &Coordinate, k: usize) -> Vec<(Arc<Attraction>, f64)> {
        geo_utils::nearest(&self.attractions, coordinate, k)
    }

    pub fn len(&self) -> usize {
        self.attractions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attractions.is_empty()
    }
}
