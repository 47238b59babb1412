use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{NodeSource, NodeTree, SpatialCache};
use crate::error::NodeLookupError;
use crate::types::{Coordinate, TrafficNode};

/// Default radius for area searches (meters)
pub const AREA_SEARCH_RADIUS_M: f64 = 500.0;
/// Default radius for "signal I am stopped at" lookups (meters)
pub const NEAREST_SIGNAL_RADIUS_M: f64 = 50.0;

/// Resolves a coordinate to the nearest known traffic-signal node
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn find_nearest(
        &self,
        coordinate: Coordinate,
        max_distance_m: f64,
    ) -> Result<Option<TrafficNode>, NodeLookupError>;
}

/// Spatial cache in front of a remote node source
///
/// The cache lock is held across the remote fetch, so concurrent queries for
/// the same cell wait for the first fetch instead of issuing their own.
pub struct SignalNodeDirectory {
    source: Arc<dyn NodeSource>,
    cache: Mutex<SpatialCache>,
}

impl SignalNodeDirectory {
    pub fn new(source: Arc<dyn NodeSource>) -> Self {
        Self::with_cache(source, SpatialCache::new())
    }

    pub fn with_cache(source: Arc<dyn NodeSource>, cache: SpatialCache) -> Self {
        SignalNodeDirectory {
            source,
            cache: Mutex::new(cache),
        }
    }

    /// All signal nodes within `radius_m`, served from cache when possible
    pub async fn find_traffic_signals(
        &self,
        coordinate: Coordinate,
        radius_m: f64,
    ) -> Result<Arc<NodeTree>, NodeLookupError> {
        let mut cache = self.cache.lock().await;
        let now = Utc::now();

        if let Some(nodes) = cache.lookup(&coordinate, radius_m, now) {
            log::debug!("Node cache hit for bucket {}", cache.bucket(&coordinate));
            return Ok(nodes);
        }

        log::debug!(
            "Node cache miss for bucket {}, fetching {:.0} m",
            cache.bucket(&coordinate),
            radius_m
        );

        let fetched = match self.source.fetch_traffic_signal_nodes(coordinate, radius_m).await {
            Ok(nodes) => nodes,
            Err(e) => {
                log::warn!("Traffic signal lookup failed: {}", e);
                return Err(e);
            }
        };

        let tree = Arc::new(NodeTree::from_nodes(fetched));
        cache.store(Arc::clone(&tree), coordinate, radius_m, now);
        Ok(tree)
    }

    /// Evict every expired cache entry
    pub async fn clear_expired(&self) -> usize {
        self.cache.lock().await.clear_expired(Utc::now())
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

#[async_trait]
impl NodeDirectory for SignalNodeDirectory {
    /// Nearest node within `max_distance_m`; the candidate set is fetched
    /// with `max_distance_m` as its radius
    async fn find_nearest(
        &self,
        coordinate: Coordinate,
        max_distance_m: f64,
    ) -> Result<Option<TrafficNode>, NodeLookupError> {
        let candidates = self.find_traffic_signals(coordinate, max_distance_m).await?;
        Ok(candidates.nearest_within(&coordinate, max_distance_m).cloned())
    }
}
