use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::NodeTree;
use crate::geo_key;
use crate::types::Coordinate;

/// Node sets older than this are refetched
pub const CACHE_TTL_DAYS: i64 = 7;

/// Cached set is only served if the query lies within `radius * ORIGIN_RADIUS_RATIO`
/// of the coordinate it was fetched for
pub const ORIGIN_RADIUS_RATIO: f64 = 0.5;

/// One fetched node set with its metadata
#[derive(Clone, Debug)]
pub struct CachedNodeSet {
    pub nodes: Arc<NodeTree>,
    pub timestamp: DateTime<Utc>,
    pub origin: Coordinate,
    /// Search radius the set was fetched with (meters)
    pub radius_m: f64,
}

/// Geohash-bucketed, time-expiring cache of node lookups
///
/// # Architecture
/// - One entry per precision-7 geohash bucket (~150 m cells)
/// - An entry holds the full result set of one remote fetch
/// - Entries expire after `CACHE_TTL_DAYS`
/// - An entry only answers queries up to the radius it was fetched with
///
/// A bucket hit is rejected when the query sits too far from the entry's
/// origin, so a query near a cell edge does not get results centred on the
/// opposite edge.
#[derive(Debug)]
pub struct SpatialCache {
    entries: HashMap<String, CachedNodeSet>,
    ttl: Duration,
    precision: usize,
}

impl SpatialCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::days(CACHE_TTL_DAYS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        SpatialCache {
            entries: HashMap::new(),
            ttl,
            precision: geo_key::CACHE_PRECISION,
        }
    }

    pub fn bucket(&self, coordinate: &Coordinate) -> String {
        geo_key::geohash(coordinate, self.precision)
    }

    /// Cached nodes for `coordinate`, or `None` on miss
    ///
    /// Expired entries are evicted as a side effect.
    pub fn lookup(&mut self, coordinate: &Coordinate, radius_m: f64, now: DateTime<Utc>) -> Option<Arc<NodeTree>> {
        let bucket = self.bucket(coordinate);

        let cached = self.entries.get(&bucket)?;

        if now - cached.timestamp >= self.ttl {
            log::debug!("Node cache entry {} expired, evicting", bucket);
            self.entries.remove(&bucket);
            return None;
        }

        if radius_m > cached.radius_m {
            log::debug!(
                "Node cache bucket {} fetched for {:.0} m, {:.0} m requested, treating as miss",
                bucket,
                cached.radius_m,
                radius_m
            );
            return None;
        }

        let offset = coordinate.distance_to(&cached.origin);
        if offset > radius_m * ORIGIN_RADIUS_RATIO {
            log::debug!(
                "Node cache bucket {} origin {:.0} m away (limit {:.0} m), treating as miss",
                bucket,
                offset,
                radius_m * ORIGIN_RADIUS_RATIO
            );
            return None;
        }

        Some(Arc::clone(&cached.nodes))
    }

    /// Store a node set fetched within `radius_m` of `origin`, keyed by the bucket of `origin`
    pub fn store(&mut self, nodes: Arc<NodeTree>, origin: Coordinate, radius_m: f64, now: DateTime<Utc>) {
        let bucket = self.bucket(&origin);
        self.entries.insert(
            bucket,
            CachedNodeSet {
                nodes,
                timestamp: now,
                origin,
                radius_m,
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn clear_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| now - entry.timestamp < ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SpatialCache {
    fn default() -> Self {
        Self::new()
    }
}
