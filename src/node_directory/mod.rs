//! Traffic-signal node lookup: remote Overpass source, spatial cache, nearest-node search

pub mod directory;
pub mod node_tree;
pub mod overpass_client;
pub mod spatial_cache;

pub use directory::{NodeDirectory, SignalNodeDirectory, AREA_SEARCH_RADIUS_M, NEAREST_SIGNAL_RADIUS_M};
pub use node_tree::NodeTree;
pub use overpass_client::{parse_overpass_json, NodeSource, OverpassClient, OverpassNodes, DEFAULT_OVERPASS_URL};
pub use spatial_cache::{CachedNodeSet, SpatialCache, CACHE_TTL_DAYS, ORIGIN_RADIUS_RATIO};
