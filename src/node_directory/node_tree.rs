use rstar::{RTree, RTreeObject, AABB};

use crate::types::{Coordinate, TrafficNode};

/// Approximate meters per degree, used only to size the search envelope.
/// Slightly below the true value so the envelope errs on the large side.
const METERS_PER_DEGREE: f64 = 111_000.0;

/// Index entry pointing back into `NodeTree::nodes`
#[derive(Clone, Debug)]
struct IndexedNode {
    index: usize,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexedNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// R-Tree over a fetched set of traffic-signal nodes
///
/// # Query Strategy
/// - Envelope query in degrees to prefilter candidates
/// - Exact great-circle distance on the survivors
///
/// Nodes keep their fetch order in `nodes()`.
#[derive(Debug)]
pub struct NodeTree {
    nodes: Vec<TrafficNode>,
    tree: RTree<IndexedNode>,
}

impl NodeTree {
    pub fn new() -> Self {
        NodeTree {
            nodes: Vec::new(),
            tree: RTree::new(),
        }
    }

    pub fn from_nodes(nodes: Vec<TrafficNode>) -> Self {
        let entries: Vec<IndexedNode> = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| IndexedNode {
                index,
                envelope: AABB::from_point([node.coordinate.longitude, node.coordinate.latitude]),
            })
            .collect();

        NodeTree {
            nodes,
            tree: RTree::bulk_load(entries),
        }
    }

    pub fn nodes(&self) -> &[TrafficNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes within `radius_m` of `point`, nearest first
    pub fn within(&self, point: &Coordinate, radius_m: f64) -> Vec<(&TrafficNode, f64)> {
        if radius_m.is_nan() || radius_m < 0.0 {
            return Vec::new();
        }

        let envelope = search_envelope(point, radius_m);
        let mut candidates: Vec<(&TrafficNode, f64)> = self
            .tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| {
                let node = &self.nodes[entry.index];
                (node, point.distance_to(&node.coordinate))
            })
            .filter(|(_, dist)| *dist <= radius_m)
            .collect();

        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));
        candidates
    }

    /// Node minimising great-circle distance, if any lies within `max_distance_m`
    pub fn nearest_within(&self, point: &Coordinate, max_distance_m: f64) -> Option<&TrafficNode> {
        self.within(point, max_distance_m)
            .into_iter()
            .next()
            .map(|(node, _)| node)
    }
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Degree envelope guaranteed to contain every point within `radius_m`
fn search_envelope(point: &Coordinate, radius_m: f64) -> AABB<[f64; 2]> {
    let lat_deg = radius_m / METERS_PER_DEGREE;
    let cos_lat = point.latitude.to_radians().cos().abs().max(1e-6);
    let lon_deg = (radius_m / (METERS_PER_DEGREE * cos_lat)).min(360.0);

    AABB::from_corners(
        [point.longitude - lon_deg, point.latitude - lat_deg],
        [point.longitude + lon_deg, point.latitude + lat_deg],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i64, lat: f64, lon: f64) -> TrafficNode {
        TrafficNode::new(format!("osm-{}", id), Coordinate::new(lat, lon), id)
    }

    #[test]
    fn test_build_tree_keeps_order() {
        let tree = NodeTree::from_nodes(vec![node(2, 37.7750, -122.4195), node(1, 37.7749, -122.4194)]);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.nodes()[0].osm_id, 2);
        assert_eq!(tree.nodes()[1].osm_id, 1);
    }

    #[test]
    fn test_nearest_within_picks_closest() {
        let origin = Coordinate::new(37.7749, -122.4194);
        let tree = NodeTree::from_nodes(vec![
            node(1, 37.7752, -122.4194), // ~33 m north
            node(2, 37.7750, -122.4194), // ~11 m north
            node(3, 37.7800, -122.4194), // ~570 m north
        ]);

        let nearest = tree.nearest_within(&origin, 50.0).expect("node in range");
        assert_eq!(nearest.osm_id, 2);
    }

    #[test]
    fn test_nearest_within_respects_max_distance() {
        let origin = Coordinate::new(37.7749, -122.4194);
        let tree = NodeTree::from_nodes(vec![node(3, 37.7800, -122.4194)]);

        assert!(tree.nearest_within(&origin, 50.0).is_none());
        assert!(tree.nearest_within(&origin, 1_000.0).is_some());
    }

    #[test]
    fn test_within_sorted_by_distance() {
        let origin = Coordinate::new(48.8566, 2.3522);
        let tree = NodeTree::from_nodes(vec![
            node(1, 48.8570, 2.3522),
            node(2, 48.8567, 2.3522),
            node(3, 48.8566, 2.3530),
        ]);

        let hits = tree.within(&origin, 500.0);
        assert_eq!(hits.len(), 3);
        assert!(hits.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(hits[0].0.osm_id, 2);
    }

    #[test]
    fn test_high_latitude_longitude_envelope() {
        // At 70° a degree of longitude is ~38 km, envelope must widen
        let origin = Coordinate::new(70.0, 20.0);
        let east = node(1, 70.0, 20.0010); // ~38 m east
        let tree = NodeTree::from_nodes(vec![east]);
        assert!(tree.nearest_within(&origin, 50.0).is_some());
    }

    #[test]
    fn test_empty_tree() {
        let tree = NodeTree::new();
        assert!(tree.is_empty());
        assert!(tree.nearest_within(&Coordinate::new(0.0, 0.0), 50.0).is_none());
    }
}
