pub mod signal;

pub use signal::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::geo_key;

/// Below this speed (km/h) the vehicle counts as stationary
pub const STATIONARY_SPEED_KPH: f64 = 1.0;
/// At or above this speed (km/h) the vehicle counts as moving
pub const MOVING_SPEED_KPH: f64 = 5.0;

/// WGS84 position in degrees
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Coordinate { latitude, longitude }
    }

    /// Finite and inside [-90, 90] / [-180, 180]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }

    /// Great-circle distance in meters
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        geo_key::distance_meters(self, other)
    }

    pub fn geohash(&self, precision: usize) -> String {
        geo_key::geohash(self, precision)
    }

    /// geo crate uses (x, y) = (lon, lat)
    pub(crate) fn to_point(self) -> geo::Point<f64> {
        geo::Point::new(self.longitude, self.latitude)
    }
}

/// One fused location/speed/acceleration reading from the sensor layer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleSample {
    pub location: Coordinate,
    pub speed_kph: f64,
    /// Acceleration magnitude in g, gravity included (1.0 at rest)
    pub acceleration_g: f64,
    pub timestamp: DateTime<Utc>,
}

impl VehicleSample {
    pub fn new(location: Coordinate, speed_kph: f64, acceleration_g: f64, timestamp: DateTime<Utc>) -> Self {
        VehicleSample {
            location,
            speed_kph,
            acceleration_g,
            timestamp,
        }
    }

    pub fn is_stationary(&self) -> bool {
        self.speed_kph < STATIONARY_SPEED_KPH
    }

    pub fn is_moving(&self) -> bool {
        self.speed_kph >= MOVING_SPEED_KPH
    }

    /// Rejects NaN / negative readings and out-of-range coordinates
    pub fn is_well_formed(&self) -> bool {
        self.speed_kph.is_finite()
            && self.speed_kph >= 0.0
            && self.acceleration_g.is_finite()
            && self.acceleration_g >= 0.0
            && self.location.is_valid()
    }
}

/// Discrete events emitted by the vehicle state tracker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TelematicsEvent {
    HardStop {
        location: Coordinate,
        timestamp: DateTime<Utc>,
    },
    GreenLightLaunch {
        location: Coordinate,
        timestamp: DateTime<Utc>,
    },
    Moving {
        speed_kph: f64,
    },
    Stopped {
        location: Coordinate,
    },
}

/// Physical traffic-signal node as returned by the node lookup service
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficNode {
    pub id: String,
    pub coordinate: Coordinate,
    pub osm_id: i64,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

impl TrafficNode {
    pub fn new(id: impl Into<String>, coordinate: Coordinate, osm_id: i64) -> Self {
        TrafficNode {
            id: id.into(),
            coordinate,
            osm_id,
            tags: HashMap::new(),
        }
    }

    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn geohash(&self) -> String {
        self.coordinate.geohash(geo_key::CACHE_PRECISION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(speed: f64, accel: f64) -> VehicleSample {
        VehicleSample::new(
            Coordinate::new(37.7749, -122.4194),
            speed,
            accel,
            Utc.timestamp_opt(0, 0).unwrap(),
        )
    }

    #[test]
    fn test_coordinate_validity() {
        assert!(Coordinate::new(37.7749, -122.4194).is_valid());
        assert!(Coordinate::new(-90.0, 180.0).is_valid());
        assert!(!Coordinate::new(90.5, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, -180.5).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_sample_speed_classes() {
        assert!(sample(0.5, 1.0).is_stationary());
        assert!(!sample(0.5, 1.0).is_moving());
        assert!(!sample(3.0, 1.0).is_stationary());
        assert!(!sample(3.0, 1.0).is_moving());
        assert!(sample(5.0, 1.0).is_moving());
    }

    #[test]
    fn test_sample_well_formed() {
        assert!(sample(10.0, 1.0).is_well_formed());
        assert!(!sample(-1.0, 1.0).is_well_formed());
        assert!(!sample(f64::NAN, 1.0).is_well_formed());
        assert!(!sample(10.0, f64::INFINITY).is_well_formed());
    }

    #[test]
    fn test_node_geohash_precision() {
        let node = TrafficNode::new("osm-1", Coordinate::new(37.7749, -122.4194), 1);
        assert_eq!(node.geohash().len(), geo_key::CACHE_PRECISION);
        assert!(node.geohash().starts_with("9q8yy"));
    }
}
