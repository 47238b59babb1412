//! Spatial bucketing helpers: geohash cells and great-circle distance.

use geo::HaversineDistance;

use crate::types::Coordinate;

/// Geohash precision used for node cache buckets (~150 m cells)
pub const CACHE_PRECISION: usize = 7;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Encode a coordinate as a base32 geohash of `precision` characters
///
/// Bits alternate longitude / latitude starting with longitude; each
/// character packs five bits.
pub fn geohash(coordinate: &Coordinate, precision: usize) -> String {
    let mut lat_range = (-90.0_f64, 90.0_f64);
    let mut lon_range = (-180.0_f64, 180.0_f64);
    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut bit = 0;
    let mut ch = 0usize;

    while hash.len() < precision {
        if even_bit {
            let mid = (lon_range.0 + lon_range.1) / 2.0;
            if coordinate.longitude >= mid {
                ch |= 1 << (4 - bit);
                lon_range.0 = mid;
            } else {
                lon_range.1 = mid;
            }
        } else {
            let mid = (lat_range.0 + lat_range.1) / 2.0;
            if coordinate.latitude >= mid {
                ch |= 1 << (4 - bit);
                lat_range.0 = mid;
            } else {
                lat_range.1 = mid;
            }
        }

        even_bit = !even_bit;

        if bit < 4 {
            bit += 1;
        } else {
            hash.push(BASE32[ch] as char);
            bit = 0;
            ch = 0;
        }
    }

    hash
}

/// Great-circle distance in meters (haversine, mean earth radius)
pub fn distance_meters(a: &Coordinate, b: &Coordinate) -> f64 {
    a.to_point().haversine_distance(&b.to_point())
}

/// Key for the fallback simulator: coordinate rounded to 4 decimals (~11 m)
pub fn intersection_key(coordinate: &Coordinate) -> String {
    format!("{:.4}_{:.4}", coordinate.latitude, coordinate.longitude)
}
