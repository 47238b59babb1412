//! Recorded drive logs: one JSON sample per line, optionally gzip-compressed.
//!
//! ```text
//! {"timestamp":"2024-03-01T08:00:00Z","latitude":37.7749,"longitude":-122.4194,"speed_kph":0.4,"acceleration_g":1.01}
//! ```

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::SampleLogError;
use crate::types::{Coordinate, VehicleSample};

#[derive(Deserialize)]
struct SampleRecord {
    timestamp: DateTime<Utc>,
    #[serde(alias = "lat")]
    latitude: f64,
    #[serde(alias = "lon")]
    longitude: f64,
    #[serde(alias = "speed")]
    speed_kph: f64,
    #[serde(alias = "accel_g")]
    acceleration_g: f64,
}

impl From<SampleRecord> for VehicleSample {
    fn from(record: SampleRecord) -> Self {
        VehicleSample::new(
            Coordinate::new(record.latitude, record.longitude),
            record.speed_kph,
            record.acceleration_g,
            record.timestamp,
        )
    }
}

/// Load a sample log, decompressing `.gz` files
pub fn read_samples(path: &Path) -> Result<Vec<VehicleSample>, SampleLogError> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        parse_samples(BufReader::new(GzDecoder::new(file)))
    } else {
        parse_samples(BufReader::new(file))
    }
}

/// Parse JSON lines; blank lines, `#` comments and undecodable lines are skipped
pub fn parse_samples<R: BufRead>(reader: R) -> Result<Vec<VehicleSample>, SampleLogError> {
    let mut samples = Vec::new();
    let mut skipped = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match serde_json::from_str::<SampleRecord>(trimmed) {
            Ok(record) => samples.push(record.into()),
            Err(e) => {
                skipped += 1;
                log::warn!("Skipping sample line {}: {}", index + 1, e);
            }
        }
    }

    if samples.is_empty() {
        return Err(SampleLogError::Empty);
    }
    if skipped > 0 {
        log::info!("Loaded {} samples ({} lines skipped)", samples.len(), skipped);
    }
    Ok(samples)
}
