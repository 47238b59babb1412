use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use super::Coordinate;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalPhase {
    Red,
    Yellow,
    Green,
    Unknown,
}

impl SignalPhase {
    /// Lenient parse of a wire phase string; anything unrecognised is `Unknown`
    pub fn from_wire(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "red" => SignalPhase::Red,
            "yellow" | "amber" => SignalPhase::Yellow,
            "green" => SignalPhase::Green,
            _ => SignalPhase::Unknown,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            SignalPhase::Red => "Red",
            SignalPhase::Yellow => "Yellow",
            SignalPhase::Green => "Green",
            SignalPhase::Unknown => "Unknown",
        }
    }
}

impl Display for SignalPhase {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.title())
    }
}

/// Next-green estimate for one learned node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalPrediction {
    pub node_id: String,
    pub next_green_time: DateTime<Utc>,
    /// Seconds
    pub cycle_length: f64,
    pub confidence: f64,
}

/// Fused prediction handed to presentation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrafficSignal {
    pub id: String,
    pub intersection_id: String,
    pub intersection_name: String,
    pub coordinate: Coordinate,
    pub phase: SignalPhase,
    pub next_green_at: Option<DateTime<Utc>>,
    pub phase_ends_at: Option<DateTime<Utc>>,
    pub confidence: f64,
    pub source: String,
    pub server_timestamp: DateTime<Utc>,
}

impl TrafficSignal {
    pub fn signal_id(intersection_id: &str, timestamp: DateTime<Utc>) -> String {
        format!("{}@{}", intersection_id, timestamp.timestamp_millis())
    }

    /// Whole seconds until green, floored at zero
    pub fn countdown_to_green(&self, now: DateTime<Utc>) -> Option<i64> {
        self.next_green_at.map(|at| whole_seconds_until(at, now))
    }

    pub fn phase_countdown(&self, now: DateTime<Utc>) -> Option<i64> {
        self.phase_ends_at.map(|at| whole_seconds_until(at, now))
    }

    pub fn is_production_grade(&self) -> bool {
        self.confidence >= 0.85 && !self.source.eq_ignore_ascii_case("heuristic")
    }
}

fn whole_seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (at - now).num_milliseconds();
    (millis.max(0) as f64 / 1000.0).floor() as i64
}
