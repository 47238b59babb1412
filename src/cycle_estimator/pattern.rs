use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::SignalPrediction;

/// Observations needed before a cycle is estimated
pub const MIN_OBSERVATIONS: usize = 3;
/// History cap per node, oldest evicted first
pub const MAX_OBSERVATIONS: usize = 100;
/// Plausible cycle interval bounds (seconds)
pub const MIN_CYCLE_SECS: f64 = 15.0;
pub const MAX_CYCLE_SECS: f64 = 180.0;
/// Most recent observations averaged for the offset
pub const OFFSET_WINDOW: usize = 10;
/// Average deviation (seconds) at which consistency reaches zero
pub const DEVIATION_TOLERANCE_SECS: f64 = 5.0;
/// Predictions are withheld at or below this confidence
pub const MIN_PREDICTION_CONFIDENCE: f64 = 0.5;

const CONSISTENCY_WEIGHT: f64 = 0.7;
const HISTORY_WEIGHT: f64 = 0.3;

/// Day boundaries for cycle offsets, at a fixed UTC offset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DayClock {
    offset: FixedOffset,
}

impl DayClock {
    pub fn utc() -> Self {
        DayClock { offset: Utc.fix() }
    }

    /// `None` if the offset is a day or more
    pub fn with_offset_minutes(minutes: i32) -> Option<Self> {
        minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .map(|offset| DayClock { offset })
    }

    pub fn start_of_day(&self, time: DateTime<Utc>) -> DateTime<Utc> {
        let local_midnight = time
            .with_timezone(&self.offset)
            .date_naive()
            .and_time(NaiveTime::MIN);
        let utc_midnight = local_midnight - Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Utc.from_utc_datetime(&utc_midnight)
    }

    pub fn seconds_since_midnight(&self, time: DateTime<Utc>) -> f64 {
        (time - self.start_of_day(time)).num_milliseconds() as f64 / 1000.0
    }

    /// 1 = Sunday ... 7 = Saturday
    pub fn day_of_week(&self, time: DateTime<Utc>) -> u32 {
        time.with_timezone(&self.offset).weekday().number_from_sunday()
    }
}

impl Default for DayClock {
    fn default() -> Self {
        Self::utc()
    }
}

/// One recorded green launch at a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalPhaseObservation {
    pub node_id: String,
    pub green_launch_time: DateTime<Utc>,
    pub day_of_week: u32,
    pub seconds_since_midnight: f64,
}

impl SignalPhaseObservation {
    pub fn new(node_id: impl Into<String>, green_launch_time: DateTime<Utc>, clock: &DayClock) -> Self {
        SignalPhaseObservation {
            node_id: node_id.into(),
            green_launch_time,
            day_of_week: clock.day_of_week(green_launch_time),
            seconds_since_midnight: clock.seconds_since_midnight(green_launch_time),
        }
    }
}

/// Learned cycle for one node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalCyclePattern {
    pub node_id: String,
    pub observations: VecDeque<SignalPhaseObservation>,
    /// Seconds
    pub cycle_length: Option<f64>,
    /// Seconds since midnight of a green onset, modulo the cycle
    pub cycle_offset: Option<f64>,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

impl SignalCyclePattern {
    pub fn new(node_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        SignalCyclePattern {
            node_id: node_id.into(),
            observations: VecDeque::new(),
            cycle_length: None,
            cycle_offset: None,
            confidence: 0.0,
            last_updated: created_at,
        }
    }

    /// Append an observation, evicting the oldest beyond `MAX_OBSERVATIONS`
    pub fn push_observation(&mut self, observation: SignalPhaseObservation) {
        self.observations.push_back(observation);
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
    }

    /// Re-estimate cycle length, offset and confidence from the history
    ///
    /// # Algorithm
    /// 1. Sort by launch time, take consecutive intervals in [15 s, 180 s]
    /// 2. Cycle length = median interval
    /// 3. Offset = mean of `seconds_since_midnight mod cycle` over the last 10
    /// 4. Consistency = 1 - mean circular deviation / 5 s, clamped to [0, 1]
    /// 5. Confidence = 0.7 * consistency + 0.3 * min(1, n / 100)
    pub fn recompute(&mut self, updated_at: DateTime<Utc>) {
        self.last_updated = updated_at;

        if self.observations.len() < MIN_OBSERVATIONS {
            self.clear_estimate();
            return;
        }

        let mut sorted: Vec<&SignalPhaseObservation> = self.observations.iter().collect();
        sorted.sort_by_key(|obs| obs.green_launch_time);

        let intervals: Vec<f64> = sorted
            .windows(2)
            .map(|pair| (pair[1].green_launch_time - pair[0].green_launch_time).num_milliseconds() as f64 / 1000.0)
            .filter(|interval| (MIN_CYCLE_SECS..=MAX_CYCLE_SECS).contains(interval))
            .collect();

        let Some(cycle_length) = median(&intervals) else {
            self.clear_estimate();
            return;
        };

        let recent = &sorted[sorted.len().saturating_sub(OFFSET_WINDOW)..];
        let offset = recent
            .iter()
            .map(|obs| obs.seconds_since_midnight.rem_euclid(cycle_length))
            .sum::<f64>()
            / recent.len() as f64;

        let avg_deviation = sorted
            .iter()
            .map(|obs| {
                let phase = (obs.seconds_since_midnight - offset).rem_euclid(cycle_length);
                phase.min(cycle_length - phase)
            })
            .sum::<f64>()
            / sorted.len() as f64;

        let consistency = (1.0 - avg_deviation / DEVIATION_TOLERANCE_SECS).clamp(0.0, 1.0);
        let history = (self.observations.len() as f64 / MAX_OBSERVATIONS as f64).min(1.0);

        self.cycle_length = Some(cycle_length);
        self.cycle_offset = Some(offset);
        self.confidence = (consistency * CONSISTENCY_WEIGHT + history * HISTORY_WEIGHT).clamp(0.0, 1.0);
    }

    /// Next cycle boundary strictly after `current_time`
    ///
    /// `None` unless the pattern has a cycle and confidence above 0.5.
    pub fn predict_next_green(&self, current_time: DateTime<Utc>, clock: &DayClock) -> Option<SignalPrediction> {
        let cycle_length = self.cycle_length?;
        let offset = self.cycle_offset?;
        if self.confidence <= MIN_PREDICTION_CONFIDENCE || cycle_length <= 0.0 {
            return None;
        }

        let midnight = clock.start_of_day(current_time);
        let since_midnight = clock.seconds_since_midnight(current_time);
        let cycles_passed = ((since_midnight - offset) / cycle_length).floor();
        let next_green_offset = offset + (cycles_passed + 1.0) * cycle_length;

        let mut next_green_time = midnight + seconds(next_green_offset);
        if next_green_time <= current_time {
            next_green_time += seconds(cycle_length);
        }

        Some(SignalPrediction {
            node_id: self.node_id.clone(),
            next_green_time,
            cycle_length,
            confidence: self.confidence,
        })
    }

    fn clear_estimate(&mut self) {
        self.cycle_length = None;
        self.cycle_offset = None;
        self.confidence = 0.0;
    }
}

fn seconds(secs: f64) -> Duration {
    Duration::milliseconds((secs * 1000.0).round() as i64)
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}
