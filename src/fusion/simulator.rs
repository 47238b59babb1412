use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::geo_key;
use crate::types::{Coordinate, SignalPhase, TrafficSignal};

pub const SIMULATOR_SOURCE: &str = "on-device-cycle-learning";
const SIMULATOR_NAME: &str = "Local Intersection";

const MAX_SMOOTHING: f64 = 0.15;
const SAMPLES_FOR_FULL_QUALITY: f64 = 120.0;

/// Smoothed phase durations for one intersection (seconds)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntersectionCycleProfile {
    pub intersection_id: String,
    pub red_duration: f64,
    pub yellow_duration: f64,
    pub green_duration: f64,
    pub sample_count: u32,
    pub last_updated_at: DateTime<Utc>,
}

impl IntersectionCycleProfile {
    /// 28 s red, 4 s yellow, 28 s green
    pub fn default_profile(intersection_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        IntersectionCycleProfile {
            intersection_id: intersection_id.into(),
            red_duration: 28.0,
            yellow_duration: 4.0,
            green_duration: 28.0,
            sample_count: 1,
            last_updated_at: now,
        }
    }

    pub fn cycle_duration(&self) -> f64 {
        self.red_duration + self.yellow_duration + self.green_duration
    }

    pub fn duration_of(&self, phase: SignalPhase) -> Option<f64> {
        match phase {
            SignalPhase::Red => Some(self.red_duration),
            SignalPhase::Yellow => Some(self.yellow_duration),
            SignalPhase::Green => Some(self.green_duration),
            SignalPhase::Unknown => None,
        }
    }

    /// Fold one elapsed-in-phase sample into `phase`'s duration
    pub fn observe(&mut self, phase: SignalPhase, elapsed_secs: f64, now: DateTime<Utc>) {
        let smoothing = MAX_SMOOTHING.min(1.0 / f64::from(self.sample_count.max(1)));
        let slot = match phase {
            SignalPhase::Red => Some(&mut self.red_duration),
            SignalPhase::Yellow => Some(&mut self.yellow_duration),
            SignalPhase::Green => Some(&mut self.green_duration),
            SignalPhase::Unknown => None,
        };
        if let Some(duration) = slot {
            *duration = (1.0 - smoothing) * *duration + smoothing * elapsed_secs;
        }
        self.sample_count = self.sample_count.saturating_add(1);
        self.last_updated_at = now;
    }
}

/// Keyed storage for simulator profiles
pub trait ProfileStore: Send + Sync {
    fn profile(&self, intersection_id: &str) -> Option<IntersectionCycleProfile>;

    fn upsert(&self, profile: IntersectionCycleProfile);
}

#[derive(Default)]
pub struct MemoryProfileStore {
    profiles: std::sync::Mutex<HashMap<String, IntersectionCycleProfile>>,
}

impl MemoryProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileStore for MemoryProfileStore {
    fn profile(&self, intersection_id: &str) -> Option<IntersectionCycleProfile> {
        self.profiles
            .lock()
            .ok()
            .and_then(|profiles| profiles.get(intersection_id).cloned())
    }

    fn upsert(&self, profile: IntersectionCycleProfile) {
        if let Ok(mut profiles) = self.profiles.lock() {
            profiles.insert(profile.intersection_id.clone(), profile);
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct PhaseClock {
    phase: SignalPhase,
    started_at: DateTime<Utc>,
}

/// Deterministic red/green/yellow cycle used when nothing has been learned
///
/// Each intersection key (coordinate rounded to 4 decimals) runs its own
/// phase clock, starting in red at the first query.
pub struct CyclePhaseSimulator {
    store: Arc<dyn ProfileStore>,
    clocks: Mutex<HashMap<String, PhaseClock>>,
}

impl CyclePhaseSimulator {
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        CyclePhaseSimulator {
            store,
            clocks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn predict(&self, coordinate: Coordinate) -> TrafficSignal {
        self.predict_at(coordinate, Utc::now()).await
    }

    /// Advance the intersection's phase to `now`, update its profile and build a signal
    pub async fn predict_at(&self, coordinate: Coordinate, now: DateTime<Utc>) -> TrafficSignal {
        let key = geo_key::intersection_key(&coordinate);
        let mut clocks = self.clocks.lock().await;

        let mut profile = self
            .store
            .profile(&key)
            .unwrap_or_else(|| IntersectionCycleProfile::default_profile(key.clone(), now));

        let clock = clocks.entry(key.clone()).or_insert(PhaseClock {
            phase: SignalPhase::Red,
            started_at: now,
        });

        let elapsed = seconds_between(clock.started_at, now);
        if let Some(duration) = profile.duration_of(clock.phase) {
            if elapsed >= duration {
                clock.phase = next_phase(clock.phase);
                clock.started_at = now;
            }
        }

        let elapsed_in_phase = seconds_between(clock.started_at, now);
        profile.observe(clock.phase, elapsed_in_phase.max(1.0), now);
        self.store.upsert(profile.clone());

        build_signal(&profile, *clock, coordinate, now)
    }
}

fn next_phase(phase: SignalPhase) -> SignalPhase {
    match phase {
        SignalPhase::Red => SignalPhase::Green,
        SignalPhase::Green => SignalPhase::Yellow,
        SignalPhase::Yellow => SignalPhase::Red,
        SignalPhase::Unknown => SignalPhase::Red,
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

fn after(at: DateTime<Utc>, secs: f64) -> DateTime<Utc> {
    at + Duration::milliseconds((secs * 1000.0).round() as i64)
}

/// `0.60 + 0.33 * min(1, samples / 120) - min(0.10, elapsed / 500)`, clamped to [0.60, 0.93]
pub fn simulator_confidence(sample_count: u32, elapsed_in_phase_secs: f64) -> f64 {
    let quality = (f64::from(sample_count) / SAMPLES_FOR_FULL_QUALITY).min(1.0);
    let staleness = (elapsed_in_phase_secs / 500.0).min(0.10);
    (0.60 + 0.33 * quality - staleness).clamp(0.60, 0.93)
}

fn build_signal(
    profile: &IntersectionCycleProfile,
    clock: PhaseClock,
    coordinate: Coordinate,
    now: DateTime<Utc>,
) -> TrafficSignal {
    let (phase_ends_at, next_green_at) = match clock.phase {
        SignalPhase::Green => (after(clock.started_at, profile.green_duration), now),
        SignalPhase::Yellow => {
            let ends = after(clock.started_at, profile.yellow_duration);
            (ends, after(ends, profile.red_duration))
        }
        SignalPhase::Red => {
            let ends = after(clock.started_at, profile.red_duration);
            (ends, ends)
        }
        SignalPhase::Unknown => (after(now, 1.0), after(now, profile.red_duration)),
    };

    TrafficSignal {
        id: TrafficSignal::signal_id(&profile.intersection_id, now),
        intersection_id: profile.intersection_id.clone(),
        intersection_name: SIMULATOR_NAME.to_string(),
        coordinate,
        phase: clock.phase,
        next_green_at: Some(next_green_at),
        phase_ends_at: Some(phase_ends_at),
        confidence: simulator_confidence(profile.sample_count, seconds_between(clock.started_at, now)),
        source: SIMULATOR_SOURCE.to_string(),
        server_timestamp: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn here() -> Coordinate {
        Coordinate::new(37.77491, -122.41942)
    }

    fn simulator() -> (CyclePhaseSimulator, Arc<MemoryProfileStore>) {
        let store = Arc::new(MemoryProfileStore::new());
        (CyclePhaseSimulator::new(store.clone()), store)
    }

    #[test]
    fn test_default_profile() {
        let profile = IntersectionCycleProfile::default_profile("x", t(0));
        assert_relative_eq!(profile.cycle_duration(), 60.0);
        assert_eq!(profile.sample_count, 1);
    }

    #[test]
    fn test_smoothing() {
        let mut profile = IntersectionCycleProfile::default_profile("x", t(0));
        // First sample: smoothing = min(0.15, 1/1)
        profile.observe(SignalPhase::Red, 48.0, t(1));
        assert_relative_eq!(profile.red_duration, 0.85 * 28.0 + 0.15 * 48.0, epsilon = 1e-9);
        assert_eq!(profile.sample_count, 2);
        assert_relative_eq!(profile.green_duration, 28.0);

        profile.sample_count = 20;
        profile.observe(SignalPhase::Green, 8.0, t(2));
        // smoothing = 1/20
        assert_relative_eq!(profile.green_duration, 0.95 * 28.0 + 0.05 * 8.0, epsilon = 1e-9);
    }

    #[test]
    fn test_confidence_bounds() {
        assert_relative_eq!(simulator_confidence(1, 0.0), 0.60 + 0.33 / 120.0, epsilon = 1e-9);
        assert_relative_eq!(simulator_confidence(120, 0.0), 0.93, epsilon = 1e-9);
        assert_relative_eq!(simulator_confidence(500, 10.0), 0.91, epsilon = 1e-9);
        assert_relative_eq!(simulator_confidence(1, 400.0), 0.60, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_first_query_starts_red() {
        let (sim, store) = simulator();
        let signal = sim.predict_at(here(), t(0)).await;

        assert_eq!(signal.phase, SignalPhase::Red);
        assert_eq!(signal.intersection_id, "37.7749_-122.4194");
        assert_eq!(signal.source, SIMULATOR_SOURCE);
        assert_eq!(signal.next_green_at, signal.phase_ends_at);
        assert!(store.profile("37.7749_-122.4194").is_some());
        assert!((0.60..=0.93).contains(&signal.confidence));
    }

    #[tokio::test]
    async fn test_phase_advances_through_cycle() {
        let (sim, _store) = simulator();
        assert_eq!(sim.predict_at(here(), t(0)).await.phase, SignalPhase::Red);
        assert_eq!(sim.predict_at(here(), t(10)).await.phase, SignalPhase::Red);

        let green = sim.predict_at(here(), t(40)).await;
        assert_eq!(green.phase, SignalPhase::Green);
        assert_eq!(green.next_green_at, Some(t(40)));

        let yellow = sim.predict_at(here(), t(80)).await;
        assert_eq!(yellow.phase, SignalPhase::Yellow);
        assert!(yellow.next_green_at > yellow.phase_ends_at);

        assert_eq!(sim.predict_at(here(), t(90)).await.phase, SignalPhase::Red);
    }

    #[tokio::test]
    async fn test_intersections_run_independent_clocks() {
        let (sim, _store) = simulator();
        let other = Coordinate::new(40.7128, -74.0060);

        sim.predict_at(here(), t(0)).await;
        assert_eq!(sim.predict_at(here(), t(40)).await.phase, SignalPhase::Green);
        assert_eq!(sim.predict_at(other, t(40)).await.phase, SignalPhase::Red);
    }
}
