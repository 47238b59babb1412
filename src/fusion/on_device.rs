use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::CyclePhaseSimulator;
use crate::cycle_estimator::CycleEstimator;
use crate::node_directory::{NodeDirectory, NEAREST_SIGNAL_RADIUS_M};
use crate::types::{Coordinate, SignalPhase, SignalPrediction, TrafficNode, TrafficSignal};

pub const LEARNED_SOURCE: &str = "telematics-v2x";
/// Share of the cycle assumed green when a predicted green has already started
const GREEN_PHASE_FRACTION: f64 = 0.3;
/// Time-to-green at or below which the signal is shown as yellow (seconds)
const YELLOW_WINDOW_SECS: f64 = 5.0;

/// Anything that can produce an on-device signal estimate for a coordinate
#[async_trait]
pub trait SignalObservationSource: Send + Sync {
    async fn predict_signal(&self, coordinate: Coordinate, now: DateTime<Utc>) -> Option<TrafficSignal>;
}

/// Signal built from a cycle learned at the nearest known node
pub struct LearnedCycleSource {
    directory: Arc<dyn NodeDirectory>,
    estimator: Arc<CycleEstimator>,
}

impl LearnedCycleSource {
    pub fn new(directory: Arc<dyn NodeDirectory>, estimator: Arc<CycleEstimator>) -> Self {
        Self { directory, estimator }
    }
}

#[async_trait]
impl SignalObservationSource for LearnedCycleSource {
    async fn predict_signal(&self, coordinate: Coordinate, now: DateTime<Utc>) -> Option<TrafficSignal> {
        let node = match self.directory.find_nearest(coordinate, NEAREST_SIGNAL_RADIUS_M).await {
            Ok(Some(node)) => node,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("No learned signal, node lookup failed: {}", e);
                return None;
            }
        };

        let prediction = self.estimator.predict_next_green(&node.id, now).await?;
        Some(build_signal(&prediction, &node, coordinate, now))
    }
}

/// Map a next-green prediction onto a displayable phase
pub fn build_signal(
    prediction: &SignalPrediction,
    node: &TrafficNode,
    coordinate: Coordinate,
    now: DateTime<Utc>,
) -> TrafficSignal {
    let time_to_green = (prediction.next_green_time - now).num_milliseconds() as f64 / 1000.0;

    let (phase, phase_ends_at) = if time_to_green <= 0.0 {
        let green_secs = prediction.cycle_length * GREEN_PHASE_FRACTION;
        (
            SignalPhase::Green,
            now + Duration::milliseconds((green_secs * 1000.0).round() as i64),
        )
    } else if time_to_green <= YELLOW_WINDOW_SECS {
        (SignalPhase::Yellow, prediction.next_green_time)
    } else {
        (SignalPhase::Red, prediction.next_green_time)
    };

    TrafficSignal {
        id: TrafficSignal::signal_id(&node.id, now),
        intersection_id: node.id.clone(),
        intersection_name: format!("OSM Node {}", node.osm_id),
        coordinate,
        phase,
        next_green_at: Some(prediction.next_green_time),
        phase_ends_at: Some(phase_ends_at),
        confidence: prediction.confidence,
        source: LEARNED_SOURCE.to_string(),
        server_timestamp: now,
    }
}

/// Learned cycle first, fallback simulator otherwise
pub struct OnDeviceEngine {
    learned: Option<Arc<dyn SignalObservationSource>>,
    simulator: Arc<CyclePhaseSimulator>,
}

impl OnDeviceEngine {
    pub fn new(learned: Option<Arc<dyn SignalObservationSource>>, simulator: Arc<CyclePhaseSimulator>) -> Self {
        Self { learned, simulator }
    }

    /// Engine without node lookups, simulator only
    pub fn simulator_only(simulator: Arc<CyclePhaseSimulator>) -> Self {
        Self::new(None, simulator)
    }
}

#[async_trait]
impl SignalObservationSource for OnDeviceEngine {
    async fn predict_signal(&self, coordinate: Coordinate, now: DateTime<Utc>) -> Option<TrafficSignal> {
        if let Some(learned) = &self.learned {
            if let Some(signal) = learned.predict_signal(coordinate, now).await {
                return Some(signal);
            }
        }
        Some(self.simulator.predict_at(coordinate, now).await)
    }
}
