use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::coordinator::FlowEvent;
use crate::types::SignalPrediction;

/// Pipeline counters written as a JSON snapshot for external monitoring
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PipelineStatus {
    pub timestamp: f64,
    pub uptime_seconds: u64,
    pub samples_processed: u64,
    pub hard_stops: u64,
    pub signal_stops: u64,
    pub launches: u64,
    pub predictions_issued: u64,
    pub learned_nodes: usize,
    pub last_prediction: Option<SignalPrediction>,
}

impl PipelineStatus {
    pub fn new() -> Self {
        Self {
            timestamp: current_timestamp(),
            ..Self::default()
        }
    }

    pub fn record_samples(&mut self, count: u64) {
        self.samples_processed += count;
    }

    /// Waiting and moving updates do not change any counter
    pub fn record_flow(&mut self, event: &FlowEvent) {
        match event {
            FlowEvent::StoppedAtSignal { .. } => {
                self.hard_stops += 1;
                self.signal_stops += 1;
            }
            FlowEvent::StoppedInTraffic { .. } => self.hard_stops += 1,
            FlowEvent::LaunchedFromSignal { prediction, .. } => {
                self.launches += 1;
                self.predictions_issued += 1;
                self.last_prediction = Some(prediction.clone());
            }
            FlowEvent::Launched { .. } => self.launches += 1,
            FlowEvent::Waiting { .. } | FlowEvent::Moving { .. } => {}
        }
    }

    pub fn save(&mut self, path: &Path, started_at: f64) -> std::io::Result<()> {
        self.timestamp = current_timestamp();
        self.uptime_seconds = (self.timestamp - started_at).max(0.0) as u64;
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
