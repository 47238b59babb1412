use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

use super::{DayClock, PatternStore, SignalCyclePattern, SignalPhaseObservation};
use crate::types::SignalPrediction;

/// Online per-node cycle estimator
///
/// # Concurrency
/// - Patterns are loaded from the store once, on first use
/// - One mutex guards the pattern map; append, recompute and persist happen
///   under it, so calls for a node apply in arrival order and readers only
///   see committed patterns
///
/// # Persistence
/// Store failures are logged and swallowed; the in-memory map stays
/// authoritative for the process lifetime.
pub struct CycleEstimator {
    store: Arc<dyn PatternStore>,
    clock: DayClock,
    patterns: OnceCell<Mutex<HashMap<String, SignalCyclePattern>>>,
}

impl CycleEstimator {
    pub fn new(store: Arc<dyn PatternStore>) -> Self {
        Self::with_clock(store, DayClock::utc())
    }

    pub fn with_clock(store: Arc<dyn PatternStore>, clock: DayClock) -> Self {
        CycleEstimator {
            store,
            clock,
            patterns: OnceCell::new(),
        }
    }

    async fn patterns(&self) -> &Mutex<HashMap<String, SignalCyclePattern>> {
        self.patterns
            .get_or_init(|| async {
                let loaded = match self.store.load_all().await {
                    Ok(patterns) => patterns,
                    Err(e) => {
                        log::warn!("Failed to load signal patterns, starting empty: {}", e);
                        HashMap::new()
                    }
                };
                log::debug!("Loaded {} signal cycle patterns", loaded.len());
                Mutex::new(loaded)
            })
            .await
    }

    /// Record a green launch at `node_id` and re-estimate its cycle
    pub async fn record_green_launch(&self, node_id: &str, timestamp: DateTime<Utc>) {
        let mut patterns = self.patterns().await.lock().await;

        let pattern = patterns
            .entry(node_id.to_string())
            .or_insert_with(|| SignalCyclePattern::new(node_id, timestamp));
        pattern.push_observation(SignalPhaseObservation::new(node_id, timestamp, &self.clock));
        pattern.recompute(timestamp);

        log::debug!(
            "Node {}: {} observations, cycle {:?} s, confidence {:.2}",
            node_id,
            pattern.observations.len(),
            pattern.cycle_length,
            pattern.confidence
        );

        if let Err(e) = self.store.save(pattern).await {
            log::warn!("Failed to persist pattern for {}: {}", node_id, e);
        }
    }

    /// Next green at `node_id` after `current_time`, if the pattern is trusted
    pub async fn predict_next_green(&self, node_id: &str, current_time: DateTime<Utc>) -> Option<SignalPrediction> {
        let patterns = self.patterns().await.lock().await;
        patterns
            .get(node_id)?
            .predict_next_green(current_time, &self.clock)
    }

    /// Snapshot of the committed pattern for `node_id`
    pub async fn pattern(&self, node_id: &str) -> Option<SignalCyclePattern> {
        self.patterns().await.lock().await.get(node_id).cloned()
    }

    pub async fn node_count(&self) -> usize {
        self.patterns().await.lock().await.len()
    }
}
