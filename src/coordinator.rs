use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};

use crate::cycle_estimator::CycleEstimator;
use crate::node_directory::{NodeDirectory, NEAREST_SIGNAL_RADIUS_M};
use crate::types::{Coordinate, SignalPrediction, TelematicsEvent, TrafficNode};

const FLOW_CHANNEL_CAPACITY: usize = 64;

/// Higher-level driving flow derived from telematics events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowEvent {
    StoppedAtSignal {
        node: TrafficNode,
        timestamp: DateTime<Utc>,
    },
    StoppedInTraffic {
        location: Coordinate,
    },
    Waiting {
        location: Coordinate,
    },
    LaunchedFromSignal {
        node: TrafficNode,
        prediction: SignalPrediction,
        timestamp: DateTime<Utc>,
    },
    Launched {
        location: Coordinate,
        timestamp: DateTime<Utc>,
    },
    Moving {
        speed_kph: f64,
    },
}

#[derive(Default)]
struct CoordinatorState {
    current_stop_node: Option<TrafficNode>,
    stop_timestamp: Option<DateTime<Utc>>,
    last_event: Option<FlowEvent>,
    last_prediction: Option<SignalPrediction>,
    predictions: HashMap<String, SignalPrediction>,
}

impl CoordinatorState {
    fn clear_stop(&mut self) {
        self.current_stop_node = None;
        self.stop_timestamp = None;
    }
}

/// Joins stop/launch events with node lookups and cycle learning
///
/// Events are handled one at a time behind `event_order`, so a launch is
/// never processed against a half-resolved stop. The state lock is only
/// taken between awaits on the directory and estimator, so readers are not
/// blocked by a slow node lookup.
pub struct StopWaitLaunchCoordinator {
    directory: Arc<dyn NodeDirectory>,
    estimator: Arc<CycleEstimator>,
    event_order: Mutex<()>,
    state: Mutex<CoordinatorState>,
    flow_tx: broadcast::Sender<FlowEvent>,
}

impl StopWaitLaunchCoordinator {
    pub fn new(directory: Arc<dyn NodeDirectory>, estimator: Arc<CycleEstimator>) -> Self {
        let (flow_tx, _) = broadcast::channel(FLOW_CHANNEL_CAPACITY);
        Self {
            directory,
            estimator,
            event_order: Mutex::new(()),
            state: Mutex::new(CoordinatorState::default()),
            flow_tx,
        }
    }

    /// Flow events emitted after this call, in emission order
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.flow_tx.subscribe()
    }

    /// Handle one telematics event, returning the flow event it produced
    pub async fn handle_event(&self, event: TelematicsEvent) -> Option<FlowEvent> {
        let _ordered = self.event_order.lock().await;

        let flow = match event {
            TelematicsEvent::HardStop { location, timestamp } => {
                let lookup = self.directory.find_nearest(location, NEAREST_SIGNAL_RADIUS_M).await;
                let mut state = self.state.lock().await;
                match lookup {
                    Ok(Some(node)) => {
                        log::debug!("Stopped at signal {} ({})", node.id, timestamp);
                        state.current_stop_node = Some(node.clone());
                        state.stop_timestamp = Some(timestamp);
                        Some(FlowEvent::StoppedAtSignal { node, timestamp })
                    }
                    Ok(None) => {
                        state.clear_stop();
                        Some(FlowEvent::StoppedInTraffic { location })
                    }
                    Err(e) => {
                        log::warn!("Signal lookup failed, stop treated as unknown: {}", e);
                        state.clear_stop();
                        None
                    }
                }
            }
            TelematicsEvent::GreenLightLaunch { location, timestamp } => {
                let stop_node = {
                    let mut state = self.state.lock().await;
                    state.stop_timestamp = None;
                    state.current_stop_node.take()
                };

                match stop_node.filter(|node| launched_from(node, &location)) {
                    Some(node) => self.learn_launch(node, location, timestamp).await,
                    None => Some(FlowEvent::Launched { location, timestamp }),
                }
            }
            TelematicsEvent::Stopped { location } => Some(FlowEvent::Waiting { location }),
            TelematicsEvent::Moving { speed_kph } => {
                // The tracker reports a launch before the moving status, so
                // reaching here with a stop still set means it was left without one
                let mut state = self.state.lock().await;
                if let Some(node) = &state.current_stop_node {
                    log::debug!("Left signal {} without a launch", node.id);
                }
                state.clear_stop();
                Some(FlowEvent::Moving { speed_kph })
            }
        };

        if let Some(flow) = &flow {
            self.state.lock().await.last_event = Some(flow.clone());
            // No subscribers is fine
            let _ = self.flow_tx.send(flow.clone());
        }
        flow
    }

    async fn learn_launch(
        &self,
        node: TrafficNode,
        location: Coordinate,
        timestamp: DateTime<Utc>,
    ) -> Option<FlowEvent> {
        self.estimator.record_green_launch(&node.id, timestamp).await;

        match self.estimator.predict_next_green(&node.id, timestamp).await {
            Some(prediction) => {
                let mut state = self.state.lock().await;
                state.last_prediction = Some(prediction.clone());
                state.predictions.insert(node.id.clone(), prediction.clone());
                Some(FlowEvent::LaunchedFromSignal {
                    node,
                    prediction,
                    timestamp,
                })
            }
            None => Some(FlowEvent::Launched { location, timestamp }),
        }
    }

    /// Consume telematics events until the channel closes
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TelematicsEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn last_event(&self) -> Option<FlowEvent> {
        self.state.lock().await.last_event.clone()
    }

    pub async fn last_prediction(&self) -> Option<SignalPrediction> {
        self.state.lock().await.last_prediction.clone()
    }

    /// Latest prediction issued for `node_id`
    pub async fn prediction_for(&self, node_id: &str) -> Option<SignalPrediction> {
        self.state.lock().await.predictions.get(node_id).cloned()
    }

    pub async fn current_stop(&self) -> Option<(TrafficNode, DateTime<Utc>)> {
        let state = self.state.lock().await;
        state.current_stop_node.clone().zip(state.stop_timestamp)
    }
}

/// A launch only counts for the stop node it happens next to
fn launched_from(node: &TrafficNode, location: &Coordinate) -> bool {
    let distance = node.coordinate.distance_to(location);
    if distance > NEAREST_SIGNAL_RADIUS_M {
        log::debug!("Launch {:.0} m from signal {}, not attributed", distance, node.id);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle_estimator::MemoryPatternStore;
    use crate::error::NodeLookupError;
    use crate::types::VehicleSample;
    use crate::vehicle_tracker::VehicleStateTracker;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    struct StalledDirectory;

    #[async_trait]
    impl NodeDirectory for StalledDirectory {
        async fn find_nearest(
            &self,
            _coordinate: Coordinate,
            _max_distance_m: f64,
        ) -> Result<Option<TrafficNode>, NodeLookupError> {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            Ok(None)
        }
    }

    struct FixedDirectory {
        node: Option<TrafficNode>,
        fail: bool,
    }

    #[async_trait]
    impl NodeDirectory for FixedDirectory {
        async fn find_nearest(
            &self,
            _coordinate: Coordinate,
            _max_distance_m: f64,
        ) -> Result<Option<TrafficNode>, NodeLookupError> {
            if self.fail {
                return Err(NodeLookupError::Timeout);
            }
            Ok(self.node.clone())
        }
    }

    fn here() -> Coordinate {
        Coordinate::new(37.7749, -122.4194)
    }

    fn signal() -> TrafficNode {
        TrafficNode::new("osm-42", here(), 42)
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap()
    }

    fn coordinator(node: Option<TrafficNode>, fail: bool) -> StopWaitLaunchCoordinator {
        StopWaitLaunchCoordinator::new(
            Arc::new(FixedDirectory { node, fail }),
            Arc::new(CycleEstimator::new(Arc::new(MemoryPatternStore::new()))),
        )
    }

    async fn stop_and_launch(coordinator: &StopWaitLaunchCoordinator, launch_at: DateTime<Utc>) -> Option<FlowEvent> {
        coordinator
            .handle_event(TelematicsEvent::HardStop {
                location: here(),
                timestamp: launch_at - Duration::seconds(20),
            })
            .await;
        coordinator
            .handle_event(TelematicsEvent::GreenLightLaunch {
                location: here(),
                timestamp: launch_at,
            })
            .await
    }

    #[tokio::test]
    async fn test_stop_at_signal() {
        let coordinator = coordinator(Some(signal()), false);
        let flow = coordinator
            .handle_event(TelematicsEvent::HardStop {
                location: here(),
                timestamp: base(),
            })
            .await;

        assert_eq!(
            flow,
            Some(FlowEvent::StoppedAtSignal {
                node: signal(),
                timestamp: base()
            })
        );
        assert_eq!(coordinator.current_stop().await, Some((signal(), base())));
    }

    #[tokio::test]
    async fn test_stop_in_traffic() {
        let coordinator = coordinator(None, false);
        let flow = coordinator
            .handle_event(TelematicsEvent::HardStop {
                location: here(),
                timestamp: base(),
            })
            .await;
        assert_eq!(flow, Some(FlowEvent::StoppedInTraffic { location: here() }));
        assert!(coordinator.current_stop().await.is_none());
    }

    #[tokio::test]
    async fn test_lookup_failure_emits_nothing() {
        let coordinator = coordinator(Some(signal()), true);
        let mut rx = coordinator.subscribe();

        let flow = coordinator
            .handle_event(TelematicsEvent::HardStop {
                location: here(),
                timestamp: base(),
            })
            .await;
        assert!(flow.is_none());
        assert!(rx.try_recv().is_err());

        // Unknown stop means a launch is a plain launch
        let flow = coordinator
            .handle_event(TelematicsEvent::GreenLightLaunch {
                location: here(),
                timestamp: base(),
            })
            .await;
        assert!(matches!(flow, Some(FlowEvent::Launched { .. })));
    }

    #[tokio::test]
    async fn test_launches_learn_cycle() {
        let coordinator = coordinator(Some(signal()), false);

        for i in 0..4 {
            let flow = stop_and_launch(&coordinator, base() + Duration::seconds(i * 60)).await;
            if i < 2 {
                assert!(matches!(flow, Some(FlowEvent::Launched { .. })));
            }
        }

        let flow = stop_and_launch(&coordinator, base() + Duration::seconds(240)).await;
        match flow {
            Some(FlowEvent::LaunchedFromSignal { node, prediction, timestamp }) => {
                assert_eq!(node.id, "osm-42");
                assert_eq!(timestamp, base() + Duration::seconds(240));
                assert_eq!(prediction.next_green_time, base() + Duration::seconds(300));
            }
            other => panic!("expected launch from signal, got {:?}", other),
        }

        assert!(coordinator.prediction_for("osm-42").await.is_some());
        assert_eq!(
            coordinator.last_prediction().await.map(|p| p.next_green_time),
            Some(base() + Duration::seconds(300))
        );
        assert!(coordinator.current_stop().await.is_none());
    }

    #[tokio::test]
    async fn test_status_passthrough() {
        let coordinator = coordinator(None, false);
        assert_eq!(
            coordinator
                .handle_event(TelematicsEvent::Stopped { location: here() })
                .await,
            Some(FlowEvent::Waiting { location: here() })
        );
        assert_eq!(
            coordinator
                .handle_event(TelematicsEvent::Moving { speed_kph: 32.0 })
                .await,
            Some(FlowEvent::Moving { speed_kph: 32.0 })
        );
        assert_eq!(coordinator.last_event().await, Some(FlowEvent::Moving { speed_kph: 32.0 }));
    }

    #[tokio::test]
    async fn test_run_publishes_in_order() {
        let coordinator = Arc::new(coordinator(Some(signal()), false));
        let mut rx = coordinator.subscribe();
        let (tx, events) = mpsc::channel(8);
        let handle = tokio::spawn(Arc::clone(&coordinator).run(events));

        tx.send(TelematicsEvent::Moving { speed_kph: 20.0 }).await.unwrap();
        tx.send(TelematicsEvent::HardStop {
            location: here(),
            timestamp: base(),
        })
        .await
        .unwrap();
        tx.send(TelematicsEvent::Stopped { location: here() }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), FlowEvent::Moving { .. }));
        assert!(matches!(rx.recv().await.unwrap(), FlowEvent::StoppedAtSignal { .. }));
        assert!(matches!(rx.recv().await.unwrap(), FlowEvent::Waiting { .. }));
    }

    fn at(secs: f64) -> DateTime<Utc> {
        base() + Duration::milliseconds((secs * 1000.0) as i64)
    }

    #[tokio::test]
    async fn test_departure_without_launch_drops_stop() {
        let estimator = Arc::new(CycleEstimator::new(Arc::new(MemoryPatternStore::new())));
        let coordinator = StopWaitLaunchCoordinator::new(
            Arc::new(FixedDirectory {
                node: Some(signal()),
                fail: false,
            }),
            Arc::clone(&estimator),
        );
        // ~2.2 km north of the signal
        let elsewhere = Coordinate::new(37.7949, -122.4194);

        let mut samples = vec![VehicleSample::new(here(), 30.0, 1.0, at(0.0))];
        for t in 1..=4 {
            samples.push(VehicleSample::new(here(), 0.2, 1.0, at(t as f64)));
        }
        // Gentle departure, below launch acceleration
        for (t, speed) in [(5.0, 8.0), (6.0, 15.0), (10.0, 30.0)] {
            samples.push(VehicleSample::new(here(), speed, 1.05, at(t)));
        }
        // Brief stop far away, then a hard launch before it is confirmed
        samples.push(VehicleSample::new(elsewhere, 0.5, 1.0, at(101.0)));
        samples.push(VehicleSample::new(elsewhere, 8.0, 1.3, at(102.0)));

        let mut tracker = VehicleStateTracker::new();
        let mut flows = Vec::new();
        for sample in &samples {
            for event in tracker.process(sample) {
                flows.extend(coordinator.handle_event(event).await);
            }
        }

        assert!(flows.iter().any(|f| matches!(f, FlowEvent::StoppedAtSignal { .. })));
        assert!(flows.contains(&FlowEvent::Launched {
            location: elsewhere,
            timestamp: at(102.0)
        }));
        assert!(estimator.pattern("osm-42").await.is_none());
        assert!(coordinator.current_stop().await.is_none());
    }

    #[tokio::test]
    async fn test_distant_launch_not_attributed() {
        let estimator = Arc::new(CycleEstimator::new(Arc::new(MemoryPatternStore::new())));
        let coordinator = StopWaitLaunchCoordinator::new(
            Arc::new(FixedDirectory {
                node: Some(signal()),
                fail: false,
            }),
            Arc::clone(&estimator),
        );
        coordinator
            .handle_event(TelematicsEvent::HardStop {
                location: here(),
                timestamp: base(),
            })
            .await;

        // ~110 m away
        let away = Coordinate::new(37.7759, -122.4194);
        let flow = coordinator
            .handle_event(TelematicsEvent::GreenLightLaunch {
                location: away,
                timestamp: base() + Duration::seconds(30),
            })
            .await;

        assert!(matches!(flow, Some(FlowEvent::Launched { .. })));
        assert!(estimator.pattern("osm-42").await.is_none());
    }

    #[tokio::test]
    async fn test_readers_not_blocked_by_lookup() {
        let coordinator = Arc::new(StopWaitLaunchCoordinator::new(
            Arc::new(StalledDirectory),
            Arc::new(CycleEstimator::new(Arc::new(MemoryPatternStore::new()))),
        ));
        coordinator
            .handle_event(TelematicsEvent::Moving { speed_kph: 12.0 })
            .await;

        let pending = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move {
                coordinator
                    .handle_event(TelematicsEvent::HardStop {
                        location: here(),
                        timestamp: base(),
                    })
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let last = tokio::time::timeout(std::time::Duration::from_millis(200), coordinator.last_event())
            .await
            .expect("reader blocked by node lookup");
        assert_eq!(last, Some(FlowEvent::Moving { speed_kph: 12.0 }));
        assert!(!pending.is_finished());
        pending.abort();
    }
}
