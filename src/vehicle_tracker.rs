use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::{Coordinate, TelematicsEvent, VehicleSample, MOVING_SPEED_KPH, STATIONARY_SPEED_KPH};

/// Below this speed the vehicle may be stopping (km/h)
pub const HARD_STOP_SPEED_KPH: f64 = STATIONARY_SPEED_KPH;
/// Minimum speed for a launch (km/h)
pub const LAUNCH_SPEED_KPH: f64 = MOVING_SPEED_KPH;
/// Minimum acceleration magnitude for a launch: 1 g at rest plus a 0.15 g margin
pub const LAUNCH_ACCELERATION_G: f64 = 1.0 + 0.15;
/// A stop must last this long before it counts as a hard stop (seconds)
pub const MIN_STOP_DURATION_SECS: f64 = 2.0;

#[derive(Clone, Debug, PartialEq)]
pub enum TrackerState {
    Moving,
    StoppedPending {
        since: DateTime<Utc>,
        location: Coordinate,
    },
    StoppedConfirmed,
}

/// Stop/launch detector over fused vehicle samples
///
/// # State Machine
/// ```text
/// Moving --speed < 1--> StoppedPending --held 2 s--> StoppedConfirmed
///    ^                       |                            |
///    +------- launch (>= 5 km/h and >= 1.15 g) -----------+
/// ```
/// Time comes from sample timestamps, so replayed logs behave like live data.
pub struct VehicleStateTracker {
    state: TrackerState,
    last_timestamp: Option<DateTime<Utc>>,
}

impl VehicleStateTracker {
    pub fn new() -> Self {
        Self {
            state: TrackerState::StoppedConfirmed,
            last_timestamp: None,
        }
    }

    pub fn state(&self) -> &TrackerState {
        &self.state
    }

    /// Feed one sample, returning the transition event (if any) followed by
    /// the coarse status event (if any)
    pub fn process(&mut self, sample: &VehicleSample) -> Vec<TelematicsEvent> {
        if !sample.is_well_formed() {
            log::trace!("Dropping malformed sample at {}", sample.timestamp);
            return Vec::new();
        }
        if let Some(last) = self.last_timestamp {
            if sample.timestamp < last {
                log::trace!("Dropping out-of-order sample at {}", sample.timestamp);
                return Vec::new();
            }
        }
        self.last_timestamp = Some(sample.timestamp);

        let mut events = Vec::with_capacity(2);
        if let Some(event) = self.transition(sample) {
            events.push(event);
        }

        if sample.is_stationary() {
            events.push(TelematicsEvent::Stopped {
                location: sample.location,
            });
        } else if sample.is_moving() {
            events.push(TelematicsEvent::Moving {
                speed_kph: sample.speed_kph,
            });
        }

        events
    }

    fn transition(&mut self, sample: &VehicleSample) -> Option<TelematicsEvent> {
        match self.state.clone() {
            TrackerState::Moving => {
                if sample.speed_kph < HARD_STOP_SPEED_KPH {
                    log::debug!("Stop detected at {}", sample.timestamp);
                    self.state = TrackerState::StoppedPending {
                        since: sample.timestamp,
                        location: sample.location,
                    };
                }
                None
            }
            TrackerState::StoppedPending { since, location } => {
                if is_launch(sample) {
                    return Some(self.launch(sample));
                }

                if sample.speed_kph < HARD_STOP_SPEED_KPH {
                    let held_secs = (sample.timestamp - since).num_milliseconds() as f64 / 1000.0;
                    if held_secs >= MIN_STOP_DURATION_SECS {
                        log::debug!("Hard stop confirmed after {:.1} s", held_secs);
                        self.state = TrackerState::StoppedConfirmed;
                        return Some(TelematicsEvent::HardStop {
                            location,
                            timestamp: sample.timestamp,
                        });
                    }
                } else if sample.is_moving() {
                    log::debug!("Stop abandoned without launch at {}", sample.timestamp);
                    self.state = TrackerState::Moving;
                }
                None
            }
            TrackerState::StoppedConfirmed => {
                if is_launch(sample) {
                    return Some(self.launch(sample));
                }
                if sample.is_moving() {
                    self.state = TrackerState::Moving;
                }
                None
            }
        }
    }

    fn launch(&mut self, sample: &VehicleSample) -> TelematicsEvent {
        log::debug!(
            "Launch at {} ({:.1} km/h, {:.2} g)",
            sample.timestamp,
            sample.speed_kph,
            sample.acceleration_g
        );
        self.state = TrackerState::Moving;
        TelematicsEvent::GreenLightLaunch {
            location: sample.location,
            timestamp: sample.timestamp,
        }
    }
}

impl Default for VehicleStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_launch(sample: &VehicleSample) -> bool {
    sample.speed_kph >= LAUNCH_SPEED_KPH && sample.acceleration_g >= LAUNCH_ACCELERATION_G
}

/// Run a tracker over a sample channel until either side closes
pub async fn tracker_loop(mut samples: mpsc::Receiver<VehicleSample>, events: mpsc::Sender<TelematicsEvent>) {
    let mut tracker = VehicleStateTracker::new();
    while let Some(sample) = samples.recv().await {
        for event in tracker.process(&sample) {
            if events.send(event).await.is_err() {
                log::debug!("Telematics event receiver dropped, stopping tracker");
                return;
            }
        }
    }
}
