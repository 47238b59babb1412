//! Traffic-signal timing from vehicle telematics
//!
//! Samples flow through [`vehicle_tracker`] into stop/launch events, the
//! [`coordinator`] ties stops to nearby signal nodes from [`node_directory`]
//! and feeds launches into the [`cycle_estimator`]. [`fusion`] combines the
//! learned cycles, a local simulator and an optional backend into one
//! [`types::TrafficSignal`].

pub mod config;
pub mod coordinator;
pub mod cycle_estimator;
pub mod error;
pub mod fusion;
pub mod geo_key;
pub mod node_directory;
pub mod samples;
pub mod status;
pub mod types;
pub mod vehicle_tracker;

pub use config::AppConfig;
pub use coordinator::{FlowEvent, StopWaitLaunchCoordinator};
pub use cycle_estimator::CycleEstimator;
pub use fusion::{PredictionFusionService, PredictionMode};
pub use node_directory::SignalNodeDirectory;
pub use types::{Coordinate, SignalPhase, SignalPrediction, TelematicsEvent, TrafficNode, TrafficSignal, VehicleSample};
pub use vehicle_tracker::VehicleStateTracker;
