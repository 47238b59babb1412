//! On-device, fallback and remote signal predictions, and their fusion

pub mod on_device;
pub mod remote_client;
pub mod service;
pub mod simulator;

pub use on_device::{build_signal, LearnedCycleSource, OnDeviceEngine, SignalObservationSource, LEARNED_SOURCE};
pub use remote_client::{RemoteSignalSource, TrafficSignalApiClient, TrafficSignalDto, DEFAULT_REMOTE_TIMEOUT};
pub use service::{PredictionFusionService, PredictionMode};
pub use simulator::{
    simulator_confidence, CyclePhaseSimulator, IntersectionCycleProfile, MemoryProfileStore, ProfileStore,
    SIMULATOR_SOURCE,
};
