//! Signal cycle learning from green-launch timestamps

pub mod estimator;
pub mod pattern;
pub mod store;

pub use estimator::CycleEstimator;
pub use pattern::{
    DayClock, SignalCyclePattern, SignalPhaseObservation, MAX_CYCLE_SECS, MAX_OBSERVATIONS, MIN_CYCLE_SECS,
    MIN_OBSERVATIONS, MIN_PREDICTION_CONFIDENCE,
};
pub use store::{FilePatternStore, MemoryPatternStore, PatternStore, PATTERN_FILE_PREFIX};
