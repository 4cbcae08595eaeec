//! Anomaly detection engine for driftkit
//!
//! Preprocessing, weighted statistics, the four detectors (MAD, Z-Score,
//! IQR, Manual Bounds) with seasonality-group adaptive confidence
//! intervals, and the incremental detection runner.

pub mod detectors;
pub mod preprocess;
pub mod runner;
pub mod seasonality;
pub mod stats;

pub use detectors::{
    build_detectors, DetectionPoint, Detector, IqrParams, MadParams, ManualBoundsParams,
    ZScoreParams,
};
pub use preprocess::{InputType, Preprocessing};
pub use runner::{DetectOutcome, DetectionRunner};
pub use seasonality::ComponentSpec;
pub use stats::StatFamily;
