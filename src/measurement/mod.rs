//! Measurement orchestration: sweep functions, detector functions and the
//! `MeasurementControl` that drives them.

pub mod control;
pub mod detector;
pub mod progress;
pub mod sweep;

pub use control::{AbortHandle, MeasurementControl};
pub use detector::{
    DetectorControl, DetectorFunction, DummyDetectorHard, DummyDetectorSoft, ParameterDetector,
};
pub use progress::{format_progress, ProgressReporter};
pub use sweep::{HardwareSweep, NoneSweep, ParameterSweep, SweepControl, SweepFunction};
