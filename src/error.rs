//! Custom error types for the measurement-control crate.
//!
//! `McError` is the single typed error for the crate. Trait seams (sweep
//! functions, detectors, transports, writers) speak `anyhow::Result`, and a
//! `McError` converts into `anyhow::Error` through `?` wherever it surfaces
//! there.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: loading failures from `figment` and
//!   semantic validation failures of `Settings`.
//! - **`Io`**: file and socket I/O.
//! - **`InvalidValue`**, **`DuplicateParameter`**, **`UnknownParameter`**,
//!   **`UnknownOperation`**: parameter holders and qubit operation tables.
//! - **`InvalidSetup`**, **`DetectorShape`**: a measurement that cannot run
//!   as configured, or a detector that returned data of the wrong shape.
//! - **`Instrument`**, **`NotImplemented`**: driver-level failures.
//! - **`Kernel`**, **`Instruction`**, **`Optimizer`**: numerical helpers.
//! - **`FeatureNotEnabled`**: functionality compiled out via cargo features.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, McError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum McError {
    /// Configuration sources could not be merged.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A setting holds an unsupported value.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A validator rejected a value.
    #[error("Invalid value {value} for parameter '{parameter}': {reason}")]
    InvalidValue {
        /// Parameter name.
        parameter: String,
        /// Rejected value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A read-only parameter was set.
    #[error("Parameter '{0}' is read-only")]
    ReadOnly(String),

    /// A parameter name is already taken.
    #[error("Duplicate parameter name {0}")]
    DuplicateParameter(String),

    /// No parameter with this name.
    #[error("Unknown parameter {0}")]
    UnknownParameter(String),

    /// No qubit operation with this name.
    #[error("Unknown operation {0}, add first using add_operation")]
    UnknownOperation(String),

    /// The measurement cannot run as configured.
    #[error("Invalid measurement setup: {0}")]
    InvalidSetup(String),

    /// A detector returned the wrong number of values.
    #[error("Detector '{detector}' returned {got} values, expected {expected}")]
    DetectorShape {
        /// Detector name.
        detector: String,
        /// Values per point the detector declares.
        expected: usize,
        /// Values actually returned.
        got: usize,
    },

    /// Driver-level failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Operation not available for this driver.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Bad distortion kernel input.
    #[error("Kernel error: {0}")]
    Kernel(String),

    /// Bad sequencer instruction argument.
    #[error("Instruction error: {0}")]
    Instruction(String),

    /// Optimizer misuse or bad settings.
    #[error("Optimizer error: {0}")]
    Optimizer(String),

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for McError {
    fn from(err: figment::Error) -> Self {
        McError::Config(Box::new(err))
    }
}
