//! Core library for circuit-QED measurement control.
//!
//! This library contains the measurement loop (`MeasurementControl`), the
//! sweep and detector function traits it drives, parameter holders for
//! instruments and qubits, and the numerical helpers used when preparing
//! pulses (distortion kernels, QuMIS trigger instructions). It is used by
//! the `cqed_mc` demonstration binary and by experiment scripts.

pub mod adaptive;
pub mod config;
pub mod data;
pub mod distortion;
pub mod error;
pub mod instructions;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod metadata;
pub mod parameter;
pub mod qubit;
pub mod retry;

pub use error::{AppResult, McError};
pub use measurement::MeasurementControl;
