//! Experiment metadata stored next to every dataset.
//!
//! `Metadata` records what was measured and how: the experiment name, the
//! measurement mode, descriptions of the sweep and detector functions, a
//! snapshot of every instrument in the station and free-form user
//! parameters. Storage writers embed it at the top of each data file so a
//! dataset can be understood without the code that produced it.
//!
//! `MeasurementControl` fills it automatically; `MetadataBuilder` is there
//! for callers that want to add their own annotations first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppResult, McError};

/// Captures the context of one measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    /// The name of the experiment.
    pub experiment_name: String,
    /// A free-text description.
    pub description: String,
    /// Measurement mode (`1D`, `2D`, `adaptive`) and control (`soft`, `hard`).
    pub mode: String,
    /// One entry per sweep function, outer sweep last.
    pub sweep_functions: Vec<String>,
    /// Detector function name.
    pub detector_function: String,
    /// Instrument parameter snapshot taken when the run started.
    pub station: serde_json::Value,
    /// User-defined parameters.
    pub parameters: BTreeMap<String, serde_json::Value>,
    /// User annotations or notes.
    pub annotations: String,
    /// Version of this crate.
    pub software_version: String,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            experiment_name: "measurement".to_string(),
            description: String::new(),
            mode: String::new(),
            sweep_functions: Vec::new(),
            detector_function: String::new(),
            station: serde_json::Value::Null,
            parameters: BTreeMap::new(),
            annotations: String::new(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A builder for constructing `Metadata` instances.
#[derive(Default)]
pub struct MetadataBuilder {
    inner: Metadata,
}

impl MetadataBuilder {
    /// Builder starting from `Metadata::default()`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the experiment name.
    pub fn experiment_name(mut self, name: &str) -> Self {
        self.inner.experiment_name = name.to_string();
        self
    }

    /// Set the free-text description.
    pub fn description(mut self, description: &str) -> Self {
        self.inner.description = description.to_string();
        self
    }

    /// Set the measurement mode string.
    pub fn mode(mut self, mode: &str) -> Self {
        self.inner.mode = mode.to_string();
        self
    }

    /// Append one sweep function description.
    pub fn sweep_function(mut self, description: &str) -> Self {
        self.inner.sweep_functions.push(description.to_string());
        self
    }

    /// Set the detector function name.
    pub fn detector_function(mut self, name: &str) -> Self {
        self.inner.detector_function = name.to_string();
        self
    }

    /// Station snapshot, as produced by `Station::snapshot`.
    pub fn station(mut self, snapshot: serde_json::Value) -> Self {
        self.inner.station = snapshot;
        self
    }

    /// Add or replace a user parameter.
    pub fn parameter(mut self, key: &str, value: serde_json::Value) -> Self {
        self.inner.parameters.insert(key.to_string(), value);
        self
    }

    /// Set user annotations.
    pub fn annotations(mut self, annotations: &str) -> Self {
        self.inner.annotations = annotations.to_string();
        self
    }

    /// Finish building.
    #[must_use]
    pub fn build(self) -> Metadata {
        self.inner
    }
}

impl Metadata {
    /// Validates the metadata.
    pub fn validate(&self) -> AppResult<()> {
        if self.experiment_name.trim().is_empty() {
            return Err(McError::Configuration(
                "Experiment name cannot be empty.".to_string(),
            ));
        }
        Ok(())
    }
}
