//! Sweep functions: the knobs a measurement turns.
//!
//! A soft sweep is stepped by `MeasurementControl`, one `set_parameter`
//! call per point. A hard sweep is handed all points in `prepare` and the
//! hardware steps through them during a single acquisition.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::parameter::Parameter;

/// Who steps through the points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepControl {
    /// `MeasurementControl` sets every point.
    Soft,
    /// The hardware steps through prepared points.
    Hard,
}

/// A quantity `MeasurementControl` sweeps.
#[async_trait]
pub trait SweepFunction: Send + Sync {
    /// Identifier used in logs and metadata.
    fn name(&self) -> &str;

    /// Column name used in datasets.
    fn parameter_name(&self) -> &str;

    /// Unit of the swept quantity.
    fn unit(&self) -> &str;

    /// Soft or hard.
    fn sweep_control(&self) -> SweepControl;

    /// Called once before the measurement with this function's points.
    async fn prepare(&mut self, _sweep_points: &[f64]) -> Result<()> {
        Ok(())
    }

    /// Move to `value` (soft sweeps only).
    async fn set_parameter(&mut self, value: f64) -> Result<()>;

    /// Called once after the measurement, also when it failed.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sweep that does nothing; useful to repeat a detector or to label points.
#[derive(Clone, Debug)]
pub struct NoneSweep {
    control: SweepControl,
    parameter_name: String,
    unit: String,
}

impl NoneSweep {
    /// Soft sweep labelled `pts`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            control: SweepControl::Soft,
            parameter_name: "pts".to_string(),
            unit: "arb. unit".to_string(),
        }
    }

    /// Hard variant, for detectors that step internally.
    pub fn hard() -> Self {
        Self {
            control: SweepControl::Hard,
            ..Self::new()
        }
    }

    /// Relabel the column.
    #[must_use]
    pub fn with_parameter_name(mut self, name: impl Into<String>, unit: impl Into<String>) -> Self {
        self.parameter_name = name.into();
        self.unit = unit.into();
        self
    }
}

impl Default for NoneSweep {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SweepFunction for NoneSweep {
    fn name(&self) -> &str {
        "None_Sweep"
    }

    fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn sweep_control(&self) -> SweepControl {
        self.control
    }

    async fn set_parameter(&mut self, _value: f64) -> Result<()> {
        Ok(())
    }
}

/// Soft sweep setting a [`Parameter`] at every point.
pub struct ParameterSweep {
    name: String,
    parameter: Arc<Parameter>,
}

impl ParameterSweep {
    /// Sweep named `{parameter}_sweep`.
    #[must_use]
    pub fn new(parameter: Arc<Parameter>) -> Self {
        Self {
            name: format!("{}_sweep", parameter.name()),
            parameter,
        }
    }
}

#[async_trait]
impl SweepFunction for ParameterSweep {
    fn name(&self) -> &str {
        &self.name
    }

    fn parameter_name(&self) -> &str {
        self.parameter.name()
    }

    fn unit(&self) -> &str {
        self.parameter.unit()
    }

    fn sweep_control(&self) -> SweepControl {
        SweepControl::Soft
    }

    async fn set_parameter(&mut self, value: f64) -> Result<()> {
        self.parameter.set(value).await
    }
}

/// Hard sweep standing in for hardware that steps through a prepared list.
#[derive(Clone, Debug)]
pub struct HardwareSweep {
    parameter_name: String,
    unit: String,
    prepared: Vec<f64>,
}

impl HardwareSweep {
    /// Hard sweep writing one column `parameter_name`.
    #[must_use]
    pub fn new(parameter_name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            parameter_name: parameter_name.into(),
            unit: unit.into(),
            prepared: Vec::new(),
        }
    }

    /// Points received in the last `prepare`.
    pub fn prepared_points(&self) -> &[f64] {
        &self.prepared
    }
}

#[async_trait]
impl SweepFunction for HardwareSweep {
    fn name(&self) -> &str {
        "Hardware_Sweep"
    }

    fn parameter_name(&self) -> &str {
        &self.parameter_name
    }

    fn unit(&self) -> &str {
        &self.unit
    }

    fn sweep_control(&self) -> SweepControl {
        SweepControl::Hard
    }

    async fn prepare(&mut self, sweep_points: &[f64]) -> Result<()> {
        self.prepared = sweep_points.to_vec();
        Ok(())
    }

    async fn set_parameter(&mut self, _value: f64) -> Result<()> {
        anyhow::bail!("{} is a hard sweep and cannot be stepped", self.parameter_name)
    }
}
