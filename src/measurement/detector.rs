//! Detector functions: what a measurement records at each point.
//!
//! A soft detector returns one value per channel from
//! `acquire_data_point`. A hard detector acquires a whole sweep at once and
//! returns one vector per channel from `get_values`; it may return fewer
//! points than prepared, in which case `MeasurementControl` keeps asking
//! until the sweep is complete.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::parameter::Parameter;

/// How a detector acquires.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorControl {
    /// One point per `acquire_data_point` call.
    Soft,
    /// Whole sweeps through `get_values`.
    Hard,
}

/// What `MeasurementControl` records.
#[async_trait]
pub trait DetectorFunction: Send + Sync {
    /// Identifier used in logs and metadata.
    fn name(&self) -> &str;

    /// One name per returned value.
    fn value_names(&self) -> &[String];

    /// Units, parallel to `value_names`.
    fn value_units(&self) -> &[String];

    /// Soft or hard.
    fn detector_control(&self) -> DetectorControl;

    /// Called once before the measurement with every sweep point (one
    /// vector per point, one entry per sweep function).
    async fn prepare(&mut self, _sweep_points: &[Vec<f64>]) -> Result<()> {
        Ok(())
    }

    /// Soft acquisition of a single point.
    async fn acquire_data_point(&mut self) -> Result<Vec<f64>> {
        Err(anyhow!("{} does not support soft acquisition", self.name()))
    }

    /// Hard acquisition; one vector per value name.
    async fn get_values(&mut self) -> Result<Vec<Vec<f64>>> {
        Err(anyhow!("{} does not support hard acquisition", self.name()))
    }

    /// Called once after the measurement, also when it failed.
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

fn dummy_names() -> (Vec<String>, Vec<String>) {
    (
        vec!["distance".to_string(), "Power".to_string()],
        vec!["m".to_string(), "W".to_string()],
    )
}

/// Soft detector returning `[sin(i/π), cos(i/π)]` for its i-th call.
pub struct DummyDetectorSoft {
    value_names: Vec<String>,
    value_units: Vec<String>,
    i: u64,
}

impl DummyDetectorSoft {
    /// Detector starting at point 0.
    #[must_use]
    pub fn new() -> Self {
        let (value_names, value_units) = dummy_names();
        Self {
            value_names,
            value_units,
            i: 0,
        }
    }
}

impl Default for DummyDetectorSoft {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorFunction for DummyDetectorSoft {
    fn name(&self) -> &str {
        "Dummy_Detector_Soft"
    }

    fn value_names(&self) -> &[String] {
        &self.value_names
    }

    fn value_units(&self) -> &[String] {
        &self.value_units
    }

    fn detector_control(&self) -> DetectorControl {
        DetectorControl::Soft
    }

    async fn prepare(&mut self, _sweep_points: &[Vec<f64>]) -> Result<()> {
        self.i = 0;
        Ok(())
    }

    async fn acquire_data_point(&mut self) -> Result<Vec<f64>> {
        let x = self.i as f64;
        self.i += 1;
        Ok(vec![(x / PI).sin(), (x / PI).cos()])
    }
}

/// Hard detector returning `[sin(x/π), cos(x/π)]` over the prepared points.
pub struct DummyDetectorHard {
    value_names: Vec<String>,
    value_units: Vec<String>,
    noise: f64,
    delay: Duration,
    chunk_size: Option<usize>,
    sweep_points: Vec<f64>,
    cursor: usize,
}

impl DummyDetectorHard {
    /// Noise-free detector returning whole sweeps.
    #[must_use]
    pub fn new() -> Self {
        let (value_names, value_units) = dummy_names();
        Self {
            value_names,
            value_units,
            noise: 0.0,
            delay: Duration::ZERO,
            chunk_size: None,
            sweep_points: Vec::new(),
            cursor: 0,
        }
    }

    /// Peak-to-peak amplitude of uniform noise added to each value.
    pub fn with_noise(mut self, noise: f64) -> Self {
        self.noise = noise;
        self
    }

    /// Simulated acquisition time per `get_values` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Limit how many points one `get_values` call returns.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size.max(1));
        self
    }
}

impl Default for DummyDetectorHard {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DetectorFunction for DummyDetectorHard {
    fn name(&self) -> &str {
        "Dummy_Detector_Hard"
    }

    fn value_names(&self) -> &[String] {
        &self.value_names
    }

    fn value_units(&self) -> &[String] {
        &self.value_units
    }

    fn detector_control(&self) -> DetectorControl {
        DetectorControl::Hard
    }

    async fn prepare(&mut self, sweep_points: &[Vec<f64>]) -> Result<()> {
        self.sweep_points = sweep_points
            .iter()
            .map(|p| p.first().copied().context("sweep point without coordinates"))
            .collect::<Result<_>>()?;
        self.cursor = 0;
        Ok(())
    }

    async fn get_values(&mut self) -> Result<Vec<Vec<f64>>> {
        if self.sweep_points.is_empty() {
            return Err(anyhow!("{} was not prepared", self.name()));
        }
        if self.cursor >= self.sweep_points.len() {
            self.cursor = 0;
        }
        let end = match self.chunk_size {
            Some(n) => (self.cursor + n).min(self.sweep_points.len()),
            None => self.sweep_points.len(),
        };
        let chunk = &self.sweep_points[self.cursor..end];
        self.cursor = end;

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        let noise = self.noise;
        let mut rng = rand::thread_rng();
        let mut jitter = || {
            if noise > 0.0 {
                noise * (rng.gen::<f64>() - 0.5)
            } else {
                0.0
            }
        };
        let sines = chunk.iter().map(|x| (x / PI).sin() + jitter()).collect();
        let cosines = chunk.iter().map(|x| (x / PI).cos() + jitter()).collect();
        Ok(vec![sines, cosines])
    }
}

/// Soft detector reading one or more parameters.
pub struct ParameterDetector {
    name: String,
    parameters: Vec<Arc<Parameter>>,
    value_names: Vec<String>,
    value_units: Vec<String>,
}

impl ParameterDetector {
    /// One value per parameter, named and united after it.
    #[must_use]
    pub fn new(parameters: Vec<Arc<Parameter>>) -> Self {
        let value_names = parameters.iter().map(|p| p.name().to_string()).collect();
        let value_units = parameters.iter().map(|p| p.unit().to_string()).collect();
        let name = format!(
            "{}_detector",
            parameters
                .iter()
                .map(|p| p.name())
                .collect::<Vec<_>>()
                .join("_")
        );
        Self {
            name,
            parameters,
            value_names,
            value_units,
        }
    }
}

#[async_trait]
impl DetectorFunction for ParameterDetector {
    fn name(&self) -> &str {
        &self.name
    }

    fn value_names(&self) -> &[String] {
        &self.value_names
    }

    fn value_units(&self) -> &[String] {
        &self.value_units
    }

    fn detector_control(&self) -> DetectorControl {
        DetectorControl::Soft
    }

    async fn acquire_data_point(&mut self) -> Result<Vec<f64>> {
        let mut values = Vec::with_capacity(self.parameters.len());
        for p in &self.parameters {
            let value = p
                .get_latest()
                .await
                .with_context(|| format!("Failed to read {}", p.name()))?;
            values.push(
                value
                    .as_f64()
                    .ok_or_else(|| anyhow!("{} returned non-numeric value {}", p.name(), value))?,
            );
        }
        Ok(values)
    }
}
