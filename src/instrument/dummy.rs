//! Dummy parameter holder for testing measurements without hardware.
//!
//! `DummyParHolder` exposes three coordinates `x`, `y`, `z` and a read-only
//! `parabola` whose value is `x² + y² + z²` plus optional uniform noise.
//! Reading `parabola` waits `delay` seconds, which makes it a convenient
//! stand-in for a slow detector.
//!
//! # Example
//!
//! ```rust,ignore
//! let dummy = DummyParHolder::new("dummy")?;
//! dummy.instrument().set("x", 2.0).await?;
//! assert_eq!(dummy.measure_parabola().await?, 4.0);
//! ```

use rand::Rng;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::Instrument;
use crate::error::AppResult;
use crate::parameter::{ParamValue, Parameter, Validator};

/// Simulated instrument with a parabola readout.
pub struct DummyParHolder {
    instrument: Instrument,
    parabola: Arc<Parameter>,
}

impl DummyParHolder {
    /// All coordinates at zero, no noise, no delay.
    pub fn new(name: impl Into<String>) -> AppResult<Self> {
        let mut instrument = Instrument::new(name);

        let mut coords = Vec::with_capacity(3);
        for axis in ["x", "y", "z"] {
            coords.push(instrument.add_parameter(
                Parameter::new(axis, 0.0)
                    .with_unit("m")
                    .with_validator(Validator::any_number()),
            )?);
        }
        let noise = instrument.add_parameter(
            Parameter::new("noise", 0.0)
                .with_docstring("Amplitude of uniform noise added to parabola")
                .with_validator(Validator::Numbers {
                    min: Some(0.0),
                    max: None,
                }),
        )?;
        let delay = instrument.add_parameter(
            Parameter::new("delay", 0.0)
                .with_unit("s")
                .with_validator(Validator::Numbers {
                    min: Some(0.0),
                    max: None,
                }),
        )?;

        let parabola = instrument.add_parameter(
            Parameter::new("parabola", ParamValue::None)
                .with_unit("V")
                .read_only()
                .with_hardware_read(move || {
                    let coords = coords.clone();
                    let noise = noise.clone();
                    let delay = delay.clone();
                    Box::pin(async move {
                        let wait = delay.get().as_f64().unwrap_or(0.0);
                        if wait > 0.0 {
                            let wait = Duration::try_from_secs_f64(wait).map_err(|e| {
                                anyhow::anyhow!("delay of {} s is not a valid duration: {}", wait, e)
                            })?;
                            sleep(wait).await;
                        }
                        let distance: f64 = coords
                            .iter()
                            .map(|p| p.get().as_f64().unwrap_or(0.0).powi(2))
                            .sum();
                        let amplitude = noise.get().as_f64().unwrap_or(0.0);
                        let jitter = if amplitude > 0.0 {
                            amplitude * rand::thread_rng().gen::<f64>()
                        } else {
                            0.0
                        };
                        Ok::<_, anyhow::Error>(ParamValue::Float(distance + jitter))
                    })
                }),
        )?;

        Ok(Self {
            instrument,
            parabola,
        })
    }

    /// Instrument holding `x`, `y`, `z`, `noise`, `delay` and `parabola`.
    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Shared handle to a parameter, e.g. to wrap it into a sweep.
    pub fn parameter(&self, name: &str) -> AppResult<Arc<Parameter>> {
        self.instrument.parameter(name)
    }

    /// The read-only parabola, ready for a `ParameterDetector`.
    #[must_use]
    pub fn parabola(&self) -> Arc<Parameter> {
        self.parabola.clone()
    }

    /// Read the parabola from its hardware reader.
    pub async fn measure_parabola(&self) -> anyhow::Result<f64> {
        let value = self.parabola.get_latest().await?;
        value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("parabola returned non-numeric value {}", value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_parabola_without_noise() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        dummy.instrument().set("x", 1.0).await.unwrap();
        dummy.instrument().set("y", -2.0).await.unwrap();
        dummy.instrument().set("z", 0.5).await.unwrap();
        assert!((dummy.measure_parabola().await.unwrap() - 5.25).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_noise_is_bounded() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        dummy.instrument().set("noise", 0.1).await.unwrap();
        for _ in 0..20 {
            let v = dummy.measure_parabola().await.unwrap();
            assert!((0.0..0.1).contains(&v));
        }
    }

    #[tokio::test]
    async fn test_negative_delay_rejected() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        assert!(dummy.instrument().set("delay", -1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_infinite_delay_rejected() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        assert!(dummy.instrument().set("delay", f64::INFINITY).await.is_err());
        assert_eq!(dummy.instrument().get_f64("delay").unwrap(), Some(0.0));
    }

    #[tokio::test]
    async fn test_oversized_delay_is_an_error() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        dummy.instrument().set("delay", 1e300).await.unwrap();
        let err = dummy.measure_parabola().await.unwrap_err();
        assert!(format!("{:#}", err).contains("not a valid duration"));
    }

    #[tokio::test]
    async fn test_parabola_is_read_only() {
        let dummy = DummyParHolder::new("dummy").unwrap();
        assert!(dummy.instrument().set("parabola", 1.0).await.is_err());
    }
}
