//! Flux-tunable transmon.

use anyhow::{anyhow, Context};
use std::sync::Arc;

use crate::data::{Dataset, RunMode};
use crate::error::{AppResult, McError};
use crate::measurement::{DetectorFunction, MeasurementControl, SweepFunction};
use crate::parameter::{ParamValue, Parameter, Validator};

use super::hamiltonian::{qubit_freq_dac, qubit_freq_flux, transmon_transitions};
use super::Qubit;

/// Values that replace the transmon's own parameters in
/// [`Transmon::calculate_frequency`].
#[derive(Clone, Debug, Default)]
pub struct FrequencyOverrides {
    /// Charging energy in Hz.
    pub e_c: Option<f64>,
    /// Sum of the junction energies in Hz.
    pub e_j: Option<f64>,
    /// Junction asymmetry `d`.
    pub asymmetry: Option<f64>,
    /// DAC voltage, converted to flux. Excludes `flux`.
    pub dac_voltage: Option<f64>,
    /// Flux in units of Φ₀.
    pub flux: Option<f64>,
    /// Defaults to 1.
    pub n_transitions: Option<usize>,
}

/// Options for [`Transmon::find_frequency`].
#[derive(Clone, Debug)]
pub struct FindFrequency {
    /// Explicit frequencies; otherwise a window around the prediction.
    pub freqs: Option<Vec<f64>>,
    /// Width of the predicted window in Hz.
    pub f_span: f64,
    /// Step of the predicted window in Hz.
    pub f_step: f64,
    /// Write the result to `f_qubit`.
    pub update: bool,
}

impl Default for FindFrequency {
    fn default() -> Self {
        Self {
            freqs: None,
            f_span: 100e6,
            f_step: 1e6,
            update: true,
        }
    }
}

/// Transmon qubit with Hamiltonian parameters and spectroscopy.
pub struct Transmon {
    qubit: Qubit,
}

fn manual(name: &str, unit: &str) -> Parameter {
    Parameter::new(name, ParamValue::None)
        .with_unit(unit)
        .with_validator(Validator::any_number())
}

impl Transmon {
    /// Transmon with every parameter unset.
    pub fn new(name: impl Into<String>) -> AppResult<Self> {
        let mut qubit = Qubit::new(name);
        let inst = qubit.instrument_mut();

        inst.add_parameter(manual("E_c", "Hz"))?;
        inst.add_parameter(manual("E_j", "Hz"))?;
        inst.add_parameter(manual("asymmetry", ""))?;
        inst.add_parameter(manual("dac_voltage", "mV"))?;
        inst.add_parameter(manual("dac_sweet_spot", "mV"))?;
        inst.add_parameter(manual("dac_flux_coefficient", ""))?;
        inst.add_parameter(Parameter::new("dac_channel", ParamValue::None).with_validator(Validator::ints()))?;
        inst.add_parameter(manual("flux", ""))?;

        inst.add_parameter(manual("f_qubit", "Hz").with_label("qubit frequency"))?;
        inst.add_parameter(manual("f_max", "Hz").with_label("qubit frequency"))?;
        inst.add_parameter(manual("f_res", "Hz").with_label("resonator frequency"))?;
        inst.add_parameter(manual("f_RO", "Hz").with_label("readout frequency"))?;

        inst.add_parameter(manual("RO_pulse_delay", "s"))?;
        inst.add_parameter(manual("RO_pulse_length", "s"))?;
        inst.add_parameter(manual("RO_acq_marker_delay", "s"))?;
        inst.add_parameter(
            Parameter::new("RO_acq_marker_channel", ParamValue::None)
                .with_validator(Validator::Strings),
        )?;
        inst.add_parameter(manual("RO_amp", "V"))?;
        inst.add_parameter(
            Parameter::new("pulse_delay", 0.0)
                .with_unit("s")
                .with_docstring("Time between start of pulses")
                .with_validator(Validator::numbers(0.0, 1e-6)),
        )?;
        inst.add_parameter(
            Parameter::new("f_qubit_calc", ParamValue::None).with_validator(Validator::Enum(vec![
                ParamValue::None,
                "dac".into(),
                "flux".into(),
            ])),
        )?;

        Ok(Self { qubit })
    }

    /// Underlying parameter holder and operations table.
    #[must_use]
    pub fn qubit(&self) -> &Qubit {
        &self.qubit
    }

    /// Mutable access, e.g. to add operations.
    pub fn qubit_mut(&mut self) -> &mut Qubit {
        &mut self.qubit
    }

    /// Qubit name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.qubit.name()
    }

    /// Shared handle to one of the transmon parameters.
    pub fn parameter(&self, name: &str) -> AppResult<Arc<Parameter>> {
        self.qubit.instrument().parameter(name)
    }

    /// Validate and set a transmon parameter.
    pub async fn set(&self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        self.qubit.instrument().set(name, value).await
    }

    fn required(&self, name: &str) -> AppResult<f64> {
        self.qubit
            .instrument()
            .get_f64(name)?
            .ok_or_else(|| McError::InvalidValue {
                parameter: name.to_string(),
                value: "None".to_string(),
                reason: "must be set first".to_string(),
            })
    }

    fn optional(&self, name: &str, default: f64) -> AppResult<f64> {
        Ok(self.qubit.instrument().get_f64(name)?.unwrap_or(default))
    }

    fn dac_to_flux(&self, dac_voltage: f64) -> AppResult<f64> {
        let sweet_spot = self.optional("dac_sweet_spot", 0.0)?;
        let coefficient = self.required("dac_flux_coefficient")?;
        Ok(coefficient * (dac_voltage - sweet_spot))
    }

    /// Transition frequencies from the full transmon Hamiltonian.
    ///
    /// The qubit's own parameters are used where `overrides` leaves a
    /// field empty. A working point can be given as a DAC voltage or as a
    /// flux, not both.
    pub fn calculate_frequency(&self, overrides: &FrequencyOverrides) -> AppResult<Vec<f64>> {
        if overrides.dac_voltage.is_some() && overrides.flux.is_some() {
            return Err(McError::InvalidSetup(
                "specify either dac voltage or flux but not both".to_string(),
            ));
        }
        let e_c = match overrides.e_c {
            Some(v) => v,
            None => self.required("E_c")?,
        };
        let e_j = match overrides.e_j {
            Some(v) => v,
            None => self.required("E_j")?,
        };
        let asymmetry = match overrides.asymmetry {
            Some(v) => v,
            None => self.optional("asymmetry", 0.0)?,
        };
        let flux = match (overrides.dac_voltage, overrides.flux) {
            (Some(dac), None) => self.dac_to_flux(dac)?,
            (None, Some(flux)) => flux,
            _ => self.optional("flux", 0.0)?,
        };
        transmon_transitions(e_c, e_j, asymmetry, flux, overrides.n_transitions.unwrap_or(1))
    }

    /// Qubit frequency predicted by the tuning model selected in
    /// `f_qubit_calc` (`None` uses the last known `f_qubit`).
    pub fn predicted_frequency(&self) -> AppResult<f64> {
        let method = self.qubit.instrument().get("f_qubit_calc")?;
        match method.as_str() {
            None => self.required("f_qubit"),
            Some("dac") => Ok(qubit_freq_dac(
                self.required("dac_voltage")?,
                self.required("f_max")?,
                self.required("E_c")?,
                self.optional("dac_sweet_spot", 0.0)?,
                self.required("dac_flux_coefficient")?,
                self.optional("asymmetry", 0.0)?,
            )),
            Some("flux") => Ok(qubit_freq_flux(
                self.optional("flux", 0.0)?,
                self.required("f_max")?,
                self.required("E_c")?,
                self.optional("asymmetry", 0.0)?,
            )),
            Some(other) => Err(McError::InvalidValue {
                parameter: "f_qubit_calc".to_string(),
                value: other.to_string(),
                reason: "must be None, dac or flux".to_string(),
            }),
        }
    }

    /// `[f − span/2, f + span/2)` in steps of `step` around the prediction.
    pub fn spectroscopy_frequencies(&self, f_span: f64, f_step: f64) -> AppResult<Vec<f64>> {
        if !(f_step > 0.0) || !(f_span > 0.0) {
            return Err(McError::InvalidSetup(format!(
                "span {} and step {} must be positive",
                f_span, f_step
            )));
        }
        let center = self.predicted_frequency()?;
        let start = center - f_span / 2.0;
        let n = (f_span / f_step).ceil() as usize;
        Ok((0..n).map(|i| start + i as f64 * f_step).collect())
    }

    /// Soft 1D frequency sweep labelled `spectroscopy_<qubit>`.
    pub async fn measure_spectroscopy(
        &self,
        mc: &mut MeasurementControl,
        freqs: &[f64],
        source: impl SweepFunction + 'static,
        detector: impl DetectorFunction + 'static,
    ) -> anyhow::Result<Dataset> {
        mc.set_sweep_function(source);
        mc.set_sweep_points(freqs);
        mc.set_detector_function(detector);
        mc.run(&format!("spectroscopy{}", self.qubit.msmt_suffix()), RunMode::OneD)
            .await
    }

    /// Run spectroscopy and take the frequency of the largest response.
    pub async fn find_frequency(
        &self,
        mc: &mut MeasurementControl,
        options: &FindFrequency,
        source: impl SweepFunction + 'static,
        detector: impl DetectorFunction + 'static,
    ) -> anyhow::Result<f64> {
        let freqs = match &options.freqs {
            Some(freqs) => freqs.clone(),
            None => self.spectroscopy_frequencies(options.f_span, options.f_step)?,
        };
        let dataset = self.measure_spectroscopy(mc, &freqs, source, detector).await?;

        let swept = dataset
            .sweep_column(0)
            .context("spectroscopy dataset has no sweep column")?;
        let response = dataset
            .value_column(0)
            .context("spectroscopy dataset has no values")?;
        let peak = response
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| swept[i])
            .ok_or_else(|| anyhow!("no finite spectroscopy data for {}", self.name()))?;

        tracing::info!(qubit = self.name(), peak, "qubit frequency found");
        if options.update {
            self.set("f_qubit", peak).await?;
        }
        Ok(peak)
    }
}
