//! Flux-line distortion corrections.
//!
//! [`Distortion`] is an instrument whose parameters describe the skin
//! effect, a single reflection and two exponential overshoots of a flux
//! line. `kernel()` convolves the matching correction kernels (plus any
//! precomputed kernel files) and caches the result until a parameter
//! actually changes value.

pub mod kernels;

use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, McError};
use crate::instrument::Instrument;
use crate::parameter::{ParamValue, Parameter, Validator};

pub use kernels::{
    bounce_kernel, convolve, decay_kernel, erfc, heaviside, kernel_from_step_response,
    skin_kernel, square,
};

/// Key under which `kernel_to_cache` stores the combined kernel.
pub const KERNEL_CACHE_KEY: &str = "OPT_chevron.tmp";

/// Flux-line distortion model with a cached combined kernel.
pub struct Distortion {
    instrument: Instrument,
    kernel_dir: Option<PathBuf>,
    kernel_list: Vec<String>,
    cache: Option<(Value, Vec<f64>)>,
}

fn non_negative() -> Validator {
    Validator::Numbers {
        min: Some(0.0),
        max: None,
    }
}

fn length() -> Validator {
    Validator::Ints {
        min: Some(1),
        max: None,
    }
}

impl Distortion {
    /// Distortion with every correction disabled.
    pub fn new(name: impl Into<String>) -> AppResult<Self> {
        let mut instrument = Instrument::new(name);
        instrument.add_parameter(
            Parameter::new("skineffect_alpha", 0.0)
                .with_label("Skin effect alpha")
                .with_validator(non_negative()),
        )?;
        instrument.add_parameter(
            Parameter::new("skineffect_length", 600)
                .with_unit("samples")
                .with_validator(length()),
        )?;
        instrument.add_parameter(
            Parameter::new("bounce_amp_1", 0.0).with_validator(Validator::any_number()),
        )?;
        instrument.add_parameter(
            Parameter::new("bounce_tau_1", 1.0)
                .with_unit("samples")
                .with_validator(non_negative()),
        )?;
        instrument.add_parameter(
            Parameter::new("bounce_length_1", 1)
                .with_unit("samples")
                .with_validator(length()),
        )?;
        for i in 1..=2 {
            instrument.add_parameter(
                Parameter::new(format!("decay_amp_{}", i), 0.0)
                    .with_validator(Validator::any_number()),
            )?;
            instrument.add_parameter(
                Parameter::new(format!("decay_tau_{}", i), 1.0)
                    .with_unit("samples")
                    .with_validator(non_negative()),
            )?;
            instrument.add_parameter(
                Parameter::new(format!("decay_length_{}", i), 100)
                    .with_unit("samples")
                    .with_validator(length()),
            )?;
        }

        Ok(Self {
            instrument,
            kernel_dir: None,
            kernel_list: Vec::new(),
            cache: None,
        })
    }

    /// Parameters of this distortion model.
    #[must_use]
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    /// Validate and set one of the kernel parameters.
    pub async fn set(&self, name: &str, value: impl Into<ParamValue>) -> anyhow::Result<()> {
        self.instrument.set(name, value).await
    }

    fn number(&self, name: &str) -> AppResult<f64> {
        self.instrument.get_f64(name)?.ok_or_else(|| McError::InvalidValue {
            parameter: name.to_string(),
            value: "None".to_string(),
            reason: "expected a number".to_string(),
        })
    }

    fn samples(&self, name: &str) -> AppResult<usize> {
        let value = self.instrument.get(name)?;
        value
            .as_i64()
            .and_then(|v| usize::try_from(v).ok())
            .ok_or_else(|| McError::InvalidValue {
                parameter: name.to_string(),
                value: value.to_string(),
                reason: "expected a sample count".to_string(),
            })
    }

    /// Directory the kernel list is resolved against.
    pub fn set_kernel_dir(&mut self, dir: impl AsRef<Path>) {
        self.kernel_dir = Some(dir.as_ref().to_path_buf());
    }

    /// Directory set with `set_kernel_dir`.
    #[must_use]
    pub fn kernel_dir(&self) -> Option<&Path> {
        self.kernel_dir.as_deref()
    }

    /// Kernel files (relative to the kernel dir) convolved into `kernel()`.
    pub fn set_kernel_list(&mut self, files: Vec<String>) {
        self.kernel_list = files;
    }

    /// Extra kernel files, in convolution order.
    #[must_use]
    pub fn kernel_list(&self) -> &[String] {
        &self.kernel_list
    }

    /// Skin-effect correction from `skineffect_alpha` and `skineffect_length`.
    pub fn get_skin_kernel(&self) -> AppResult<Vec<f64>> {
        skin_kernel(
            self.number("skineffect_alpha")?,
            self.samples("skineffect_length")?,
        )
    }

    /// Reflection correction from the `bounce_*_1` parameters.
    pub fn get_bounce_kernel_1(&self) -> AppResult<Vec<f64>> {
        bounce_kernel(
            self.number("bounce_amp_1")?,
            self.number("bounce_tau_1")?,
            self.samples("bounce_length_1")?,
        )
    }

    fn get_decay_kernel(&self, i: u8) -> AppResult<Vec<f64>> {
        decay_kernel(
            self.number(&format!("decay_amp_{}", i))?,
            self.number(&format!("decay_tau_{}", i))?,
            self.samples(&format!("decay_length_{}", i))?,
        )
    }

    /// First exponential overshoot correction.
    pub fn get_decay_kernel_1(&self) -> AppResult<Vec<f64>> {
        self.get_decay_kernel(1)
    }

    /// Second exponential overshoot correction.
    pub fn get_decay_kernel_2(&self) -> AppResult<Vec<f64>> {
        self.get_decay_kernel(2)
    }

    /// Parameter values with every number as a float, so `1` and `1.0`
    /// compare equal.
    fn config(&self) -> Value {
        let parameters: Map<String, Value> = self
            .instrument
            .parameter_names()
            .into_iter()
            .map(|name| {
                let value = self.instrument.get(name).unwrap_or(ParamValue::None);
                let normalized = match value.as_f64() {
                    Some(v) => json!(v),
                    None => json!(value),
                };
                (name.to_string(), normalized)
            })
            .collect();
        json!({
            "parameters": parameters,
            "kernel_dir": self.kernel_dir.as_ref().map(|d| d.display().to_string()),
            "kernel_list": self.kernel_list,
        })
    }

    /// True when `kernel()` would have to recompute.
    pub fn config_changed(&self) -> bool {
        match &self.cache {
            Some((config, _)) => *config != self.config(),
            None => true,
        }
    }

    /// Convolution of every configured correction kernel.
    pub fn kernel(&mut self) -> AppResult<Vec<f64>> {
        let config = self.config();
        if let Some((cached_config, kernel)) = &self.cache {
            if *cached_config == config {
                return Ok(kernel.clone());
            }
        }

        let mut kernel = self.get_skin_kernel()?;
        for other in [
            self.get_bounce_kernel_1()?,
            self.get_decay_kernel_1()?,
            self.get_decay_kernel_2()?,
        ] {
            kernel = convolve(&kernel, &other);
        }
        if !self.kernel_list.is_empty() {
            let dir = self.kernel_dir.clone().unwrap_or_default();
            for file in &self.kernel_list {
                let loaded = load_kernel_file(dir.join(file))?;
                kernel = convolve(&kernel, &loaded);
            }
        }
        tracing::debug!(
            instrument = self.instrument.name(),
            length = kernel.len(),
            "distortion kernel recomputed"
        );

        self.cache = Some((config, kernel.clone()));
        Ok(kernel)
    }

    /// Store the combined kernel in `cache` under [`KERNEL_CACHE_KEY`].
    pub fn kernel_to_cache(&mut self, cache: &mut HashMap<String, Vec<f64>>) -> AppResult<()> {
        let kernel = self.kernel()?;
        cache.insert(KERNEL_CACHE_KEY.to_string(), kernel);
        Ok(())
    }

    /// Write the combined kernel as text, one value per line.
    pub fn save_kernel(&mut self, path: impl AsRef<Path>) -> AppResult<()> {
        let kernel = self.kernel()?;
        let text: String = kernel.iter().map(|v| format!("{:e}\n", v)).collect();
        std::fs::write(path.as_ref(), text)?;
        tracing::info!(path = %path.as_ref().display(), "kernel saved");
        Ok(())
    }
}

/// Read a whitespace-separated kernel file.
pub fn load_kernel_file(path: impl AsRef<Path>) -> AppResult<Vec<f64>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let kernel = text
        .split_whitespace()
        .map(|token| {
            token.parse::<f64>().map_err(|e| {
                McError::Kernel(format!("{}: bad value '{}': {}", path.display(), token, e))
            })
        })
        .collect::<AppResult<Vec<f64>>>()?;
    if kernel.is_empty() {
        return Err(McError::Kernel(format!("{} holds no kernel values", path.display())));
    }
    Ok(kernel)
}
