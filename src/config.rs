//! Configuration system using Figment
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (`config/cqed_mc.toml` unless another path is given)
//! 3. Environment variables prefixed with `CQED_`, nested keys split on `__`
//!
//! ```text
//! CQED_APPLICATION__LOG_LEVEL=debug
//! CQED_MEASUREMENT__SOFT_AVG=4
//! CQED_STORAGE__BACKEND=json
//! ```
//!
//! # Example
//!
//! ```no_run
//! use cqed_mc::config::Settings;
//!
//! let settings = Settings::load_from("config/cqed_mc.toml")?;
//! println!("data goes to {}", settings.storage.datadir.display());
//! # Ok::<(), cqed_mc::error::McError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppResult, McError};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/cqed_mc.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Application name and logging
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Measurement defaults
    #[serde(default)]
    pub measurement: MeasurementConfig,
    /// Where datasets are written
    #[serde(default)]
    pub storage: StorageConfig,
    /// Optimizer defaults
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "cqed_mc".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Defaults applied to every `MeasurementControl`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementConfig {
    /// Number of times a full measurement is repeated and averaged
    pub soft_avg: usize,
    /// Print the progress line to stdout
    pub verbose: bool,
    /// Minimum time between two progress lines
    pub progress_interval_ms: u64,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            soft_avg: 1,
            verbose: true,
            progress_interval_ms: 200,
        }
    }
}

/// Storage backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend (csv, json, none)
    pub backend: String,
    /// Root directory for measurement folders
    pub datadir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "csv".to_string(),
            datadir: PathBuf::from("data"),
        }
    }
}

/// Defaults for adaptive (optimizer driven) measurements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Simplex size tolerance
    pub xatol: f64,
    /// Function value tolerance
    pub fatol: f64,
    /// Maximum number of evaluations per run
    pub max_evaluations: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            xatol: 1e-4,
            fatol: 1e-4,
            max_evaluations: 400,
        }
    }
}

impl Settings {
    /// Load configuration from the default path and environment variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns `McError::Config` if the sources cannot be merged and
    /// `McError::Configuration` if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("CQED_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(McError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_backends = ["csv", "json", "none"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(McError::Configuration(format!(
                "Invalid storage backend '{}'. Must be one of: {}",
                self.storage.backend,
                valid_backends.join(", ")
            )));
        }

        if self.measurement.soft_avg == 0 {
            return Err(McError::Configuration(
                "Invalid soft_avg 0. Must be at least 1".to_string(),
            ));
        }

        if !(self.adaptive.xatol > 0.0) || !(self.adaptive.fatol > 0.0) {
            return Err(McError::Configuration(format!(
                "Invalid adaptive tolerances xatol={} fatol={}. Must be positive",
                self.adaptive.xatol, self.adaptive.fatol
            )));
        }

        if self.adaptive.max_evaluations == 0 {
            return Err(McError::Configuration(
                "Invalid max_evaluations 0. Must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
