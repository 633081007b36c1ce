//! Adaptive measurements: an optimizer picks the next sweep point.

pub mod nelder_mead;

use serde::{Deserialize, Serialize};

use crate::config::AdaptiveConfig;
use crate::error::{AppResult, McError};

pub use nelder_mead::NelderMead;

/// Ask/tell interface driven by `MeasurementControl`.
pub trait Optimizer: Send {
    /// Next point to evaluate, `None` once finished. Repeats the same point
    /// until it is answered with `tell`.
    fn ask(&mut self) -> Option<Vec<f64>>;

    /// Objective value for the point last returned by `ask`.
    fn tell(&mut self, value: f64) -> AppResult<()>;

    /// Best point seen so far and its value.
    fn best(&self) -> Option<(&[f64], f64)>;

    /// Number of values told so far.
    fn evaluations(&self) -> usize;

    /// True once the tolerances are met.
    fn is_converged(&self) -> bool;
}

/// Available optimizers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdaptiveFunction {
    /// Downhill simplex, see [`NelderMead`].
    NelderMead,
}

/// Optimizer choice and its arguments for an adaptive run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveSettings {
    /// Optimizer to use.
    pub function: AdaptiveFunction,
    /// Starting point, one entry per sweep function.
    pub x0: Vec<f64>,
    /// Size of the initial simplex along each axis.
    pub initial_step: Vec<f64>,
    /// Absolute tolerance on the simplex size.
    pub xatol: f64,
    /// Absolute tolerance on the spread of function values.
    pub fatol: f64,
    /// Evaluation budget.
    pub max_evaluations: usize,
    /// When false the first detector value is maximized.
    pub minimize: bool,
}

impl AdaptiveSettings {
    /// Nelder-Mead with the default tolerances and budget.
    #[must_use]
    pub fn nelder_mead(x0: Vec<f64>, initial_step: Vec<f64>) -> Self {
        Self::from_config(&AdaptiveConfig::default(), x0, initial_step)
    }

    /// Tolerances and budget taken from the `[adaptive]` config section.
    pub fn from_config(config: &AdaptiveConfig, x0: Vec<f64>, initial_step: Vec<f64>) -> Self {
        Self {
            function: AdaptiveFunction::NelderMead,
            x0,
            initial_step,
            xatol: config.xatol,
            fatol: config.fatol,
            max_evaluations: config.max_evaluations,
            minimize: true,
        }
    }

    /// Override both convergence tolerances.
    #[must_use]
    pub fn with_tolerances(mut self, xatol: f64, fatol: f64) -> Self {
        self.xatol = xatol;
        self.fatol = fatol;
        self
    }

    /// Override the evaluation budget.
    #[must_use]
    pub fn with_max_evaluations(mut self, max_evaluations: usize) -> Self {
        self.max_evaluations = max_evaluations;
        self
    }

    /// Maximize the first detector value instead.
    #[must_use]
    pub fn maximize(mut self) -> Self {
        self.minimize = false;
        self
    }

    /// Fresh optimizer for one run.
    pub fn build_optimizer(&self) -> AppResult<Box<dyn Optimizer>> {
        if !(self.xatol > 0.0 && self.fatol > 0.0) {
            return Err(McError::Optimizer(
                "tolerances must be positive".to_string(),
            ));
        }
        match self.function {
            AdaptiveFunction::NelderMead => Ok(Box::new(NelderMead::new(
                &self.x0,
                &self.initial_step,
                self.xatol,
                self.fatol,
                self.max_evaluations,
            )?)),
        }
    }
}
