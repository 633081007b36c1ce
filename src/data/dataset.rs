//! The in-memory result of one measurement run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::metadata::Metadata;

/// Shape of a measurement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Single sweep, soft or hard.
    #[serde(rename = "1D")]
    OneD,
    /// Outer soft sweep around an inner line.
    #[serde(rename = "2D")]
    TwoD,
    /// Points chosen by an optimizer.
    #[serde(rename = "adaptive")]
    Adaptive,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunMode::OneD => "1D",
            RunMode::TwoD => "2D",
            RunMode::Adaptive => "adaptive",
        };
        f.write_str(s)
    }
}

/// Where a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still acquiring.
    Running,
    /// Every point was acquired.
    Completed,
    /// Stopped through an abort handle.
    Aborted,
}

/// Outcome of an adaptive run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    /// Best point found.
    pub x_opt: Vec<f64>,
    /// Detector value at `x_opt`, in the detector's sign.
    pub f_opt: f64,
    /// Points evaluated.
    pub evaluations: usize,
    /// True when the tolerances were met within the budget.
    pub converged: bool,
}

/// Rows of `[sweep values..., detector values...]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    /// Unique id of this run.
    pub uid: Uuid,
    /// Measurement label.
    pub name: String,
    /// Shape of the run.
    pub mode: RunMode,
    /// Running, completed or aborted.
    pub status: RunStatus,
    /// Creation time.
    pub started: DateTime<Utc>,
    /// `None` while running.
    pub finished: Option<DateTime<Utc>>,
    /// Sweep column names, outer sweep last for 2D runs.
    pub sweep_names: Vec<String>,
    /// Units of the sweep columns.
    pub sweep_units: Vec<String>,
    /// Detector value names.
    pub value_names: Vec<String>,
    /// Units of the detector values.
    pub value_units: Vec<String>,
    /// One row per acquired point.
    pub rows: Vec<Vec<f64>>,
    /// `(n_x, n_y)` for 2D runs; rows are ordered x-fastest.
    pub shape_2d: Option<(usize, usize)>,
    /// Completed soft-average iterations.
    pub soft_iterations: usize,
    /// Set by adaptive runs.
    pub optimization: Option<OptimizationResult>,
    /// Settings and station snapshot saved with the data.
    pub metadata: Metadata,
}

impl Dataset {
    /// Empty running dataset. `sweep` and `values` are `(names, units)`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        mode: RunMode,
        sweep: (Vec<String>, Vec<String>),
        values: (Vec<String>, Vec<String>),
        metadata: Metadata,
    ) -> Self {
        Self {
            uid: Uuid::new_v4(),
            name: name.into(),
            mode,
            status: RunStatus::Running,
            started: Utc::now(),
            finished: None,
            sweep_names: sweep.0,
            sweep_units: sweep.1,
            value_names: values.0,
            value_units: values.1,
            rows: Vec::new(),
            shape_2d: None,
            soft_iterations: 0,
            optimization: None,
            metadata,
        }
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True before the first point.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Sweep names followed by value names.
    pub fn column_names(&self) -> Vec<&str> {
        self.sweep_names
            .iter()
            .chain(self.value_names.iter())
            .map(String::as_str)
            .collect()
    }

    /// Column headers in `name (unit)` form.
    pub fn column_labels(&self) -> Vec<String> {
        self.sweep_names
            .iter()
            .zip(&self.sweep_units)
            .chain(self.value_names.iter().zip(&self.value_units))
            .map(|(name, unit)| format!("{} ({})", name, unit))
            .collect()
    }

    fn column_at(&self, index: usize) -> Option<Vec<f64>> {
        if index >= self.sweep_names.len() + self.value_names.len() {
            return None;
        }
        self.rows.iter().map(|row| row.get(index).copied()).collect()
    }

    /// Column by name; sweep columns take precedence over value columns.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.column_names().iter().position(|c| *c == name)?;
        self.column_at(index)
    }

    /// Values of the `i`-th sweep function.
    #[must_use]
    pub fn sweep_column(&self, i: usize) -> Option<Vec<f64>> {
        if i >= self.sweep_names.len() {
            return None;
        }
        self.column_at(i)
    }

    /// Values of the `i`-th detector value.
    #[must_use]
    pub fn value_column(&self, i: usize) -> Option<Vec<f64>> {
        if i >= self.value_names.len() {
            return None;
        }
        self.column_at(self.sweep_names.len() + i)
    }

    pub(crate) fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Dataset {
        let mut ds = Dataset::new(
            "test",
            RunMode::OneD,
            (vec!["x".into()], vec!["m".into()]),
            (vec!["a".into(), "b".into()], vec!["V".into(), "W".into()]),
            Metadata::default(),
        );
        ds.rows = vec![vec![0.0, 1.0, 2.0], vec![1.0, 3.0, 4.0]];
        ds
    }

    #[test]
    fn test_columns() {
        let ds = sample();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.column_names(), vec!["x", "a", "b"]);
        assert_eq!(ds.column_labels(), vec!["x (m)", "a (V)", "b (W)"]);
        assert_eq!(ds.column("b"), Some(vec![2.0, 4.0]));
        assert_eq!(ds.sweep_column(0), Some(vec![0.0, 1.0]));
        assert_eq!(ds.value_column(0), Some(vec![1.0, 3.0]));
        assert_eq!(ds.value_column(2), None);
        assert_eq!(ds.column("missing"), None);
    }

    #[test]
    fn test_serde_mode_names() {
        let ds = sample();
        let json = serde_json::to_value(&ds).unwrap();
        assert_eq!(json["mode"], "1D");
        assert_eq!(json["status"], "running");

        let back: Dataset = serde_json::from_value(json).unwrap();
        assert_eq!(back.rows, ds.rows);
        assert_eq!(back.uid, ds.uid);
    }
}
