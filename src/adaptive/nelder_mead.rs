//! Nelder-Mead simplex minimizer with an ask/tell interface.
//!
//! The optimizer never calls the objective itself. `ask` hands out the next
//! point to evaluate and `tell` feeds back its value, so the caller (usually
//! `MeasurementControl`) owns the slow part: setting instruments and
//! acquiring data.

use crate::error::{AppResult, McError};

use super::Optimizer;

const RHO: f64 = 1.0;
const CHI: f64 = 2.0;
const PSI: f64 = 0.5;
const SIGMA: f64 = 0.5;

#[derive(Clone, Debug)]
enum Phase {
    Initial { index: usize },
    Reflect,
    Expand { reflected: Vec<f64>, f_reflected: f64 },
    ContractOutside { f_reflected: f64 },
    ContractInside,
    Shrink { index: usize },
    Done,
}

/// Downhill simplex minimizer driven through [`Optimizer`].
#[derive(Clone, Debug)]
pub struct NelderMead {
    simplex: Vec<Vec<f64>>,
    values: Vec<f64>,
    phase: Phase,
    pending: Option<Vec<f64>>,
    evaluations: usize,
    max_evaluations: usize,
    xatol: f64,
    fatol: f64,
    best: Option<(Vec<f64>, f64)>,
    converged: bool,
}

impl NelderMead {
    /// Simplex of `x0` plus `x0 + step[i]·e_i` for every dimension.
    pub fn new(
        x0: &[f64],
        initial_step: &[f64],
        xatol: f64,
        fatol: f64,
        max_evaluations: usize,
    ) -> AppResult<Self> {
        if x0.is_empty() {
            return Err(McError::Optimizer("x0 must not be empty".to_string()));
        }
        if initial_step.len() != x0.len() {
            return Err(McError::Optimizer(format!(
                "initial_step has {} entries, x0 has {}",
                initial_step.len(),
                x0.len()
            )));
        }
        if initial_step.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(McError::Optimizer(
                "initial_step entries must be finite and non-zero".to_string(),
            ));
        }
        if max_evaluations == 0 {
            return Err(McError::Optimizer(
                "max_evaluations must be at least 1".to_string(),
            ));
        }

        let mut simplex = vec![x0.to_vec()];
        for (i, step) in initial_step.iter().enumerate() {
            let mut vertex = x0.to_vec();
            vertex[i] += step;
            simplex.push(vertex);
        }
        let values = vec![f64::INFINITY; simplex.len()];

        Ok(Self {
            simplex,
            values,
            phase: Phase::Initial { index: 0 },
            pending: None,
            evaluations: 0,
            max_evaluations,
            xatol,
            fatol,
            best: None,
            converged: false,
        })
    }

    fn dim(&self) -> usize {
        self.simplex.len() - 1
    }

    fn sort_simplex(&mut self) {
        let mut order: Vec<usize> = (0..self.simplex.len()).collect();
        order.sort_by(|a, b| self.values[*a].total_cmp(&self.values[*b]));
        self.simplex = order.iter().map(|i| self.simplex[*i].clone()).collect();
        self.values = order.iter().map(|i| self.values[*i]).collect();
    }

    fn has_converged(&self) -> bool {
        let best = &self.simplex[0];
        let x_spread = self.simplex[1..]
            .iter()
            .flat_map(|v| v.iter().zip(best).map(|(a, b)| (a - b).abs()))
            .fold(0.0_f64, f64::max);
        let f_spread = self.values[1..]
            .iter()
            .map(|f| (f - self.values[0]).abs())
            .fold(0.0_f64, |acc, d| if d.is_nan() { f64::INFINITY } else { acc.max(d) });
        x_spread <= self.xatol && f_spread <= self.fatol
    }

    /// Centroid of every vertex but the worst.
    fn centroid(&self) -> Vec<f64> {
        let n = self.dim();
        let mut c = vec![0.0; n];
        for vertex in &self.simplex[..n] {
            for (ci, xi) in c.iter_mut().zip(vertex) {
                *ci += xi / n as f64;
            }
        }
        c
    }

    /// `c + coeff·(c − worst)`
    fn along_worst(&self, coeff: f64) -> Vec<f64> {
        let c = self.centroid();
        let worst = &self.simplex[self.dim()];
        c.iter().zip(worst).map(|(ci, wi)| ci + coeff * (ci - wi)).collect()
    }

    fn replace_worst(&mut self, x: Vec<f64>, f: f64) {
        let n = self.dim();
        self.simplex[n] = x;
        self.values[n] = f;
    }

    fn next_point(&mut self) -> Option<Vec<f64>> {
        if matches!(self.phase, Phase::Reflect) {
            self.sort_simplex();
            if self.has_converged() {
                self.converged = true;
                self.phase = Phase::Done;
                tracing::debug!(evaluations = self.evaluations, "nelder-mead converged");
                return None;
            }
        }
        match &self.phase {
            Phase::Done => None,
            Phase::Initial { index } => Some(self.simplex[*index].clone()),
            Phase::Reflect => Some(self.along_worst(RHO)),
            Phase::Expand { .. } => Some(self.along_worst(RHO * CHI)),
            Phase::ContractOutside { .. } => Some(self.along_worst(PSI * RHO)),
            Phase::ContractInside => Some(self.along_worst(-PSI)),
            Phase::Shrink { index } => {
                let best = &self.simplex[0];
                Some(
                    self.simplex[*index]
                        .iter()
                        .zip(best)
                        .map(|(vi, bi)| bi + SIGMA * (vi - bi))
                        .collect(),
                )
            }
        }
    }

    /// Minimize `f` directly, for objectives that are cheap to call.
    pub fn minimize<F>(mut self, mut f: F) -> AppResult<(Vec<f64>, f64)>
    where
        F: FnMut(&[f64]) -> f64,
    {
        while let Some(x) = self.ask() {
            let value = f(&x);
            self.tell(value)?;
        }
        self.best()
            .map(|(x, fx)| (x.to_vec(), fx))
            .ok_or_else(|| McError::Optimizer("no point was evaluated".to_string()))
    }
}

impl Optimizer for NelderMead {
    fn ask(&mut self) -> Option<Vec<f64>> {
        if let Some(pending) = &self.pending {
            return Some(pending.clone());
        }
        if self.evaluations >= self.max_evaluations {
            self.phase = Phase::Done;
        }
        let point = self.next_point()?;
        self.pending = Some(point.clone());
        Some(point)
    }

    fn tell(&mut self, value: f64) -> AppResult<()> {
        let x = self
            .pending
            .take()
            .ok_or_else(|| McError::Optimizer("tell called without a pending point".to_string()))?;
        let f = if value.is_finite() { value } else { f64::INFINITY };
        self.evaluations += 1;
        if self.best.as_ref().map_or(true, |(_, fb)| f < *fb) {
            self.best = Some((x.clone(), f));
        }

        let n = self.dim();
        let phase = std::mem::replace(&mut self.phase, Phase::Reflect);
        self.phase = match phase {
            Phase::Initial { index } => {
                self.values[index] = f;
                if index < n {
                    Phase::Initial { index: index + 1 }
                } else {
                    Phase::Reflect
                }
            }
            Phase::Reflect => {
                if f < self.values[0] {
                    Phase::Expand {
                        reflected: x,
                        f_reflected: f,
                    }
                } else if f < self.values[n - 1] {
                    self.replace_worst(x, f);
                    Phase::Reflect
                } else if f < self.values[n] {
                    Phase::ContractOutside { f_reflected: f }
                } else {
                    Phase::ContractInside
                }
            }
            Phase::Expand {
                reflected,
                f_reflected,
            } => {
                if f < f_reflected {
                    self.replace_worst(x, f);
                } else {
                    self.replace_worst(reflected, f_reflected);
                }
                Phase::Reflect
            }
            Phase::ContractOutside { f_reflected } => {
                if f <= f_reflected {
                    self.replace_worst(x, f);
                    Phase::Reflect
                } else {
                    Phase::Shrink { index: 1 }
                }
            }
            Phase::ContractInside => {
                if f < self.values[n] {
                    self.replace_worst(x, f);
                    Phase::Reflect
                } else {
                    Phase::Shrink { index: 1 }
                }
            }
            Phase::Shrink { index } => {
                self.simplex[index] = x;
                self.values[index] = f;
                if index < n {
                    Phase::Shrink { index: index + 1 }
                } else {
                    Phase::Reflect
                }
            }
            Phase::Done => Phase::Done,
        };
        Ok(())
    }

    fn best(&self) -> Option<(&[f64], f64)> {
        self.best.as_ref().map(|(x, f)| (x.as_slice(), *f))
    }

    fn evaluations(&self) -> usize {
        self.evaluations
    }

    fn is_converged(&self) -> bool {
        self.converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paraboloid(x: &[f64]) -> f64 {
        x.iter().map(|v| v * v).sum()
    }

    #[test]
    fn test_finds_minimum_of_paraboloid() {
        let nm = NelderMead::new(&[1.0, -2.0, 0.5], &[0.5, 0.5, 0.5], 1e-6, 1e-9, 2000).unwrap();
        let (x, f) = nm.minimize(paraboloid).unwrap();
        assert!(f < 1e-8, "f = {}", f);
        assert!(x.iter().all(|v| v.abs() < 1e-3), "x = {:?}", x);
    }

    #[test]
    fn test_rosenbrock_2d() {
        let rosen = |x: &[f64]| (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2);
        let nm = NelderMead::new(&[-1.2, 1.0], &[0.1, 0.1], 1e-8, 1e-10, 5000).unwrap();
        let (x, _) = nm.minimize(rosen).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-3 && (x[1] - 1.0).abs() < 1e-3, "x = {:?}", x);
    }

    #[test]
    fn test_respects_evaluation_budget() {
        let mut nm = NelderMead::new(&[3.0, 3.0], &[1.0, 1.0], 1e-12, 1e-12, 7).unwrap();
        while let Some(x) = nm.ask() {
            nm.tell(paraboloid(&x)).unwrap();
        }
        assert_eq!(nm.evaluations(), 7);
        assert!(!nm.is_converged());
        assert!(nm.ask().is_none());
    }

    #[test]
    fn test_converges_and_stops() {
        let mut nm = NelderMead::new(&[0.3], &[0.1], 1e-4, 1e-4, 1000).unwrap();
        while let Some(x) = nm.ask() {
            nm.tell(paraboloid(&x)).unwrap();
        }
        assert!(nm.is_converged());
        assert!(nm.evaluations() < 1000);
        let (x, _) = nm.best().unwrap();
        assert!(x[0].abs() < 1e-2);
    }

    #[test]
    fn test_first_points_are_initial_simplex() {
        let mut nm = NelderMead::new(&[1.0, 2.0], &[0.5, -0.25], 1e-4, 1e-4, 100).unwrap();
        let mut points = Vec::new();
        for _ in 0..3 {
            let x = nm.ask().unwrap();
            nm.tell(paraboloid(&x)).unwrap();
            points.push(x);
        }
        assert_eq!(points, vec![vec![1.0, 2.0], vec![1.5, 2.0], vec![1.0, 1.75]]);
    }

    /// Simplex `[0]` (f = 1) and `[1]` (f = 3), then a reflection to `[-1]`
    /// that lands between best and worst.
    fn outside_contraction() -> NelderMead {
        let mut nm = NelderMead::new(&[0.0], &[1.0], 1e-8, 1e-8, 100).unwrap();
        for value in [1.0, 3.0] {
            nm.ask().unwrap();
            nm.tell(value).unwrap();
        }
        assert_eq!(nm.ask(), Some(vec![-1.0]));
        nm.tell(2.0).unwrap();
        assert_eq!(nm.ask(), Some(vec![-0.5]));
        nm
    }

    #[test]
    fn test_outside_contraction_accepted() {
        let mut nm = outside_contraction();
        nm.tell(1.5).unwrap();
        // [-0.5] replaced the worst vertex, so the next reflection mirrors it.
        assert_eq!(nm.ask(), Some(vec![0.5]));
    }

    #[test]
    fn test_outside_contraction_rejected_shrinks() {
        let mut nm = outside_contraction();
        nm.tell(2.5).unwrap();
        // Shrink moves the old worst vertex [1] halfway to the best.
        assert_eq!(nm.ask(), Some(vec![0.5]));
        nm.tell(0.5).unwrap();
        assert_eq!(nm.best().unwrap().0, &[0.5][..]);
    }

    #[test]
    fn test_ask_is_idempotent_until_tell() {
        let mut nm = NelderMead::new(&[1.0], &[0.1], 1e-4, 1e-4, 10).unwrap();
        assert_eq!(nm.ask(), nm.ask());
        assert_eq!(nm.evaluations(), 0);
    }

    #[test]
    fn test_tell_without_pending_point() {
        let mut nm = NelderMead::new(&[1.0], &[0.1], 1e-4, 1e-4, 10).unwrap();
        assert!(matches!(nm.tell(1.0), Err(McError::Optimizer(_))));
    }

    #[test]
    fn test_nan_treated_as_worst() {
        let mut nm = NelderMead::new(&[1.0], &[0.5], 1e-6, 1e-6, 200).unwrap();
        while let Some(x) = nm.ask() {
            let value = if x[0] > 1.2 { f64::NAN } else { (x[0] - 0.2).powi(2) };
            nm.tell(value).unwrap();
        }
        let (x, f) = nm.best().unwrap();
        assert!(f.is_finite());
        assert!((x[0] - 0.2).abs() < 1e-2, "x = {:?}", x);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(NelderMead::new(&[], &[], 1e-4, 1e-4, 10).is_err());
        assert!(NelderMead::new(&[1.0], &[0.0], 1e-4, 1e-4, 10).is_err());
        assert!(NelderMead::new(&[1.0, 2.0], &[0.1], 1e-4, 1e-4, 10).is_err());
        assert!(NelderMead::new(&[1.0], &[0.1], 1e-4, 1e-4, 0).is_err());
    }
}
