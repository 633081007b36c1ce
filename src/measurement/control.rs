//! `MeasurementControl`: runs sweep and detector functions.
//!
//! A run is configured by setting sweep functions, their points and a
//! detector, then started with [`MeasurementControl::run`]. The control
//! decides from the functions' soft/hard flags how to step through the
//! points:
//!
//! * soft 1D: set every sweep function, acquire one point, repeat;
//! * hard 1D: prepare the hardware with all points, collect chunks from
//!   `get_values` until the sweep is filled;
//! * 2D: step an outer soft sweep and run a soft or hard 1D line per value;
//! * adaptive: let an optimizer choose each point.
//!
//! Rows are `[sweep values..., (outer value,) detector values...]`.

use anyhow::{Context, Result};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::{AdaptiveSettings, Optimizer};
use crate::config::Settings;
use crate::data::{save_dataset, writer_for, Dataset, OptimizationResult, RunMode, RunStatus};
use crate::error::{AppResult, McError};
use crate::instrument::Station;
use crate::metadata::MetadataBuilder;

use super::detector::{DetectorControl, DetectorFunction};
use super::progress::ProgressReporter;
use super::sweep::{SweepControl, SweepFunction};

/// Cloneable flag that stops a running measurement between points.
#[derive(Clone, Debug, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    /// Ask the running measurement to stop after the current point.
    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// True once `abort` was called during the current run.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns the sweep and detector functions of the next run and executes it.
pub struct MeasurementControl {
    name: String,
    sweep_functions: Vec<Box<dyn SweepFunction>>,
    sweep_points: Option<Vec<Vec<f64>>>,
    sweep_function_2d: Option<Box<dyn SweepFunction>>,
    sweep_points_2d: Option<Vec<f64>>,
    detector: Option<Box<dyn DetectorFunction>>,
    adaptive: Option<AdaptiveSettings>,
    soft_avg: usize,
    verbose: bool,
    progress_interval: Duration,
    station: Option<Station>,
    storage_backend: String,
    datadir: PathBuf,
    last_folder: Option<PathBuf>,
    abort: AbortHandle,
}

impl MeasurementControl {
    /// Control with soft averaging, verbosity and storage taken from `settings`.
    #[must_use]
    pub fn new(name: impl Into<String>, settings: &Settings) -> Self {
        Self {
            name: name.into(),
            sweep_functions: Vec::new(),
            sweep_points: None,
            sweep_function_2d: None,
            sweep_points_2d: None,
            detector: None,
            adaptive: None,
            soft_avg: settings.measurement.soft_avg.max(1),
            verbose: settings.measurement.verbose,
            progress_interval: Duration::from_millis(settings.measurement.progress_interval_ms),
            station: None,
            storage_backend: settings.storage.backend.clone(),
            datadir: settings.storage.datadir.clone(),
            last_folder: None,
            abort: AbortHandle::default(),
        }
    }

    /// Instrument name of this control.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace all sweep functions with a single one.
    pub fn set_sweep_function(&mut self, sweep_function: impl SweepFunction + 'static) {
        self.sweep_functions = vec![Box::new(sweep_function)];
    }

    /// Several sweep functions set together at every point.
    pub fn set_sweep_functions(&mut self, sweep_functions: Vec<Box<dyn SweepFunction>>) {
        self.sweep_functions = sweep_functions;
    }

    /// Points for a single sweep function.
    pub fn set_sweep_points(&mut self, points: &[f64]) {
        self.sweep_points = Some(points.iter().map(|p| vec![*p]).collect());
    }

    /// One inner vector per point, one entry per sweep function.
    pub fn set_sweep_points_multi(&mut self, points: Vec<Vec<f64>>) {
        self.sweep_points = Some(points);
    }

    /// Outer sweep of a 2D run. It must be soft.
    pub fn set_sweep_function_2d(&mut self, sweep_function: impl SweepFunction + 'static) {
        self.sweep_function_2d = Some(Box::new(sweep_function));
    }

    /// Outer points of a 2D run.
    pub fn set_sweep_points_2d(&mut self, points: &[f64]) {
        self.sweep_points_2d = Some(points.to_vec());
    }

    /// Detector acquired at every point or line.
    pub fn set_detector_function(&mut self, detector: impl DetectorFunction + 'static) {
        self.detector = Some(Box::new(detector));
    }

    /// Optimizer settings for [`RunMode::Adaptive`].
    pub fn set_adaptive_function_parameters(&mut self, settings: AdaptiveSettings) {
        self.adaptive = Some(settings);
    }

    /// Number of times the whole sweep is repeated and averaged.
    pub fn set_soft_avg(&mut self, soft_avg: usize) -> AppResult<()> {
        if soft_avg == 0 {
            return Err(McError::InvalidSetup(
                "soft_avg must be at least 1".to_string(),
            ));
        }
        self.soft_avg = soft_avg;
        Ok(())
    }

    /// Configured soft-average count.
    #[must_use]
    pub fn soft_avg(&self) -> usize {
        self.soft_avg
    }

    /// Station whose snapshot is stored with each dataset.
    pub fn set_station(&mut self, station: Station) {
        self.station = Some(station);
    }

    /// Print progress lines while running.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Override the storage backend (`csv`, `json`, `none`) and directory.
    ///
    /// An unknown backend is rejected here and the previous storage is kept.
    pub fn set_storage(
        &mut self,
        backend: impl Into<String>,
        datadir: impl AsRef<Path>,
    ) -> AppResult<()> {
        let backend = backend.into();
        writer_for(&backend)?;
        self.storage_backend = backend;
        self.datadir = datadir.as_ref().to_path_buf();
        Ok(())
    }

    /// Keep datasets in memory only.
    pub fn disable_saving(&mut self) {
        self.storage_backend = "none".to_string();
    }

    /// Folder written by the last saved run.
    #[must_use]
    pub fn last_folder(&self) -> Option<&Path> {
        self.last_folder.as_deref()
    }

    /// Handle that can stop a run from another task.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    fn detector_control(&self) -> AppResult<DetectorControl> {
        let detector = self
            .detector
            .as_ref()
            .ok_or_else(|| McError::InvalidSetup("no detector function set".to_string()))?;
        if detector.value_names().is_empty() {
            return Err(McError::InvalidSetup(format!(
                "detector {} has no value names",
                detector.name()
            )));
        }
        if detector.value_units().len() != detector.value_names().len() {
            return Err(McError::InvalidSetup(format!(
                "detector {} has {} value names but {} units",
                detector.name(),
                detector.value_names().len(),
                detector.value_units().len()
            )));
        }
        Ok(detector.detector_control())
    }

    fn validate(&self, mode: RunMode) -> AppResult<()> {
        let detector_control = self.detector_control()?;
        if self.sweep_functions.is_empty() {
            return Err(McError::InvalidSetup("no sweep function set".to_string()));
        }
        let n_sweeps = self.sweep_functions.len();

        if mode == RunMode::Adaptive {
            if detector_control == DetectorControl::Hard {
                return Err(McError::InvalidSetup(
                    "adaptive measurements need a soft detector".to_string(),
                ));
            }
            if let Some(sf) = self
                .sweep_functions
                .iter()
                .find(|sf| sf.sweep_control() != SweepControl::Soft)
            {
                return Err(McError::InvalidSetup(format!(
                    "adaptive measurements need soft sweep functions, {} is hard",
                    sf.name()
                )));
            }
            let settings = self.adaptive.as_ref().ok_or_else(|| {
                McError::InvalidSetup("no adaptive function parameters set".to_string())
            })?;
            if settings.x0.len() != n_sweeps {
                return Err(McError::InvalidSetup(format!(
                    "x0 has {} entries for {} sweep functions",
                    settings.x0.len(),
                    n_sweeps
                )));
            }
            return Ok(());
        }

        let points = self
            .sweep_points
            .as_ref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| McError::InvalidSetup("no sweep points set".to_string()))?;
        if let Some(point) = points.iter().find(|p| p.len() != n_sweeps) {
            return Err(McError::InvalidSetup(format!(
                "sweep point has {} coordinates for {} sweep functions",
                point.len(),
                n_sweeps
            )));
        }

        let wanted = match detector_control {
            DetectorControl::Soft => SweepControl::Soft,
            DetectorControl::Hard => SweepControl::Hard,
        };
        if let Some(sf) = self
            .sweep_functions
            .iter()
            .find(|sf| sf.sweep_control() != wanted)
        {
            return Err(McError::InvalidSetup(format!(
                "sweep function {} is {:?} but the detector is {:?}",
                sf.name(),
                sf.sweep_control(),
                detector_control
            )));
        }

        if mode == RunMode::TwoD {
            let outer = self.sweep_function_2d.as_ref().ok_or_else(|| {
                McError::InvalidSetup("2D measurement without a second sweep function".to_string())
            })?;
            if outer.sweep_control() != SweepControl::Soft {
                return Err(McError::InvalidSetup(format!(
                    "2D sweep function {} must be soft",
                    outer.name()
                )));
            }
            if self.sweep_points_2d.as_ref().map_or(true, |p| p.is_empty()) {
                return Err(McError::InvalidSetup("no 2D sweep points set".to_string()));
            }
        }
        Ok(())
    }

    fn new_dataset(&self, label: &str, mode: RunMode, control: DetectorControl) -> Dataset {
        let mut sweep_names: Vec<String> = self
            .sweep_functions
            .iter()
            .map(|sf| sf.parameter_name().to_string())
            .collect();
        let mut sweep_units: Vec<String> =
            self.sweep_functions.iter().map(|sf| sf.unit().to_string()).collect();
        let mut described: Vec<&dyn SweepFunction> =
            self.sweep_functions.iter().map(|sf| sf.as_ref()).collect();
        if mode == RunMode::TwoD {
            if let Some(outer) = &self.sweep_function_2d {
                sweep_names.push(outer.parameter_name().to_string());
                sweep_units.push(outer.unit().to_string());
                described.push(outer.as_ref());
            }
        }

        let (value_names, value_units, detector_name) = match &self.detector {
            Some(d) => (
                d.value_names().to_vec(),
                d.value_units().to_vec(),
                d.name().to_string(),
            ),
            None => (Vec::new(), Vec::new(), String::new()),
        };

        let control = match control {
            DetectorControl::Soft => "soft",
            DetectorControl::Hard => "hard",
        };
        let mut builder = MetadataBuilder::new()
            .experiment_name(label)
            .description(&format!("measured by {}", self.name))
            .mode(&format!("{} {}", mode, control))
            .detector_function(&detector_name)
            .parameter("soft_avg", json!(self.soft_avg));
        for sf in described {
            builder = builder.sweep_function(&format!(
                "{}: {} ({})",
                sf.name(),
                sf.parameter_name(),
                sf.unit()
            ));
        }
        if let Some(station) = &self.station {
            builder = builder.station(station.snapshot());
        }
        if mode == RunMode::Adaptive {
            if let Some(settings) = &self.adaptive {
                if let Ok(value) = serde_json::to_value(settings) {
                    builder = builder.parameter("adaptive", value);
                }
            }
        }

        Dataset::new(
            label,
            mode,
            (sweep_names, sweep_units),
            (value_names, value_units),
            builder.build(),
        )
    }

    /// Run a measurement and return its dataset.
    ///
    /// Setup problems are reported as [`McError::InvalidSetup`] before any
    /// instrument is touched. An aborted run still returns the rows acquired
    /// so far, with status [`RunStatus::Aborted`]. A dataset that cannot be
    /// written to disk is still returned; the failure is logged and
    /// [`MeasurementControl::last_folder`] stays empty.
    pub async fn run(&mut self, label: &str, mode: RunMode) -> Result<Dataset> {
        self.validate(mode)?;
        let control = self.detector_control()?;
        self.abort.reset();

        let mut dataset = self.new_dataset(label, mode, control);
        dataset.metadata.validate()?;
        tracing::info!(
            label,
            %mode,
            uid = %dataset.uid,
            soft_avg = self.soft_avg,
            "starting measurement"
        );

        let points = self.sweep_points.clone().unwrap_or_default();
        let points_2d = self.sweep_points_2d.clone().unwrap_or_default();
        let adaptive = self.adaptive.clone();
        let detector = self
            .detector
            .as_mut()
            .ok_or_else(|| McError::InvalidSetup("no detector function set".to_string()))?;
        let n_values = detector.value_names().len();

        let mut run = Run {
            sweeps: &mut self.sweep_functions,
            outer: self.sweep_function_2d.as_mut(),
            detector,
            control,
            abort: self.abort.clone(),
            progress: ProgressReporter::new(self.verbose, self.progress_interval),
            n_values,
            done: 0,
            total: 0,
        };

        let outcome = match (mode, adaptive.as_ref()) {
            (RunMode::Adaptive, Some(settings)) => run.run_adaptive(settings, &mut dataset).await,
            (RunMode::Adaptive, None) => Err(McError::InvalidSetup(
                "no adaptive function parameters set".to_string(),
            )
            .into()),
            _ => {
                run.run_averaged(mode, &points, &points_2d, self.soft_avg, &mut dataset)
                    .await
            }
        };
        let cleanup = run.finish_all().await;

        let status = match (outcome, cleanup) {
            (Ok(status), Ok(())) => status,
            (Ok(_), Err(e)) => return Err(e),
            (Err(e), cleanup) => {
                if let Err(cleanup_err) = cleanup {
                    tracing::warn!(error = %cleanup_err, "cleanup after failed measurement also failed");
                }
                tracing::error!(label, error = %e, "measurement failed");
                return Err(e);
            }
        };
        dataset.finish(status);
        match status {
            RunStatus::Aborted => tracing::warn!(label, rows = dataset.len(), "measurement aborted"),
            _ => tracing::info!(label, rows = dataset.len(), "measurement finished"),
        }

        if let Err(e) = self.save(&dataset).await {
            tracing::error!(label, uid = %dataset.uid, error = ?e, "failed to save dataset");
        }
        Ok(dataset)
    }

    async fn save(&mut self, dataset: &Dataset) -> Result<()> {
        self.last_folder = None;
        let Some(mut writer) = writer_for(&self.storage_backend)? else {
            return Ok(());
        };
        let folder = save_dataset(writer.as_mut(), &self.datadir, dataset)
            .await
            .with_context(|| format!("Failed to save dataset '{}'", dataset.name))?;
        tracing::info!(folder = %folder.display(), "dataset saved");
        self.last_folder = Some(folder);
        Ok(())
    }
}

/// Borrowed state of one running measurement.
struct Run<'a> {
    sweeps: &'a mut Vec<Box<dyn SweepFunction>>,
    outer: Option<&'a mut Box<dyn SweepFunction>>,
    detector: &'a mut Box<dyn DetectorFunction>,
    control: DetectorControl,
    abort: AbortHandle,
    progress: ProgressReporter,
    n_values: usize,
    done: usize,
    total: usize,
}

impl Run<'_> {
    fn tick(&mut self, n: usize) {
        self.done += n;
        self.progress.update(self.done, self.total);
    }

    fn check_width(&self, got: usize) -> AppResult<()> {
        if got != self.n_values {
            return Err(McError::DetectorShape {
                detector: self.detector.name().to_string(),
                expected: self.n_values,
                got,
            });
        }
        Ok(())
    }

    async fn prepare(&mut self, mode: RunMode, points: &[Vec<f64>], points_2d: &[f64]) -> Result<()> {
        for (i, sweep) in self.sweeps.iter_mut().enumerate() {
            let column: Vec<f64> = points.iter().filter_map(|p| p.get(i).copied()).collect();
            sweep
                .prepare(&column)
                .await
                .with_context(|| format!("Failed to prepare sweep function {}", sweep.name()))?;
        }
        let detector_points = match (mode, self.outer.as_mut()) {
            (RunMode::TwoD, Some(outer)) => {
                outer
                    .prepare(points_2d)
                    .await
                    .with_context(|| format!("Failed to prepare sweep function {}", outer.name()))?;
                if self.control == DetectorControl::Soft {
                    let mut grid = Vec::with_capacity(points.len() * points_2d.len());
                    for y in points_2d {
                        for p in points {
                            let mut row = p.clone();
                            row.push(*y);
                            grid.push(row);
                        }
                    }
                    grid
                } else {
                    points.to_vec()
                }
            }
            _ => points.to_vec(),
        };
        self.detector
            .prepare(&detector_points)
            .await
            .with_context(|| format!("Failed to prepare detector {}", self.detector.name()))?;
        Ok(())
    }

    async fn run_averaged(
        &mut self,
        mode: RunMode,
        points: &[Vec<f64>],
        points_2d: &[f64],
        soft_avg: usize,
        dataset: &mut Dataset,
    ) -> Result<RunStatus> {
        self.prepare(mode, points, points_2d).await?;

        let n_outer = if mode == RunMode::TwoD { points_2d.len() } else { 1 };
        let per_iteration = points.len() * n_outer;
        self.total = per_iteration * soft_avg;
        if mode == RunMode::TwoD {
            dataset.shape_2d = Some((points.len(), points_2d.len()));
        }
        let n_sweep_columns = dataset.sweep_names.len();
        self.progress.update(0, self.total);

        for iteration in 0..soft_avg {
            let mut rows = Vec::with_capacity(per_iteration);
            let completed = if mode == RunMode::TwoD {
                self.measure_2d(points, points_2d, &mut rows).await?
            } else {
                self.measure_line(points, None, &mut rows).await?
            };

            if !completed {
                if iteration == 0 {
                    dataset.rows = rows;
                }
                return Ok(RunStatus::Aborted);
            }

            if iteration == 0 {
                dataset.rows = rows;
            } else {
                let weight = 1.0 / (iteration + 1) as f64;
                for (acc, new) in dataset.rows.iter_mut().zip(&rows) {
                    for (a, n) in acc.iter_mut().zip(new).skip(n_sweep_columns) {
                        *a += (n - *a) * weight;
                    }
                }
            }
            dataset.soft_iterations = iteration + 1;
            tracing::debug!(iteration = iteration + 1, soft_avg, "soft average iteration done");
        }
        Ok(RunStatus::Completed)
    }

    async fn measure_2d(
        &mut self,
        points: &[Vec<f64>],
        points_2d: &[f64],
        rows: &mut Vec<Vec<f64>>,
    ) -> Result<bool> {
        for y in points_2d {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            if let Some(outer) = self.outer.as_mut() {
                outer
                    .set_parameter(*y)
                    .await
                    .with_context(|| format!("Failed to set {} to {}", outer.parameter_name(), y))?;
            }
            if !self.measure_line(points, Some(*y), rows).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// One pass over `points`; returns false when aborted.
    async fn measure_line(
        &mut self,
        points: &[Vec<f64>],
        outer: Option<f64>,
        rows: &mut Vec<Vec<f64>>,
    ) -> Result<bool> {
        match self.control {
            DetectorControl::Soft => self.soft_line(points, outer, rows).await,
            DetectorControl::Hard => self.hard_line(points, outer, rows).await,
        }
    }

    async fn set_sweeps(&mut self, point: &[f64]) -> Result<()> {
        for (sweep, value) in self.sweeps.iter_mut().zip(point) {
            sweep
                .set_parameter(*value)
                .await
                .with_context(|| format!("Failed to set {} to {}", sweep.parameter_name(), value))?;
        }
        Ok(())
    }

    async fn acquire(&mut self) -> Result<Vec<f64>> {
        let values = self
            .detector
            .acquire_data_point()
            .await
            .with_context(|| format!("Detector {} failed", self.detector.name()))?;
        self.check_width(values.len())?;
        Ok(values)
    }

    async fn soft_line(
        &mut self,
        points: &[Vec<f64>],
        outer: Option<f64>,
        rows: &mut Vec<Vec<f64>>,
    ) -> Result<bool> {
        for point in points {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            self.set_sweeps(point).await?;
            let values = self.acquire().await?;

            let mut row = point.clone();
            row.extend(outer);
            row.extend(values);
            rows.push(row);
            self.tick(1);
        }
        Ok(true)
    }

    async fn hard_line(
        &mut self,
        points: &[Vec<f64>],
        outer: Option<f64>,
        rows: &mut Vec<Vec<f64>>,
    ) -> Result<bool> {
        let mut filled = 0;
        while filled < points.len() {
            if self.abort.is_aborted() {
                return Ok(false);
            }
            let chunk = self
                .detector
                .get_values()
                .await
                .with_context(|| format!("Detector {} failed", self.detector.name()))?;
            self.check_width(chunk.len())?;

            let chunk_len = chunk.first().map_or(0, Vec::len);
            if chunk_len == 0 || chunk.iter().any(|c| c.len() != chunk_len) {
                return Err(McError::DetectorShape {
                    detector: self.detector.name().to_string(),
                    expected: points.len() - filled,
                    got: chunk_len,
                }
                .into());
            }
            let take = chunk_len.min(points.len() - filled);
            if take < chunk_len {
                tracing::warn!(
                    extra = chunk_len - take,
                    "detector returned more points than were swept, dropping the rest"
                );
            }

            for j in 0..take {
                let mut row = points[filled + j].clone();
                row.extend(outer);
                row.extend(chunk.iter().map(|channel| channel[j]));
                rows.push(row);
            }
            filled += take;
            self.tick(take);
        }
        Ok(true)
    }

    async fn run_adaptive(
        &mut self,
        settings: &AdaptiveSettings,
        dataset: &mut Dataset,
    ) -> Result<RunStatus> {
        let mut optimizer: Box<dyn Optimizer> = settings.build_optimizer()?;
        self.prepare(RunMode::Adaptive, &[settings.x0.clone()], &[])
            .await?;
        self.total = settings.max_evaluations;
        self.progress.update(0, self.total);

        let status = loop {
            if self.abort.is_aborted() {
                break RunStatus::Aborted;
            }
            let Some(x) = optimizer.ask() else {
                break RunStatus::Completed;
            };
            self.set_sweeps(&x).await?;
            let values = self.acquire().await?;
            let objective = if settings.minimize { values[0] } else { -values[0] };
            optimizer.tell(objective)?;

            let mut row = x;
            row.extend(values);
            dataset.rows.push(row);
            self.tick(1);
        };
        if status == RunStatus::Completed && self.done < self.total {
            self.total = self.done;
            self.progress.update(self.done, self.total);
        }

        dataset.optimization = optimizer.best().map(|(x, f)| OptimizationResult {
            x_opt: x.to_vec(),
            f_opt: if settings.minimize { f } else { -f },
            evaluations: optimizer.evaluations(),
            converged: optimizer.is_converged(),
        });
        if let Some(result) = &dataset.optimization {
            tracing::info!(
                x_opt = ?result.x_opt,
                f_opt = result.f_opt,
                evaluations = result.evaluations,
                converged = result.converged,
                "adaptive measurement done"
            );
        }
        Ok(status)
    }

    /// Finish every function, reporting the first failure.
    async fn finish_all(&mut self) -> Result<()> {
        let mut first_err: Option<anyhow::Error> = None;
        let mut record = |name: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::warn!(function = name, error = %e, "finish failed");
                if first_err.is_none() {
                    first_err = Some(e.context(format!("Failed to finish {}", name)));
                }
            }
        };

        for sweep in self.sweeps.iter_mut() {
            let result = sweep.finish().await;
            record(sweep.name(), result);
        }
        if let Some(outer) = self.outer.as_mut() {
            let result = outer.finish().await;
            record(outer.name(), result);
        }
        let result = self.detector.finish().await;
        record(self.detector.name(), result);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
