//! Integration tests for MeasurementControl runs, abort handling and saving.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use cqed_mc::adaptive::AdaptiveSettings;
use cqed_mc::config::Settings;
use cqed_mc::data::{Dataset, RunMode, RunStatus};
use cqed_mc::error::McError;
use cqed_mc::instrument::{DummyParHolder, Station};
use cqed_mc::measurement::{
    AbortHandle, DetectorControl, DetectorFunction, DummyDetectorHard, DummyDetectorSoft,
    MeasurementControl, NoneSweep, ParameterDetector, ParameterSweep, SweepFunction,
};

fn quiet_settings() -> Settings {
    let mut settings = Settings::default();
    settings.measurement.verbose = false;
    settings.storage.backend = "none".to_string();
    settings
}

fn arange(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64).collect()
}

/// Soft detector returning the number of previous acquisitions.
struct Counter {
    names: Vec<String>,
    units: Vec<String>,
    calls: usize,
    abort_after: Option<(usize, AbortHandle)>,
    fail_at: Option<usize>,
    width: usize,
    finished: Arc<AtomicBool>,
}

impl Counter {
    fn new() -> Self {
        Self {
            names: vec!["count".to_string()],
            units: vec!["".to_string()],
            calls: 0,
            abort_after: None,
            fail_at: None,
            width: 1,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl DetectorFunction for Counter {
    fn name(&self) -> &str {
        "counter"
    }

    fn value_names(&self) -> &[String] {
        &self.names
    }

    fn value_units(&self) -> &[String] {
        &self.units
    }

    fn detector_control(&self) -> DetectorControl {
        DetectorControl::Soft
    }

    async fn acquire_data_point(&mut self) -> Result<Vec<f64>> {
        if self.fail_at == Some(self.calls) {
            return Err(anyhow!("lost connection"));
        }
        let value = self.calls as f64;
        self.calls += 1;
        if let Some((n, handle)) = &self.abort_after {
            if self.calls >= *n {
                handle.abort();
            }
        }
        Ok(vec![value; self.width])
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Soft sweep counting its `finish` calls.
struct TrackedSweep {
    finishes: Arc<AtomicUsize>,
}

#[async_trait]
impl SweepFunction for TrackedSweep {
    fn name(&self) -> &str {
        "tracked"
    }

    fn parameter_name(&self) -> &str {
        "x"
    }

    fn unit(&self) -> &str {
        "V"
    }

    fn sweep_control(&self) -> cqed_mc::measurement::SweepControl {
        cqed_mc::measurement::SweepControl::Soft
    }

    async fn set_parameter(&mut self, _value: f64) -> Result<()> {
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn shape_error(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|e| matches!(e.downcast_ref::<McError>(), Some(McError::DetectorShape { .. })))
}

fn invalid_setup(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<McError>(), Some(McError::InvalidSetup(_)))
}

#[tokio::test]
async fn soft_1d_follows_dummy_detector() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(10));
    mc.set_detector_function(DummyDetectorSoft::new());

    let ds = mc.run("dummy_soft", RunMode::OneD).await.unwrap();
    assert_eq!(ds.len(), 10);
    assert_eq!(ds.column_labels()[0], "pts (arb. unit)");
    for (i, row) in ds.rows.iter().enumerate() {
        let x = i as f64;
        assert_eq!(row[0], x);
        assert!((row[1] - (x / PI).sin()).abs() < 1e-12);
        assert!((row[2] - (x / PI).cos()).abs() < 1e-12);
    }
    assert!(ds.finished.is_some());
    assert_eq!(ds.metadata.experiment_name, "dummy_soft");
}

#[tokio::test]
async fn hard_1d_matches_soft_1d() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::hard());
    mc.set_sweep_points(&arange(10));
    mc.set_detector_function(DummyDetectorHard::new());
    let hard = mc.run("dummy_hard", RunMode::OneD).await.unwrap();

    mc.set_sweep_function(NoneSweep::new());
    mc.set_detector_function(DummyDetectorSoft::new());
    let soft = mc.run("dummy_soft", RunMode::OneD).await.unwrap();

    for (h, s) in hard.rows.iter().zip(&soft.rows) {
        for (a, b) in h.iter().zip(s) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}

#[tokio::test]
async fn soft_2d_is_x_fastest() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(3));
    mc.set_sweep_function_2d(NoneSweep::new().with_parameter_name("pts_2d", "arb. unit"));
    mc.set_sweep_points_2d(&[10.0, 20.0]);
    mc.set_detector_function(Counter::new());

    let ds = mc.run("soft_2d", RunMode::TwoD).await.unwrap();
    assert_eq!(ds.shape_2d, Some((3, 2)));
    assert_eq!(ds.column_names(), vec!["pts", "pts_2d", "count"]);
    assert_eq!(ds.sweep_column(0).unwrap(), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    assert_eq!(ds.sweep_column(1).unwrap(), vec![10.0, 10.0, 10.0, 20.0, 20.0, 20.0]);
    assert_eq!(ds.value_column(0).unwrap(), arange(6));
}

#[tokio::test]
async fn hard_2d_repeats_inner_line() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::hard());
    mc.set_sweep_points(&arange(4));
    mc.set_sweep_function_2d(NoneSweep::new().with_parameter_name("pts_2d", "arb. unit"));
    mc.set_sweep_points_2d(&arange(3));
    mc.set_detector_function(DummyDetectorHard::new().with_chunk_size(3));

    let ds = mc.run("hard_2d", RunMode::TwoD).await.unwrap();
    assert_eq!(ds.len(), 12);
    assert_eq!(ds.shape_2d, Some((4, 3)));
    let sines = ds.value_column(0).unwrap();
    for (i, v) in sines.iter().enumerate() {
        let x = (i % 4) as f64;
        assert!((v - (x / PI).sin()).abs() < 1e-12, "row {}", i);
    }
}

#[tokio::test]
async fn soft_avg_keeps_running_mean() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(3));
    mc.set_detector_function(Counter::new());
    mc.set_soft_avg(3).unwrap();

    // Iterations see 0..3, 3..6, 6..9
    let ds = mc.run("averaged", RunMode::OneD).await.unwrap();
    assert_eq!(ds.soft_iterations, 3);
    assert_eq!(ds.len(), 3);
    let values = ds.value_column(0).unwrap();
    for (v, expected) in values.iter().zip([3.0, 4.0, 5.0]) {
        assert!((v - expected).abs() < 1e-12);
    }
    assert_eq!(ds.sweep_column(0).unwrap(), arange(3));
}

#[tokio::test]
async fn soft_avg_reduces_noise() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::hard());
    mc.set_sweep_points(&arange(20));
    mc.set_detector_function(DummyDetectorHard::new().with_noise(0.4));
    mc.set_soft_avg(50).unwrap();

    let ds = mc.run("noisy", RunMode::OneD).await.unwrap();
    for (i, v) in ds.value_column(0).unwrap().iter().enumerate() {
        // Uniform noise of width 0.4 averaged 50 times
        assert!((v - (i as f64 / PI).sin()).abs() < 0.1);
    }
}

#[tokio::test]
async fn abort_returns_partial_dataset() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    let mut detector = Counter::new();
    let finished = detector.finished.clone();
    detector.abort_after = Some((4, mc.abort_handle()));
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(10));
    mc.set_detector_function(detector);

    let ds = mc.run("aborted", RunMode::OneD).await.unwrap();
    assert_eq!(ds.status, RunStatus::Aborted);
    assert_eq!(ds.len(), 4);
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn abort_during_later_iteration_keeps_average() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    let mut detector = Counter::new();
    detector.abort_after = Some((5, mc.abort_handle()));
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(3));
    mc.set_detector_function(detector);
    mc.set_soft_avg(4).unwrap();

    let ds = mc.run("aborted_avg", RunMode::OneD).await.unwrap();
    assert_eq!(ds.status, RunStatus::Aborted);
    assert_eq!(ds.soft_iterations, 1);
    assert_eq!(ds.value_column(0).unwrap(), vec![0.0, 1.0, 2.0]);
}

#[tokio::test]
async fn finish_runs_after_detector_error() {
    let finishes = Arc::new(AtomicUsize::new(0));
    let mut detector = Counter::new();
    detector.fail_at = Some(2);
    let detector_finished = detector.finished.clone();

    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(TrackedSweep {
        finishes: finishes.clone(),
    });
    mc.set_sweep_points(&arange(5));
    mc.set_detector_function(detector);

    let err = mc.run("failing", RunMode::OneD).await.unwrap_err();
    assert!(format!("{:#}", err).contains("lost connection"));
    assert_eq!(finishes.load(Ordering::SeqCst), 1);
    assert!(detector_finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn wrong_value_count_is_shape_error() {
    let mut detector = Counter::new();
    detector.width = 2;
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(3));
    mc.set_detector_function(detector);

    let err = mc.run("too_wide", RunMode::OneD).await.unwrap_err();
    assert!(shape_error(&err));
}

#[tokio::test]
async fn invalid_setups_are_rejected_before_running() {
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_detector_function(DummyDetectorSoft::new());
    let err = mc.run("no_sweep", RunMode::OneD).await.unwrap_err();
    assert!(invalid_setup(&err));

    mc.set_sweep_function(NoneSweep::new());
    let err = mc.run("no_points", RunMode::OneD).await.unwrap_err();
    assert!(invalid_setup(&err));

    mc.set_sweep_points_multi(vec![vec![0.0, 1.0]]);
    let err = mc.run("too_wide", RunMode::OneD).await.unwrap_err();
    assert!(invalid_setup(&err));

    mc.set_sweep_points(&arange(3));
    let err = mc.run("no_outer", RunMode::TwoD).await.unwrap_err();
    assert!(invalid_setup(&err));

    let err = mc.run("no_adaptive", RunMode::Adaptive).await.unwrap_err();
    assert!(invalid_setup(&err));

    mc.set_adaptive_function_parameters(AdaptiveSettings::nelder_mead(
        vec![0.0, 0.0],
        vec![1.0, 1.0],
    ));
    let err = mc.run("x0_mismatch", RunMode::Adaptive).await.unwrap_err();
    assert!(invalid_setup(&err));

    mc.set_sweep_function(NoneSweep::hard());
    mc.set_detector_function(DummyDetectorHard::new());
    mc.set_adaptive_function_parameters(AdaptiveSettings::nelder_mead(vec![0.0], vec![1.0]));
    let err = mc.run("hard_adaptive", RunMode::Adaptive).await.unwrap_err();
    assert!(invalid_setup(&err));
}

#[tokio::test]
async fn adaptive_minimizes_parabola() {
    let dummy = DummyParHolder::new("dummy").unwrap();
    let mut station = Station::new();
    station.add_component(dummy.instrument()).unwrap();

    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_station(station);
    let sweeps: Vec<Box<dyn SweepFunction>> = vec![
        Box::new(ParameterSweep::new(dummy.parameter("x").unwrap())),
        Box::new(ParameterSweep::new(dummy.parameter("y").unwrap())),
    ];
    mc.set_sweep_functions(sweeps);
    mc.set_detector_function(ParameterDetector::new(vec![dummy.parabola()]));
    mc.set_adaptive_function_parameters(
        AdaptiveSettings::nelder_mead(vec![-3.0, 2.0], vec![1.0, 1.0]).with_tolerances(1e-6, 1e-9),
    );

    let ds = mc.run("nelder_mead", RunMode::Adaptive).await.unwrap();
    let opt = ds.optimization.clone().unwrap();
    assert!(opt.converged);
    assert!(opt.f_opt < 1e-6);
    assert!(opt.x_opt.iter().all(|x| x.abs() < 1e-3));
    assert_eq!(ds.len(), opt.evaluations);
    assert_eq!(ds.column_names(), vec!["x", "y", "parabola"]);
    assert!(ds.metadata.parameters.contains_key("adaptive"));
    assert!(ds.metadata.station["instruments"]["dummy"].is_object());
}

#[tokio::test]
async fn adaptive_respects_evaluation_budget() {
    let dummy = DummyParHolder::new("dummy").unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(ParameterSweep::new(dummy.parameter("x").unwrap()));
    mc.set_detector_function(ParameterDetector::new(vec![dummy.parabola()]));
    mc.set_adaptive_function_parameters(
        AdaptiveSettings::nelder_mead(vec![10.0], vec![1.0]).with_max_evaluations(5),
    );

    let ds = mc.run("budget", RunMode::Adaptive).await.unwrap();
    assert_eq!(ds.len(), 5);
    assert!(!ds.optimization.unwrap().converged);
}

/// Soft detector reading `-(x - 1)²` from a shared parameter.
struct NegParabola {
    x: Arc<cqed_mc::parameter::Parameter>,
    names: Vec<String>,
    units: Vec<String>,
}

#[async_trait]
impl DetectorFunction for NegParabola {
    fn name(&self) -> &str {
        "neg_parabola"
    }

    fn value_names(&self) -> &[String] {
        &self.names
    }

    fn value_units(&self) -> &[String] {
        &self.units
    }

    fn detector_control(&self) -> DetectorControl {
        DetectorControl::Soft
    }

    async fn acquire_data_point(&mut self) -> Result<Vec<f64>> {
        let x = self.x.get().as_f64().unwrap_or(0.0);
        Ok(vec![-(x - 1.0).powi(2)])
    }
}

#[tokio::test]
async fn adaptive_maximizes() {
    let dummy = DummyParHolder::new("dummy").unwrap();
    let x = dummy.parameter("x").unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_sweep_function(ParameterSweep::new(x.clone()));
    mc.set_detector_function(NegParabola {
        x,
        names: vec!["signal".to_string()],
        units: vec!["V".to_string()],
    });
    mc.set_adaptive_function_parameters(
        AdaptiveSettings::nelder_mead(vec![4.0], vec![0.5])
            .with_tolerances(1e-6, 1e-10)
            .maximize(),
    );

    let ds = mc.run("maximize", RunMode::Adaptive).await.unwrap();
    let opt = ds.optimization.unwrap();
    assert!((opt.x_opt[0] - 1.0).abs() < 1e-3);
    assert!(opt.f_opt <= 0.0 && opt.f_opt > -1e-6);
}

fn saved_file(mc: &MeasurementControl, ds: &Dataset, ext: &str) -> std::path::PathBuf {
    let folder = mc.last_folder().unwrap();
    assert!(folder
        .file_name()
        .unwrap()
        .to_string_lossy()
        .contains(&ds.name));
    folder.join(format!("{}.{}", ds.name, ext))
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn csv_dataset_is_saved() {
    let dir = tempfile::tempdir().unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_storage("csv", dir.path()).unwrap();
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(5));
    mc.set_detector_function(DummyDetectorSoft::new());

    let ds = mc.run("saved_soft", RunMode::OneD).await.unwrap();
    let path = saved_file(&mc, &ds, "csv");
    assert!(path.starts_with(dir.path()));

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("# {"));
    assert!(text.contains("\"experiment_name\": \"saved_soft\""));
    let data: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(data[0], "pts (arb. unit),distance (m),Power (W)");
    assert_eq!(data.len(), 6);
}

#[tokio::test]
async fn json_dataset_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_storage("json", dir.path()).unwrap();
    mc.set_sweep_function(NoneSweep::hard());
    mc.set_sweep_points(&arange(5));
    mc.set_detector_function(DummyDetectorHard::new());

    let ds = mc.run("saved_hard", RunMode::OneD).await.unwrap();
    let text = std::fs::read_to_string(saved_file(&mc, &ds, "json")).unwrap();
    let loaded: Dataset = serde_json::from_str(&text).unwrap();
    assert_eq!(loaded.uid, ds.uid);
    assert_eq!(loaded.len(), ds.len());
    for (a, b) in loaded.rows.iter().flatten().zip(ds.rows.iter().flatten()) {
        assert!((a - b).abs() <= 1e-15);
    }
    assert_eq!(loaded.status, RunStatus::Completed);
}

#[tokio::test]
async fn disable_saving_clears_last_folder() {
    let dir = tempfile::tempdir().unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_storage("json", dir.path()).unwrap();
    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(2));
    mc.set_detector_function(DummyDetectorSoft::new());
    mc.run("first", RunMode::OneD).await.unwrap();
    assert!(mc.last_folder().is_some());

    mc.disable_saving();
    mc.run("second", RunMode::OneD).await.unwrap();
    assert!(mc.last_folder().is_none());
}

#[cfg(feature = "storage_csv")]
#[tokio::test]
async fn back_to_back_runs_keep_both_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_storage("csv", dir.path()).unwrap();
    mc.set_sweep_function(NoneSweep::new());
    mc.set_detector_function(DummyDetectorSoft::new());

    mc.set_sweep_points(&arange(3));
    let first = mc.run("same", RunMode::OneD).await.unwrap();
    let first_path = saved_file(&mc, &first, "csv");

    mc.set_sweep_points(&arange(1));
    let second = mc.run("same", RunMode::OneD).await.unwrap();
    let second_path = saved_file(&mc, &second, "csv");

    assert_ne!(first_path.parent(), second_path.parent());
    let rows = |path: &std::path::Path| {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .count()
    };
    assert_eq!(rows(&first_path), 4);
    assert_eq!(rows(&second_path), 2);
}

#[tokio::test]
async fn unknown_backend_keeps_previous_storage() {
    let dir = tempfile::tempdir().unwrap();
    let mut mc = MeasurementControl::new("MC", &quiet_settings());
    mc.set_storage("json", dir.path()).unwrap();
    let err = mc.set_storage("hdf5", dir.path()).unwrap_err();
    assert!(matches!(err, McError::Configuration(_)));

    mc.set_sweep_function(NoneSweep::new());
    mc.set_sweep_points(&arange(2));
    mc.set_detector_function(DummyDetectorSoft::new());
    let ds = mc.run("still_json", RunMode::OneD).await.unwrap();
    assert!(saved_file(&mc, &ds, "json").exists());
}
