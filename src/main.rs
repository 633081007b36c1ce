//! `cqed_mc` command line: runs the demonstration measurements against
//! dummy instruments.
//!
//! ```bash
//! cqed_mc soft1d --points 50
//! cqed_mc --no-save adaptive
//! CQED_STORAGE__BACKEND=json cqed_mc hard2d
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cqed_mc::adaptive::AdaptiveSettings;
use cqed_mc::config::{Settings, DEFAULT_CONFIG_PATH};
use cqed_mc::data::{Dataset, RunMode};
use cqed_mc::instrument::{DummyParHolder, Station};
use cqed_mc::logging;
use cqed_mc::measurement::{
    DummyDetectorHard, DummyDetectorSoft, MeasurementControl, NoneSweep, ParameterDetector,
    ParameterSweep, SweepFunction,
};

#[derive(Parser)]
#[command(name = "cqed_mc")]
#[command(about = "Measurement control demos against dummy instruments")]
struct Cli {
    /// Configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Measurement label (defaults to the demo name)
    #[arg(long)]
    name: Option<String>,

    /// Do not write the dataset to disk
    #[arg(long)]
    no_save: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Soft 1D sweep with the soft dummy detector
    Soft1d {
        #[arg(long, default_value = "20")]
        points: usize,
    },
    /// Hard 1D sweep with the hard dummy detector
    Hard1d {
        #[arg(long, default_value = "20")]
        points: usize,
    },
    /// Soft 2D sweep
    Soft2d {
        #[arg(long, default_value = "10")]
        points: usize,
        #[arg(long, default_value = "5")]
        points_2d: usize,
    },
    /// Hard inner sweep stepped by a soft outer sweep
    Hard2d {
        #[arg(long, default_value = "10")]
        points: usize,
        #[arg(long, default_value = "5")]
        points_2d: usize,
    },
    /// Nelder-Mead minimization of the dummy parabola
    Adaptive {
        /// Starting point for x and y
        #[arg(long, num_args = 2, default_values_t = [-5.0, 5.0])]
        x0: Vec<f64>,
        #[arg(long, default_value = "0.1")]
        noise: f64,
    },
    /// Noisy hard sweep averaged in software
    SoftAvg {
        #[arg(long, default_value = "20")]
        points: usize,
        #[arg(long, default_value = "5")]
        soft_avg: usize,
        #[arg(long, default_value = "0.5")]
        noise: f64,
    },
}

fn arange(n: usize) -> Vec<f64> {
    (0..n).map(|i| i as f64).collect()
}

fn summarize(dataset: &Dataset, mc: &MeasurementControl) {
    println!();
    println!(
        "{} [{}] {:?}: {} rows, columns {}",
        dataset.name,
        dataset.mode,
        dataset.status,
        dataset.len(),
        dataset.column_labels().join(", ")
    );
    if let Some(opt) = &dataset.optimization {
        println!(
            "optimum {:?} -> {:.4} after {} evaluations (converged: {})",
            opt.x_opt, opt.f_opt, opt.evaluations, opt.converged
        );
    }
    if let Some(folder) = mc.last_folder() {
        println!("saved to {}", folder.display());
    }
}

async fn run(cli: Cli, settings: Settings) -> Result<()> {
    let mut mc = MeasurementControl::new("MC", &settings);
    if cli.no_save {
        mc.disable_saving();
    }

    let (default_label, mode) = match &cli.command {
        Commands::Soft1d { points } => {
            mc.set_sweep_function(NoneSweep::new());
            mc.set_sweep_points(&arange(*points));
            mc.set_detector_function(DummyDetectorSoft::new());
            ("dummy_soft", RunMode::OneD)
        }
        Commands::Hard1d { points } => {
            mc.set_sweep_function(NoneSweep::hard());
            mc.set_sweep_points(&arange(*points));
            mc.set_detector_function(DummyDetectorHard::new());
            ("dummy_hard", RunMode::OneD)
        }
        Commands::Soft2d { points, points_2d } => {
            mc.set_sweep_function(NoneSweep::new());
            mc.set_sweep_points(&arange(*points));
            mc.set_sweep_function_2d(NoneSweep::new().with_parameter_name("pts_2d", "arb. unit"));
            mc.set_sweep_points_2d(&arange(*points_2d));
            mc.set_detector_function(DummyDetectorSoft::new());
            ("dummy_soft_2D", RunMode::TwoD)
        }
        Commands::Hard2d { points, points_2d } => {
            mc.set_sweep_function(NoneSweep::hard());
            mc.set_sweep_points(&arange(*points));
            mc.set_sweep_function_2d(NoneSweep::new().with_parameter_name("pts_2d", "arb. unit"));
            mc.set_sweep_points_2d(&arange(*points_2d));
            mc.set_detector_function(DummyDetectorHard::new());
            ("dummy_hard_2D", RunMode::TwoD)
        }
        Commands::SoftAvg {
            points,
            soft_avg,
            noise,
        } => {
            mc.set_sweep_function(NoneSweep::hard());
            mc.set_sweep_points(&arange(*points));
            mc.set_detector_function(DummyDetectorHard::new().with_noise(*noise));
            mc.set_soft_avg(*soft_avg)?;
            ("dummy_soft_avg", RunMode::OneD)
        }
        Commands::Adaptive { x0, noise } => {
            let dummy = DummyParHolder::new("dummy_instrument")?;
            dummy.instrument().set("noise", *noise).await?;
            let mut station = Station::new();
            station.add_component(dummy.instrument())?;
            mc.set_station(station);

            let sweeps: Vec<Box<dyn SweepFunction>> = vec![
                Box::new(ParameterSweep::new(dummy.parameter("x")?)),
                Box::new(ParameterSweep::new(dummy.parameter("y")?)),
            ];
            mc.set_sweep_functions(sweeps);
            mc.set_detector_function(ParameterDetector::new(vec![dummy.parabola()]));
            mc.set_adaptive_function_parameters(AdaptiveSettings::from_config(
                &settings.adaptive,
                x0.clone(),
                vec![1.0; x0.len()],
            ));
            ("nelder_mead_parabola", RunMode::Adaptive)
        }
    };

    let label = cli.name.as_deref().unwrap_or(default_label);
    let dataset = mc
        .run(label, mode)
        .await
        .with_context(|| format!("Measurement '{}' failed", label))?;
    summarize(&dataset, &mc);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init(&settings);
    tracing::info!(
        app = %settings.application.name,
        version = env!("CARGO_PKG_VERSION"),
        "starting"
    );

    run(cli, settings).await
}
