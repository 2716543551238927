#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::wgpu::WgpuDevice;
use burn::backend::{Autodiff, NdArray, Wgpu};
use clap::{Parser, ValueEnum};

use maxillo_seg::config::AppConfig;
use maxillo_seg::training::{self, RunContext, RunReport};

type GpuTrain = Autodiff<Wgpu<f32, i32>>;
type CpuTrain = Autodiff<NdArray<f32>>;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum BackendKind {
    Wgpu,
    Ndarray,
}

/// Train or evaluate a 3D jaw segmentation network on patch batches.
#[derive(Parser)]
#[command(name = "train", about = "Train a 3D CT segmentation network")]
struct Cli {
    /// Path to the experiment TOML file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_config: bool,

    /// Skip training and evaluate the best checkpoint
    #[arg(long)]
    test: bool,

    /// Write predicted label volumes during final evaluation
    #[arg(long)]
    dump_results: bool,

    /// Checkpoint directory to resume training from (ignored with --test)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Override the number of ranks
    #[arg(long)]
    world_size: Option<usize>,

    /// Compute backend
    #[arg(long, value_enum, default_value = "wgpu")]
    backend: BackendKind,

    /// Log to stdout instead of `<run_dir>/logs/training.log`
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        let toml = AppConfig::default_toml().context("serializing default config")?;
        print!("{toml}");
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // CLI overrides
    if cli.test {
        config.trainer.do_train = false;
    }
    if cli.dump_results {
        config.trainer.dump_results = true;
    }
    if let Some(path) = cli.checkpoint {
        config.trainer.checkpoint_path = Some(path);
    }
    if let Some(epochs) = cli.epochs {
        config.trainer.epochs = epochs;
    }
    if let Some(world_size) = cli.world_size {
        config.distributed.world_size = world_size;
    }

    let world_size = config.distributed.world_size;
    let ctx = RunContext::new(config, cli.verbose).context("preparing run")?;

    let report = match cli.backend {
        BackendKind::Wgpu => training::run::<GpuTrain, _>(&ctx, |rank| {
            if world_size > 1 {
                WgpuDevice::DiscreteGpu(rank)
            } else {
                WgpuDevice::DefaultDevice
            }
        }),
        BackendKind::Ndarray => training::run::<CpuTrain, _>(&ctx, |_| NdArrayDevice::Cpu),
    }
    .context("training run failed")?;

    summarize(&report);
    Ok(())
}

fn summarize(report: &RunReport) {
    tracing::info!(
        start_epoch = report.start_epoch,
        epochs = report.epochs_completed,
        best = ?report.best_metric,
        diverged = report.diverged,
        "run finished"
    );
    let show = |metric: Option<f64>| metric.map_or_else(|| "-".to_string(), |m| format!("{m:.4}"));
    println!(
        "epochs: {}  best: {}  val: {}  test: {}",
        report.epochs_completed,
        show(report.best_metric),
        show(report.val_metric),
        show(report.test_metric),
    );
}
