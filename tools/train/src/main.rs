//! BigEarthNet Training CLI
//!
//! Trains a multi-label Sentinel-2 classifier, optionally with several
//! workers, or evaluates the latest checkpoint on the test split.

use std::path::PathBuf;

use anyhow::{Context, Result};
use bigearth_core::{load_toml_config, setup_cli_logging, RunConfig};
use bigearth_training::backend::{backend_name, default_device, TrainingBackend};
use bigearth_training::{run, EvaluationReport, RunMode, RunReport};
use clap::{Parser, ValueEnum};
use colored::Colorize;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Train, checkpoint on the best validation F-score, then test
    Train,
    /// Restore the latest checkpoint and evaluate the test split
    Eval,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Train => RunMode::Train,
            Mode::Eval => RunMode::Eval,
        }
    }
}

/// BigEarthNet Multi-Label Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "bigearth-train",
    about = "Train and evaluate BigEarthNet multi-label classifiers",
    long_about = "Train multi-label classifiers on fused multi-resolution Sentinel-2 \
                  patches, with synchronized multi-worker training, or evaluate a checkpoint."
)]
struct Args {
    /// Path to the run configuration (TOML)
    #[arg(short, long, value_name = "FILE", default_value = "configs/base.toml")]
    config: PathBuf,

    /// Run mode
    #[arg(short, long, value_enum, default_value = "train")]
    mode: Mode,

    /// Override the number of workers (more than one enables multi-worker training)
    #[arg(short, long, value_name = "N")]
    workers: Option<usize>,

    /// Checkpoint directory restored in eval mode
    #[arg(long, value_name = "DIR")]
    eval_checkpoint: Option<PathBuf>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override the base learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override the per-worker batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Validate the configuration without running
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    setup_cli_logging(args.verbose)?;

    println!("{}", "BigEarthNet Multi-Label Training".green().bold());

    let mut config: RunConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    print_config_summary(&config, args.mode);

    if args.dry_run {
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let report = run::<TrainingBackend>(&config, args.mode.into(), default_device())
        .with_context(|| format!("{} run failed", RunMode::from(args.mode)))?;

    match &report {
        RunReport::Trained(outcome) => {
            println!();
            println!("{}", "Training Complete!".green().bold());
            println!("  Best validation micro F-score: {:.3}", outcome.best_fscore);
            if let Some(checkpoint) = &outcome.checkpoint {
                println!("  Restored checkpoint: {}", checkpoint.display());
            }
        }
        RunReport::Evaluated(_) => {
            println!();
            println!("{}", "Evaluation Complete!".green().bold());
        }
    }
    print_test_scores(report.test_report());

    Ok(())
}

fn apply_overrides(config: &mut RunConfig, args: &Args) {
    if let Some(workers) = args.workers {
        config.distributed.enabled = workers > 1;
        config.distributed.num_workers = workers;
    }
    if let Some(ref dir) = args.eval_checkpoint {
        config.output.eval_checkpoint = Some(dir.clone());
    }
    if let Some(epochs) = args.epochs {
        config.training.nb_epoch = epochs;
    }
    if let Some(lr) = args.lr {
        config.training.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
}

fn print_config_summary(config: &RunConfig, mode: Mode) {
    println!("{}", "Configuration Summary:".cyan().bold());
    println!("  Mode: {:?}", mode);
    println!("  Backend: {}", backend_name());
    println!("  Model: {}", config.model.name);
    println!(
        "  Labels: {} ({} classes)",
        config.data.label_type,
        config.label_scheme().num_classes
    );
    println!("  Workers: {}", config.world_size());
    println!("  Epochs: {}", config.training.nb_epoch);
    println!("  Batch size: {}", config.training.batch_size);
    println!(
        "  Learning rate: {} (x{} workers)",
        config.training.learning_rate,
        config.world_size()
    );
    println!(
        "  LR decay: x{} every {} epochs",
        config.training.decay_rate, config.training.decay_step
    );
    println!("  Checkpoints: {}", config.checkpoint_dir().display());
    println!();
}

fn print_test_scores(report: &EvaluationReport) {
    let m = &report.metrics;
    println!("{}", "Test Scores".cyan().bold());
    println!("=============");
    println!(
        "micro: accuracy: {:.3}, precision: {:.3}, recall: {:.3}, f-score: {:.3}",
        m.micro_accuracy, m.micro_precision, m.micro_recall, m.micro_fscore
    );
    println!(
        "macro: accuracy: {:.3}, precision: {:.3}, recall: {:.3}, f-score: {:.3}",
        m.macro_accuracy, m.macro_precision, m.macro_recall, m.macro_fscore
    );
    println!(
        "{} patches, loss {:.4}, {:.1} images/sec",
        report.num_samples, report.loss, report.throughput
    );
}
