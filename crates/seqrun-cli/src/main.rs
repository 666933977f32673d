//! CLI entry point for seqrun.

use anyhow::Context;
use clap::Parser;
use seqrun_cli::cli::read_resource_limits;
use seqrun_cli::{Cli, Command, Runner};
use seqrun_train::logging::init_logging;
use seqrun_train::toy::TokenTaggerFactory;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Must happen before the compute thread pool starts.
    if let Command::Train {
        resource_limits: Some(path),
        ..
    } = &cli.command
    {
        let limits = read_resource_limits(path)
            .with_context(|| format!("reading resource limits {}", path.display()))?;
        if let Some(threads) = limits.threads {
            std::env::set_var("RAYON_NUM_THREADS", threads.to_string());
        }
    }

    init_logging(cli.log_format.into());
    if cli.config.is_empty() {
        anyhow::bail!("at least one --config file is required");
    }

    let runner = Runner::new(TokenTaggerFactory, cli.config.as_slice(), cli.runner_options()?)?;
    match cli.command {
        Command::Train {
            checkpoint_path, ..
        } => {
            let output_dir = runner.train(checkpoint_path.as_deref())?;
            tracing::info!(path = %output_dir.display(), "Final model directory");
        }
        Command::Evaluate { checkpoint_path } => {
            runner.evaluate(checkpoint_path.as_deref())?;
        }
        Command::TrainAndEval { checkpoint_path } => {
            let outcome = runner.train_and_evaluate(checkpoint_path.as_deref())?;
            tracing::info!(
                path = %outcome.output_dir.display(),
                evaluations = outcome.evaluations.len(),
                exports = outcome.exports.len(),
                "Final model directory"
            );
        }
        Command::Infer {
            features_file,
            predictions_file,
            checkpoint_path,
            log_prediction_time,
        } => {
            runner.infer(
                &features_file,
                predictions_file.as_deref(),
                checkpoint_path.as_deref(),
                log_prediction_time,
            )?;
        }
        Command::Export {
            checkpoint_path,
            export_dir_base,
        } => {
            let dir = runner.export(checkpoint_path.as_deref(), export_dir_base.as_deref())?;
            println!("{}", dir.display());
        }
        Command::Score {
            features_file,
            predictions_file,
            checkpoint_path,
            output_file,
        } => {
            runner.score(
                &features_file,
                predictions_file.as_deref(),
                checkpoint_path.as_deref(),
                output_file.as_deref(),
            )?;
        }
        Command::AverageCheckpoints {
            output_dir,
            max_count,
        } => {
            let dir = runner.average_checkpoints(&output_dir, max_count)?;
            tracing::info!(path = %dir.display(), "Averaged checkpoint");
        }
    }
    Ok(())
}
