//! Command line definition.

use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use seqrun_core::{config_error, IoResultExt, Result};
use seqrun_train::autotune::ResourceLimits;
use seqrun_train::logging::LogFormat;

use crate::runner::RunnerOptions;

#[derive(Parser, Debug)]
#[command(name = "seqrun")]
#[command(about = "Train, evaluate and run sequence models", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration files, merged in order
    #[arg(long = "config", action = ArgAction::Append, global = true)]
    pub config: Vec<PathBuf>,

    /// Layer the model's automatic configuration under the files
    #[arg(long, global = true)]
    pub auto_config: bool,

    #[arg(long, default_value = "1", global = true)]
    pub num_devices: usize,

    #[arg(long, global = true)]
    pub seed: Option<u64>,

    /// cpu, cuda or cuda:N
    #[arg(long, default_value = "cpu", global = true)]
    pub device: String,

    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train a model
    Train {
        /// Checkpoint to start from (default: latest of model_dir)
        #[arg(long)]
        checkpoint_path: Option<PathBuf>,

        /// JSON resource-limit descriptor
        #[arg(long)]
        resource_limits: Option<PathBuf>,
    },

    /// Evaluate a checkpoint
    Evaluate {
        #[arg(long)]
        checkpoint_path: Option<PathBuf>,
    },

    /// Train with periodic evaluation, then export
    TrainAndEval {
        #[arg(long)]
        checkpoint_path: Option<PathBuf>,
    },

    /// Decode a features file
    Infer {
        #[arg(long)]
        features_file: PathBuf,

        /// Output file (default: standard output)
        #[arg(long)]
        predictions_file: Option<PathBuf>,

        #[arg(long)]
        checkpoint_path: Option<PathBuf>,

        /// Log total and average prediction time
        #[arg(long)]
        log_prediction_time: bool,
    },

    /// Export weights and configuration
    Export {
        #[arg(long)]
        checkpoint_path: Option<PathBuf>,

        /// Base directory (default: model_dir/export/manual)
        #[arg(long)]
        export_dir_base: Option<PathBuf>,
    },

    /// Score existing predictions
    Score {
        #[arg(long)]
        features_file: PathBuf,

        #[arg(long)]
        predictions_file: Option<PathBuf>,

        #[arg(long)]
        checkpoint_path: Option<PathBuf>,

        /// Output file (default: standard output)
        #[arg(long)]
        output_file: Option<PathBuf>,
    },

    /// Average the last checkpoints of model_dir
    AverageCheckpoints {
        #[arg(long)]
        output_dir: PathBuf,

        #[arg(long, default_value = "8")]
        max_count: usize,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

impl Cli {
    pub fn runner_options(&self) -> Result<RunnerOptions> {
        Ok(RunnerOptions {
            num_devices: self.num_devices,
            seed: self.seed,
            auto_config: self.auto_config,
            device: resolve_device(&self.device)?,
        })
    }
}

pub fn resolve_device(device: &str) -> Result<candle_core::Device> {
    match device {
        "cpu" => Ok(candle_core::Device::Cpu),
        #[cfg(feature = "cuda")]
        "cuda" => Ok(candle_core::Device::new_cuda(0)?),
        #[cfg(feature = "cuda")]
        s if s.starts_with("cuda:") => {
            let id: usize = s
                .trim_start_matches("cuda:")
                .parse()
                .map_err(|_| config_error(format!("Invalid CUDA device id in '{}'", s)))?;
            Ok(candle_core::Device::new_cuda(id)?)
        }
        other => Err(config_error(format!(
            "Unknown device: {}. Use 'cpu', 'cuda', or 'cuda:N'.",
            other
        ))),
    }
}

/// Read a resource-limit descriptor written for a trial run.
pub fn read_resource_limits(path: &Path) -> Result<ResourceLimits> {
    let json = std::fs::read_to_string(path).with_path(path)?;
    Ok(serde_json::from_str(&json)?)
}
