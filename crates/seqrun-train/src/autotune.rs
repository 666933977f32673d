//! Batch size search by out-of-process training trials.
//!
//! Running out of memory is not a condition a training process can
//! reliably recover from, so every candidate size is tried by a separate
//! trial run whose exit status decides feasibility.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use candle_core::{Device, DeviceLocation};
use serde::{Deserialize, Serialize};
use seqrun_core::{
    config_error, count_batch_accum, AutotuneConfig, BatchType, IoResultExt, Result, RunConfig,
    RunnerError,
};

/// Runs one short training session and reports whether it succeeded.
pub trait TrialRunner {
    /// `Ok(false)` means the trial failed and the size is presumed infeasible.
    /// `Err` is reserved for trials that could not be launched at all.
    fn run(&mut self, config: &RunConfig) -> Result<bool>;

    /// Remove every scratch artifact. Failures are not reported.
    fn cleanup(&mut self) {}
}

/// Resource limits handed to a trial process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Compute threads the trial may use.
    pub threads: Option<usize>,
}

/// Binary search for the largest feasible token batch size.
#[derive(Debug, Clone)]
pub struct BatchSizeAutotuner {
    min_batch_size: usize,
    max_batch_size: usize,
    precision: usize,
    sample_iterations: usize,
    num_replicas: usize,
}

impl BatchSizeAutotuner {
    pub fn new(min_batch_size: usize, max_batch_size: usize, precision: usize) -> Self {
        Self {
            min_batch_size,
            max_batch_size,
            precision: precision.max(1),
            sample_iterations: 5,
            num_replicas: 1,
        }
    }

    pub fn from_config(config: &AutotuneConfig, num_replicas: usize) -> Self {
        Self::new(config.min_batch_size, config.max_batch_size, config.precision)
            .with_sample_iterations(config.sample_iterations)
            .with_num_replicas(num_replicas)
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size;
        self
    }

    pub fn with_sample_iterations(mut self, sample_iterations: usize) -> Self {
        self.sample_iterations = sample_iterations.max(1);
        self
    }

    pub fn with_num_replicas(mut self, num_replicas: usize) -> Self {
        self.num_replicas = num_replicas.max(1);
        self
    }

    pub fn bounds(&self) -> (usize, usize) {
        (self.min_batch_size, self.max_batch_size)
    }

    /// Upper bound on the number of trials a search runs.
    pub fn max_iterations(&self) -> usize {
        let span = self.max_batch_size.saturating_sub(self.min_batch_size) as f64;
        if span <= self.precision as f64 {
            return 0;
        }
        (span / self.precision as f64).log2().ceil() as usize
    }

    /// Disposable configuration for a trial at `batch_size`: a few steps,
    /// no checkpoints, no averaging, and a scratch model directory.
    pub fn trial_config(&self, base: &RunConfig, batch_size: usize) -> RunConfig {
        let mut config = base.clone();
        config.model_dir = scratch_dir(base).join("model");
        config.train.batch_size = Some(batch_size);
        config.train.train_steps = Some(self.sample_iterations);
        config.train.save_checkpoints_steps = 0;
        config.train.average_last_checkpoints = 0;
        if let Some(effective) = config.train.effective_batch_size {
            config.params.gradients_accum = count_batch_accum(batch_size, effective, self.num_replicas);
        }
        config
    }

    /// Search `[min, max]` and return the largest size whose trial succeeded,
    /// within `precision` of the true boundary.
    pub fn search(&self, base: &RunConfig, runner: &mut dyn TrialRunner) -> Result<usize> {
        if base.train.batch_type != BatchType::Tokens {
            return Err(RunnerError::UnsupportedAutotune(
                "only batch_type = \"tokens\" can be searched; set train.batch_size explicitly"
                    .to_string(),
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(config_error(format!(
                "empty batch size search range [{}, {}]",
                self.min_batch_size, self.max_batch_size
            )));
        }

        let result = self.run_search(base, runner);
        runner.cleanup();
        result
    }

    fn run_search(&self, base: &RunConfig, runner: &mut dyn TrialRunner) -> Result<usize> {
        let mut low = self.min_batch_size;
        let mut high = self.max_batch_size;
        tracing::info!(
            min = low,
            max = high,
            precision = self.precision,
            "Searching the largest batch size between {} and {} with a precision of {}...",
            low,
            high,
            self.precision
        );

        while high - low > self.precision {
            let candidate = (low + high) / 2;
            tracing::info!(batch_size = candidate, "Trying training with batch size {}...", candidate);
            if runner.run(&self.trial_config(base, candidate))? {
                tracing::info!(
                    "... succeeded, continue until the search range is smaller than {}.",
                    self.precision
                );
                low = candidate;
            } else {
                tracing::info!("... failed.");
                high = candidate - 1;
            }
        }

        tracing::info!(batch_size = low, "Batch size auto tuned to {}.", low);
        Ok(low)
    }
}

/// Scratch directory of the search, inside the real model directory.
pub fn scratch_dir(base: &RunConfig) -> PathBuf {
    base.model_dir.join("batch_size_autotuner")
}

/// Command line name of `device`, as accepted by `--device`.
pub fn device_arg(device: &Device) -> String {
    match device.location() {
        DeviceLocation::Cpu => "cpu".to_string(),
        DeviceLocation::Cuda { gpu_id } => format!("cuda:{}", gpu_id),
        DeviceLocation::Metal { gpu_id } => format!("metal:{}", gpu_id),
    }
}

/// Launches `<program> train --config <file> --num-devices <n>` per trial,
/// on the same device and with the same seed as the parent run.
#[derive(Debug)]
pub struct ProcessTrialRunner {
    program: PathBuf,
    scratch_dir: PathBuf,
    num_devices: usize,
    device: Option<String>,
    seed: Option<u64>,
    timeout: Option<Duration>,
    resource_limits: Option<ResourceLimits>,
}

impl ProcessTrialRunner {
    pub fn new(program: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>, num_devices: usize) -> Self {
        Self {
            program: program.into(),
            scratch_dir: scratch_dir.into(),
            num_devices: num_devices.max(1),
            device: None,
            seed: None,
            timeout: None,
            resource_limits: None,
        }
    }

    /// Re-run the current executable for every trial.
    pub fn current_exe(scratch_dir: impl Into<PathBuf>, num_devices: usize) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| config_error(format!("cannot locate the current executable: {}", e)))?;
        Ok(Self::new(program, scratch_dir, num_devices))
    }

    /// Configure from `[train.autotune]`. A zero timeout means unbounded.
    pub fn with_autotune_config(mut self, config: &AutotuneConfig) -> Self {
        self.timeout = (config.trial_timeout_secs > 0)
            .then(|| Duration::from_secs(config.trial_timeout_secs));
        self.resource_limits = config.threads.map(|threads| ResourceLimits {
            threads: Some(threads),
        });
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_device(mut self, device: &Device) -> Self {
        self.device = Some(device_arg(device));
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Arguments of a trial reading its configuration from `config_path`.
    pub fn trial_args(&self, config_path: &Path, limits_path: Option<&Path>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "train".into(),
            "--config".into(),
            config_path.into(),
            "--num-devices".into(),
            self.num_devices.to_string().into(),
        ];
        if let Some(device) = &self.device {
            args.push("--device".into());
            args.push(device.into());
        }
        if let Some(seed) = self.seed {
            args.push("--seed".into());
            args.push(seed.to_string().into());
        }
        if let Some(limits_path) = limits_path {
            args.push("--resource-limits".into());
            args.push(limits_path.into());
        }
        args
    }

    pub fn config_path(&self) -> PathBuf {
        self.scratch_dir.join("batch_size_autotuner.toml")
    }

    pub fn limits_path(&self) -> PathBuf {
        self.scratch_dir.join("batch_size_autotuner.limits.json")
    }

    fn wait(&self, mut child: std::process::Child) -> Result<bool> {
        let started = Instant::now();
        loop {
            if let Some(status) = child.try_wait().with_path(&self.program)? {
                return Ok(status.success());
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "Trial exceeded its time limit; killing it"
                    );
                    // The child may exit between try_wait and kill.
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(false);
                }
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

impl TrialRunner for ProcessTrialRunner {
    fn run(&mut self, config: &RunConfig) -> Result<bool> {
        std::fs::create_dir_all(&self.scratch_dir).with_path(&self.scratch_dir)?;
        let config_path = self.config_path();
        config.save(&config_path)?;

        let limits_path = match &self.resource_limits {
            Some(limits) => {
                let path = self.limits_path();
                std::fs::write(&path, serde_json::to_string(limits)?).with_path(&path)?;
                Some(path)
            }
            None => None,
        };

        let child = Command::new(&self.program)
            .args(self.trial_args(&config_path, limits_path.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                config_error(format!(
                    "failed to launch trial '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;
        self.wait(child)
    }

    fn cleanup(&mut self) {
        remove_best_effort(&self.scratch_dir);
    }
}

fn remove_best_effort(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = std::fs::remove_dir_all(path) {
        tracing::debug!(path = %path.display(), error = %e, "Failed to remove autotuner scratch files");
    }
}
