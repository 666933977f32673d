//! Training loop with manual gradient accumulation.
//!
//! The optimizer step is decoupled from the micro-batch step: gradients of
//! each micro-batch are summed into a [`GradientAccumulator`] and applied
//! once per accumulation window. Reporting and checkpointing follow the
//! optimizer step.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{Tensor, Var};
use seqrun_core::{config_error, count_batch_accum, ProcessRole, Result, RunConfig};

use crate::accumulate::GradientAccumulator;
use crate::autotune::{BatchSizeAutotuner, TrialRunner};
use crate::checkpoint::{latest_record, CheckpointManager, CheckpointRecord};
use crate::data::Batch;
use crate::logging::log_training_status;
use crate::model::{Mode, SequenceModel};
use crate::optim::Optimizer;

/// Resolve the batch size and accumulation count before training.
///
/// Without an explicit batch size the size is searched with `runner`;
/// only token batching can be searched. With an effective batch size the
/// accumulation count is derived from it.
pub fn finalize_training_parameters(
    config: &mut RunConfig,
    num_devices: usize,
    runner: &mut dyn TrialRunner,
) -> Result<()> {
    let num_devices = num_devices.max(1);
    let batch_size = match config.train.resolved_batch_size() {
        Some(size) => size,
        None => {
            let mut tuner = BatchSizeAutotuner::from_config(&config.train.autotune, num_devices);
            if let Some(effective) = config.train.effective_batch_size {
                let (min, max) = tuner.bounds();
                if effective < min {
                    return Err(config_error(format!(
                        "train.effective_batch_size ({}) is below train.autotune.min_batch_size ({})",
                        effective, min
                    )));
                }
                tuner = tuner.with_max_batch_size(max.min(effective));
            }
            tuner.search(config, runner)?
        }
    };
    config.train.batch_size = Some(batch_size);

    if let Some(effective) = config.train.effective_batch_size {
        config.params.gradients_accum = count_batch_accum(batch_size, effective, num_devices);
        tracing::info!(
            batch_size,
            effective_batch_size = effective,
            gradients_accum = config.params.gradients_accum,
            "Accumulating gradients of {} iterations to get an effective batch size of {}",
            config.params.gradients_accum,
            effective
        );
    }
    Ok(())
}

/// Counters accumulated between two status reports.
#[derive(Debug)]
pub struct ReportState {
    counters: BTreeMap<String, u64>,
    last_report: Instant,
}

impl Default for ReportState {
    fn default() -> Self {
        Self {
            counters: BTreeMap::new(),
            last_report: Instant::now(),
        }
    }
}

impl ReportState {
    pub fn add(&mut self, name: &str, value: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += value;
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Per-second rates since the previous report. Resets the counters.
    pub fn take_rates(&mut self) -> Vec<(String, f64)> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_report).as_secs_f64().max(1e-9);
        self.last_report = now;
        self.counters
            .iter_mut()
            .map(|(name, value)| {
                let rate = *value as f64 / elapsed;
                *value = 0;
                (name.clone(), rate)
            })
            .collect()
    }
}

/// Called after every checkpoint save during training.
pub trait CheckpointHook<M> {
    fn after_save(&mut self, model: &M, record: &CheckpointRecord) -> Result<()>;
}

/// Outcome of [`Trainer::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainOutcome {
    /// `model_dir`, or the averaged checkpoint directory.
    pub output_dir: PathBuf,
    pub final_step: usize,
    pub last_record: Option<CheckpointRecord>,
    /// The restored checkpoint had already reached `train_steps`.
    pub already_complete: bool,
}

/// Drives the step loop for one model and optimizer.
pub struct Trainer<M, O> {
    model: M,
    optimizer: O,
    config: RunConfig,
    role: ProcessRole,
    variables: Vec<Var>,
    accumulator: GradientAccumulator,
    report: ReportState,
    last_loss: Option<f64>,
}

impl<M: SequenceModel, O: Optimizer> Trainer<M, O> {
    pub fn new(model: M, optimizer: O, config: RunConfig, role: ProcessRole) -> Result<Self> {
        config.validate()?;
        let variables = optimizer.variables().to_vec();
        Ok(Self {
            model,
            optimizer,
            config,
            role,
            variables,
            accumulator: GradientAccumulator::new(),
            report: ReportState::default(),
            last_loss: None,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn accumulator(&self) -> &GradientAccumulator {
        &self.accumulator
    }

    pub fn into_parts(self) -> (M, O) {
        (self.model, self.optimizer)
    }

    fn checkpoint_manager(&self) -> CheckpointManager {
        CheckpointManager::new(&self.config.model_dir, self.config.train.keep_checkpoint_max)
    }

    /// Restore `resume_from`, or the latest record of `model_dir` if any.
    pub fn restore(&mut self, resume_from: Option<&Path>) -> Result<Option<CheckpointRecord>> {
        let location = match resume_from {
            Some(path) => path.to_path_buf(),
            None => match latest_record(&self.config.model_dir)? {
                Some(record) => record.path,
                None => return Ok(None),
            },
        };
        let optimizer: &mut dyn Optimizer = &mut self.optimizer;
        let record = CheckpointManager::restore(self.model.varmap(), Some(optimizer), &location)?;
        Ok(Some(record))
    }

    /// Forward, loss and backward on one micro-batch; gradients are added
    /// to the accumulator. Returns the normalized loss.
    pub fn accumulate_step(&mut self, batch: &Batch) -> Result<f64> {
        let output = self.model.forward(batch, Mode::Train)?;
        let loss = self.model.compute_loss(&output, batch, true)?.normalized()?;
        let grads = loss.backward()?;
        self.accumulator.accumulate(&self.variables, &grads)?;

        self.report
            .add("source", batch.features_length.iter().sum::<usize>() as u64);
        if let Some(labels) = &batch.labels {
            self.report.add("target", labels.length.iter().sum::<usize>() as u64);
        }
        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Apply the accumulated gradients once and zero the buffers.
    pub fn apply_gradients(&mut self) -> Result<()> {
        let gradients: Vec<Tensor> = self.accumulator.gradients().to_vec();
        self.optimizer.apply_gradients(&gradients)?;
        self.accumulator.reset()
    }

    /// Train until `train_steps` optimizer steps or the end of `batches`,
    /// then average the last checkpoints if enabled.
    pub fn run<I>(&mut self, batches: I, resume_from: Option<&Path>) -> Result<TrainOutcome>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut outcome = self.run_with_hook(batches, resume_from, None)?;
        if !outcome.already_complete {
            if let Some(averaged) = self.maybe_average_checkpoints()? {
                outcome.output_dir = averaged;
            }
        }
        Ok(outcome)
    }

    /// The step loop of [`Trainer::run`], calling `hook` after each
    /// checkpoint save. Checkpoints are not averaged.
    pub fn run_with_hook<I>(
        &mut self,
        batches: I,
        resume_from: Option<&Path>,
        mut hook: Option<&mut dyn CheckpointHook<M>>,
    ) -> Result<TrainOutcome>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let model_dir = self.config.model_dir.clone();
        let train_steps = self.config.train.train_steps;
        let save_every = self.config.train.save_checkpoints_steps;
        let report_every = self.config.train.save_summary_steps.max(1);
        let accum_count = self.config.params.gradients_accum.max(1);
        let is_chief = self.role.is_chief();
        let manager = self.checkpoint_manager();

        let mut last_record = self.restore(resume_from)?;
        if let Some(limit) = train_steps {
            if self.optimizer.iterations() >= limit {
                tracing::warn!(train_steps = limit, "Model already reached train_steps = {}. Exiting.", limit);
                return Ok(TrainOutcome {
                    output_dir: model_dir,
                    final_step: self.optimizer.iterations(),
                    last_record,
                    already_complete: true,
                });
            }
        }

        self.report = ReportState::default();
        let mut last_saved_step = last_record.as_ref().map(|r| r.step);

        for (i, batch) in batches.into_iter().enumerate() {
            let batch = batch?;
            let loss = self.accumulate_step(&batch)?;
            self.last_loss = Some(loss);

            if !(i == 0 || self.accumulator.num_accumulated() >= accum_count) {
                continue;
            }
            self.apply_gradients()?;

            let step = self.optimizer.iterations();
            if step % report_every == 0 {
                let rates = self.report.take_rates();
                log_training_status(step, &rates, self.optimizer.current_learning_rate(), loss);
            }
            let reached_end = train_steps == Some(step);
            if save_every > 0 && (step % save_every == 0 || reached_end) && is_chief {
                let record = manager.save(self.model.varmap(), &self.optimizer, step, Some(loss))?;
                last_saved_step = Some(step);
                if let Some(hook) = hook.as_deref_mut() {
                    hook.after_save(&self.model, &record)?;
                }
                last_record = Some(record);
            }
            if reached_end {
                break;
            }
        }

        let final_step = self.optimizer.iterations();
        if is_chief && save_every > 0 && final_step > 0 && last_saved_step != Some(final_step) {
            let record =
                manager.save(self.model.varmap(), &self.optimizer, final_step, self.last_loss)?;
            if let Some(hook) = hook.as_deref_mut() {
                hook.after_save(&self.model, &record)?;
            }
            last_record = Some(record);
        }
        tracing::info!(step = final_step, "Training finished");

        Ok(TrainOutcome {
            output_dir: model_dir,
            final_step,
            last_record,
            already_complete: false,
        })
    }

    /// Average the last records into `model_dir/avg` when enabled on the chief.
    pub fn maybe_average_checkpoints(&mut self) -> Result<Option<PathBuf>> {
        let count = self.config.train.average_last_checkpoints;
        if count == 0 || !self.role.is_chief() {
            return Ok(None);
        }
        let output = self.config.model_dir.join("avg");
        let path = CheckpointManager::average(
            &self.config.model_dir,
            &output,
            count,
            self.model.varmap(),
            &mut self.optimizer,
        )?;
        Ok(Some(path))
    }
}
