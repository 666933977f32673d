//! High-level runner: train, evaluate, infer, score and export one model.

use std::path::{Path, PathBuf};
use std::time::Duration;

use candle_core::Device;
use seqrun_core::{config_error, ExporterKind, ProcessRole, Result, RunConfig};
use seqrun_eval::{infer, score, EvaluationResult, Evaluator, LineWriter, OutputStream, PeriodicEvaluator};
use seqrun_train::autotune::{scratch_dir, ProcessTrialRunner, TrialRunner};
use seqrun_train::checkpoint::{CheckpointManager, CheckpointRecord};
use seqrun_train::data::{BatchingOptions, TextDataset, Vocab};
use seqrun_train::export::{default_export_base, export};
use seqrun_train::model::{ModelFactory, SequenceModel};
use seqrun_train::optim::Adam;
use seqrun_train::train::{finalize_training_parameters, CheckpointHook, Trainer};

/// Process-level options of a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub num_devices: usize,
    pub seed: Option<u64>,
    /// Layer the model's automatic configuration under the user files.
    pub auto_config: bool,
    pub device: Device,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            num_devices: 1,
            seed: None,
            auto_config: false,
            device: Device::Cpu,
        }
    }
}

/// Outcome of [`Runner::train_and_evaluate`].
#[derive(Debug, Clone)]
pub struct TrainAndEvalOutcome {
    /// `model_dir`, or the averaged checkpoint directory.
    pub output_dir: PathBuf,
    pub evaluations: Vec<EvaluationResult>,
    /// Directories written by the configured exporters.
    pub exports: Vec<PathBuf>,
}

/// Runs one model built by `F` against a resolved [`RunConfig`].
pub struct Runner<F: ModelFactory> {
    factory: F,
    config: RunConfig,
    device: Device,
    num_devices: usize,
    seed: Option<u64>,
    role: ProcessRole,
}

impl<F: ModelFactory> Runner<F> {
    /// Resolve the configuration from `config_paths` (later files win) on
    /// top of the model auto-config when requested.
    pub fn new<P: AsRef<Path>>(factory: F, config_paths: &[P], options: RunnerOptions) -> Result<Self> {
        let auto_config = if options.auto_config {
            let values = factory.auto_config(options.num_devices.max(1)).ok_or_else(|| {
                config_error("This model does not define any automatic configuration values")
            })?;
            Some(values)
        } else {
            None
        };
        let config = RunConfig::load(config_paths, auto_config)?;
        Self::from_config(factory, config, options)
    }

    pub fn from_config(factory: F, config: RunConfig, options: RunnerOptions) -> Result<Self> {
        config.validate()?;
        tracing::info!("Using parameters:\n{}", config.to_toml_string()?);

        if let Some(seed) = options.seed {
            // The CPU backend has no global generator; data shuffling takes the seed instead.
            if !options.device.is_cpu() {
                options.device.set_seed(seed)?;
            }
        }
        Ok(Self {
            factory,
            config,
            device: options.device,
            num_devices: options.num_devices.max(1),
            seed: options.seed,
            role: ProcessRole::from_env()?,
        })
    }

    /// Override the role resolved from the environment.
    pub fn with_role(mut self, role: ProcessRole) -> Self {
        self.role = role;
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn is_chief(&self) -> bool {
        self.role.is_chief()
    }

    /// Train, autotuning the batch size with subprocess trials if needed.
    ///
    /// Returns `model_dir`, or the averaged checkpoint directory.
    pub fn train(&self, checkpoint_path: Option<&Path>) -> Result<PathBuf> {
        let mut trials = self.process_trial_runner()?;
        self.train_with_trial_runner(checkpoint_path, &mut trials)
    }

    pub fn train_with_trial_runner(
        &self,
        checkpoint_path: Option<&Path>,
        trials: &mut dyn TrialRunner,
    ) -> Result<PathBuf> {
        let config = self.finalized_config(trials)?;
        let mut trainer = self.build_trainer(config.clone())?;
        let dataset = self.training_dataset(&config, trainer.model().unsupervised())?;
        let options = self.training_options(&config)?;

        let outcome = trainer.run(dataset.batches(options, &self.device), checkpoint_path)?;
        Ok(outcome.output_dir)
    }

    /// Restore a checkpoint (the latest of `model_dir` by default) and
    /// evaluate it on the evaluation files.
    pub fn evaluate(&self, checkpoint_path: Option<&Path>) -> Result<EvaluationResult> {
        let model = self.factory.build(&self.config, &self.device)?;
        let record = self.restore(&model, checkpoint_path)?;
        let mut evaluator = self.evaluator(&self.config, model.unsupervised())?;
        evaluator.evaluate(&model, &self.device, record.step)
    }

    /// Train with evaluation after checkpoint saves, throttled by
    /// `eval.eval_delay`, then evaluate and export the final model.
    pub fn train_and_evaluate(&self, checkpoint_path: Option<&Path>) -> Result<TrainAndEvalOutcome> {
        let mut trials = self.process_trial_runner()?;
        self.train_and_evaluate_with_trial_runner(checkpoint_path, &mut trials)
    }

    pub fn train_and_evaluate_with_trial_runner(
        &self,
        checkpoint_path: Option<&Path>,
        trials: &mut dyn TrialRunner,
    ) -> Result<TrainAndEvalOutcome> {
        let config = self.finalized_config(trials)?;
        let mut trainer = self.build_trainer(config.clone())?;
        let unsupervised = trainer.model().unsupervised();
        let dataset = self.training_dataset(&config, unsupervised)?;
        let options = self.training_options(&config)?;
        let mut periodic = PeriodicEvaluator::new(
            self.evaluator(&config, unsupervised)?,
            self.device.clone(),
            Duration::from_secs(config.eval.eval_delay),
        );

        let hook: &mut dyn CheckpointHook<F::Model> = &mut periodic;
        let outcome =
            trainer.run_with_hook(dataset.batches(options, &self.device), checkpoint_path, Some(hook))?;
        if outcome.already_complete {
            return Ok(TrainAndEvalOutcome {
                output_dir: outcome.output_dir,
                evaluations: periodic.into_results(),
                exports: Vec::new(),
            });
        }

        periodic.evaluate_now(trainer.model(), outcome.final_step)?;
        let mut exports = Vec::new();
        if self.role.is_chief() {
            for kind in &config.eval.exporters {
                let name = match kind {
                    ExporterKind::Last => "latest",
                    ExporterKind::Final => "final",
                };
                let base = config.model_dir.join("export").join(name);
                exports.push(export(trainer.model().varmap(), &config, &base)?);
            }
        }

        let output_dir = trainer
            .maybe_average_checkpoints()?
            .unwrap_or(outcome.output_dir);
        Ok(TrainAndEvalOutcome {
            output_dir,
            evaluations: periodic.into_results(),
            exports,
        })
    }

    /// Decode `features_file`, one prediction per line in input order.
    /// Writes to standard output without `predictions_file`.
    pub fn infer(
        &self,
        features_file: &Path,
        predictions_file: Option<&Path>,
        checkpoint_path: Option<&Path>,
        log_time: bool,
    ) -> Result<()> {
        let model = self.factory.build(&self.config, &self.device)?;
        self.restore(&model, checkpoint_path)?;
        let (source_vocab, target_vocab) = self.vocabularies()?;
        let dataset = TextDataset::from_files(features_file, None, &source_vocab, &target_vocab)?;

        let mut writer = LineWriter::new(OutputStream::open(predictions_file)?);
        infer(
            &model,
            dataset.batches(BatchingOptions::inference(self.config.infer.batch_size), &self.device),
            self.config.params.maximum_decoding_length,
            &mut writer,
            log_time,
        )?;
        writer.into_inner().finish()
    }

    /// Score existing predictions of `features_file`.
    ///
    /// `predictions_file` is required unless the model is unsupervised, in
    /// which case the features are scored.
    pub fn score(
        &self,
        features_file: &Path,
        predictions_file: Option<&Path>,
        checkpoint_path: Option<&Path>,
        output_file: Option<&Path>,
    ) -> Result<()> {
        let model = self.factory.build(&self.config, &self.device)?;
        let labels_file = match predictions_file {
            Some(path) => path,
            None if model.unsupervised() => features_file,
            None => {
                return Err(config_error(
                    "a predictions file is required when scoring with a sequence to sequence model",
                ))
            }
        };
        self.restore(&model, checkpoint_path)?;
        let (source_vocab, target_vocab) = self.vocabularies()?;
        let dataset =
            TextDataset::from_files(features_file, Some(labels_file), &source_vocab, &target_vocab)?;

        let mut writer = LineWriter::new(OutputStream::open(output_file)?);
        score(
            &model,
            dataset.batches(BatchingOptions::inference(self.config.score.batch_size), &self.device),
            &self.config.score,
            &mut writer,
            false,
        )?;
        writer.into_inner().finish()
    }

    /// Export a checkpoint into a fresh subdirectory of `export_dir_base`
    /// (default `model_dir/export/manual`).
    pub fn export(&self, checkpoint_path: Option<&Path>, export_dir_base: Option<&Path>) -> Result<PathBuf> {
        let model = self.factory.build(&self.config, &self.device)?;
        self.restore(&model, checkpoint_path)?;
        let base = export_dir_base
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_export_base(&self.config));
        export(model.varmap(), &self.config, &base)
    }

    /// Average the last `max_count` checkpoints of `model_dir` into `output_dir`.
    pub fn average_checkpoints(&self, output_dir: &Path, max_count: usize) -> Result<PathBuf> {
        let model = self.factory.build(&self.config, &self.device)?;
        let mut optimizer = Adam::from_params(model.trainable_variables()?, &self.config.params)?;
        CheckpointManager::average(
            &self.config.model_dir,
            output_dir,
            max_count,
            model.varmap(),
            &mut optimizer,
        )
    }

    fn process_trial_runner(&self) -> Result<ProcessTrialRunner> {
        Ok(ProcessTrialRunner::current_exe(scratch_dir(&self.config), self.num_devices)?
            .with_autotune_config(&self.config.train.autotune)
            .with_device(&self.device)
            .with_seed(self.seed))
    }

    fn finalized_config(&self, trials: &mut dyn TrialRunner) -> Result<RunConfig> {
        let mut config = self.config.clone();
        finalize_training_parameters(&mut config, self.num_devices, trials)?;
        Ok(config)
    }

    fn build_trainer(&self, config: RunConfig) -> Result<Trainer<F::Model, Adam>> {
        let model = self.factory.build(&config, &self.device)?;
        let optimizer = Adam::from_params(model.trainable_variables()?, &config.params)?;
        Trainer::new(model, optimizer, config, self.role)
    }

    fn restore(&self, model: &F::Model, checkpoint_path: Option<&Path>) -> Result<CheckpointRecord> {
        let location = checkpoint_path.unwrap_or(self.config.model_dir.as_path());
        CheckpointManager::restore(model.varmap(), None, location)
    }

    fn vocabularies(&self) -> Result<(Vocab, Vocab)> {
        let data = &self.config.data;
        let source = data
            .source_vocabulary
            .as_ref()
            .ok_or_else(|| config_error("data.source_vocabulary is required"))?;
        let target = data
            .target_vocabulary
            .as_ref()
            .ok_or_else(|| config_error("data.target_vocabulary is required"))?;
        Ok((Vocab::from_file(source)?, Vocab::from_file(target)?))
    }

    /// Load `features` with `labels`, scoring the features themselves for
    /// unsupervised models.
    fn labelled_dataset(
        &self,
        features: Option<&PathBuf>,
        labels: Option<&PathBuf>,
        unsupervised: bool,
        what: &str,
    ) -> Result<TextDataset> {
        let features = features
            .ok_or_else(|| config_error(format!("data.{}_features_file is required", what)))?;
        let labels = match labels {
            Some(labels) => labels,
            None if unsupervised => features,
            None => return Err(config_error(format!("data.{}_labels_file is required", what))),
        };
        let (source_vocab, target_vocab) = self.vocabularies()?;
        TextDataset::from_files(features, Some(labels), &source_vocab, &target_vocab)
    }

    fn training_dataset(&self, config: &RunConfig, unsupervised: bool) -> Result<TextDataset> {
        let dataset = self.labelled_dataset(
            config.data.train_features_file.as_ref(),
            config.data.train_labels_file.as_ref(),
            unsupervised,
            "train",
        )?;
        let dataset = dataset.filter_lengths(
            config.train.maximum_features_length,
            config.train.maximum_labels_length,
        );
        if dataset.is_empty() {
            return Err(config_error("no training example left after length filtering"));
        }
        Ok(dataset)
    }

    fn training_options(&self, config: &RunConfig) -> Result<BatchingOptions> {
        let batch_size = config
            .train
            .resolved_batch_size()
            .ok_or_else(|| config_error("train.batch_size is not resolved"))?;
        let seed = self.seed.unwrap_or_else(rand::random);
        Ok(BatchingOptions::training(&config.train, batch_size, seed))
    }

    fn evaluator(&self, config: &RunConfig, unsupervised: bool) -> Result<Evaluator> {
        let dataset = self.labelled_dataset(
            config.data.eval_features_file.as_ref(),
            config.data.eval_labels_file.as_ref(),
            unsupervised,
            "eval",
        )?;
        Evaluator::from_config(
            dataset,
            &config.eval,
            config.params.maximum_decoding_length,
            &config.model_dir,
            config.data.eval_labels_file.as_deref(),
        )
    }
}
