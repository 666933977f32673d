//! Run configuration with TOML support.
//!
//! A configuration is resolved from layers: the built-in defaults (the
//! `Default` impls below), an optional model-specific auto-config, then each
//! user file in order. Later layers win; tables are merged key by key.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{config_error, IoResultExt, Result};

/// Unit in which a training batch size is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchType {
    /// Number of examples per batch.
    #[default]
    Examples,
    /// Number of tokens per batch (searchable by the autotuner).
    Tokens,
}

/// Alignment annotation appended to scoring output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignmentType {
    /// `src-tgt` pairs from the attention argmax.
    Hard,
    /// Full attention rows.
    Soft,
}

/// Exporters run at the end of `train_and_evaluate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    Last,
    Final,
}

/// Scorers run on saved evaluation predictions against the eval labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerKind {
    /// Corpus BLEU-4 in `[0, 100]`.
    Bleu,
    /// Percentage of predictions equal to their reference.
    Accuracy,
}

/// Learning rate decay schedules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecayConfig {
    /// `lr * model_dim^-0.5 * min(step^-0.5, step * warmup^-1.5)`.
    Noam {
        model_dim: usize,
        warmup_steps: usize,
    },
    /// Warmup, constant plateau, then cosine decay to `min_lr_frac`.
    Wsd {
        warmup_steps: usize,
        total_steps: usize,
        decay_start_frac: f64,
        min_lr_frac: f64,
    },
}

/// Data files consumed by the text pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub train_features_file: Option<PathBuf>,
    pub train_labels_file: Option<PathBuf>,
    pub eval_features_file: Option<PathBuf>,
    pub eval_labels_file: Option<PathBuf>,
    pub source_vocabulary: Option<PathBuf>,
    pub target_vocabulary: Option<PathBuf>,
}

/// Model and optimizer hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamsConfig {
    /// Micro-batches accumulated per optimizer update.
    pub gradients_accum: usize,
    pub learning_rate: f64,
    pub decay: Option<DecayConfig>,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub maximum_decoding_length: usize,
    /// Hidden size used by models that need one.
    pub hidden_size: usize,
}

impl Default for ParamsConfig {
    fn default() -> Self {
        Self {
            gradients_accum: 1,
            learning_rate: 1.0,
            decay: None,
            adam_beta1: 0.9,
            adam_beta2: 0.998,
            adam_epsilon: 1e-8,
            maximum_decoding_length: 250,
            hidden_size: 64,
        }
    }
}

/// Bounds of the out-of-process batch size search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutotuneConfig {
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    /// Stop once the feasible range is no wider than this.
    pub precision: usize,
    /// Training steps run by each trial.
    pub sample_iterations: usize,
    /// Wall-clock bound per trial in seconds (0 = unbounded).
    pub trial_timeout_secs: u64,
    /// Thread budget written to the trial resource-limit descriptor.
    pub threads: Option<usize>,
}

impl Default for AutotuneConfig {
    fn default() -> Self {
        Self {
            min_batch_size: 1024,
            max_batch_size: 16384,
            precision: 256,
            sample_iterations: 5,
            trial_timeout_secs: 1800,
            threads: None,
        }
    }
}

/// `[train]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainSection {
    /// Unset or 0 requests autotuning.
    pub batch_size: Option<usize>,
    pub batch_type: BatchType,
    pub effective_batch_size: Option<usize>,
    pub train_steps: Option<usize>,
    /// Save a checkpoint every N optimizer steps (0 = never).
    pub save_checkpoints_steps: usize,
    pub keep_checkpoint_max: usize,
    /// Report training status every N optimizer steps.
    pub save_summary_steps: usize,
    /// Average the last N checkpoints after training (0 = disabled).
    pub average_last_checkpoints: usize,
    pub sample_buffer_size: usize,
    pub single_pass: bool,
    pub maximum_features_length: Option<usize>,
    pub maximum_labels_length: Option<usize>,
    pub autotune: AutotuneConfig,
}

impl Default for TrainSection {
    fn default() -> Self {
        Self {
            batch_size: None,
            batch_type: BatchType::Examples,
            effective_batch_size: None,
            train_steps: None,
            save_checkpoints_steps: 5000,
            keep_checkpoint_max: 8,
            save_summary_steps: 100,
            average_last_checkpoints: 0,
            sample_buffer_size: 500_000,
            single_pass: false,
            maximum_features_length: None,
            maximum_labels_length: None,
            autotune: AutotuneConfig::default(),
        }
    }
}

impl TrainSection {
    /// The explicit batch size, if one was configured.
    pub fn resolved_batch_size(&self) -> Option<usize> {
        self.batch_size.filter(|&size| size > 0)
    }
}

/// `[eval]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalSection {
    pub batch_size: usize,
    /// Minimum seconds between two evaluations during training.
    pub eval_delay: u64,
    pub save_eval_predictions: bool,
    /// Scorers applied to the predictions after each evaluation. Enables
    /// predictions even without `save_eval_predictions`.
    pub external_evaluators: Vec<ScorerKind>,
    pub exporters: Vec<ExporterKind>,
}

impl Default for EvalSection {
    fn default() -> Self {
        Self {
            batch_size: 32,
            eval_delay: 18000,
            save_eval_predictions: false,
            external_evaluators: Vec::new(),
            exporters: vec![ExporterKind::Last],
        }
    }
}

/// `[infer]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferSection {
    pub batch_size: usize,
}

impl Default for InferSection {
    fn default() -> Self {
        Self { batch_size: 16 }
    }
}

/// `[score]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreSection {
    pub batch_size: usize,
    pub with_token_level: bool,
    pub with_alignments: Option<AlignmentType>,
}

impl Default for ScoreSection {
    fn default() -> Self {
        Self {
            batch_size: 64,
            with_token_level: false,
            with_alignments: None,
        }
    }
}

/// Fully resolved run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory holding checkpoints, `avg/`, `eval/` and `export/`.
    pub model_dir: PathBuf,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub train: TrainSection,
    #[serde(default)]
    pub eval: EvalSection,
    #[serde(default)]
    pub infer: InferSection,
    #[serde(default)]
    pub score: ScoreSection,
}

impl RunConfig {
    /// Create a configuration with built-in defaults for every section.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            data: DataConfig::default(),
            params: ParamsConfig::default(),
            train: TrainSection::default(),
            eval: EvalSection::default(),
            infer: InferSection::default(),
            score: ScoreSection::default(),
        }
    }

    /// Resolve a configuration from layers of increasing priority.
    pub fn from_layers<I>(layers: I) -> Result<Self>
    where
        I: IntoIterator<Item = toml::Value>,
    {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        for layer in layers {
            merge_values(&mut merged, layer);
        }
        let config: Self = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Load user files on top of an optional model auto-config.
    pub fn load<P: AsRef<Path>>(paths: &[P], auto_config: Option<toml::Value>) -> Result<Self> {
        let mut layers = Vec::with_capacity(paths.len() + 1);
        if let Some(auto) = auto_config {
            layers.push(auto);
        }
        for path in paths {
            let content = std::fs::read_to_string(path.as_ref()).with_path(path)?;
            let value: toml::Value = toml::from_str(&content)?;
            tracing::debug!(path = %path.as_ref().display(), "Loaded configuration layer");
            layers.push(value);
        }
        Self::from_layers(layers)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path.as_ref(), self.to_toml_string()?).with_path(path)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the runner cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.params.gradients_accum == 0 {
            return Err(config_error("params.gradients_accum must be > 0"));
        }
        if self.train.keep_checkpoint_max == 0 {
            return Err(config_error("train.keep_checkpoint_max must be > 0"));
        }
        if self.train.save_summary_steps == 0 {
            return Err(config_error("train.save_summary_steps must be > 0"));
        }
        if self.train.effective_batch_size == Some(0) {
            return Err(config_error("train.effective_batch_size must be > 0"));
        }
        let autotune = &self.train.autotune;
        if autotune.min_batch_size == 0 || autotune.min_batch_size > autotune.max_batch_size {
            return Err(config_error(format!(
                "train.autotune range [{}, {}] is empty",
                autotune.min_batch_size, autotune.max_batch_size
            )));
        }
        for (name, size) in [
            ("eval", self.eval.batch_size),
            ("infer", self.infer.batch_size),
            ("score", self.score.batch_size),
        ] {
            if size == 0 {
                return Err(config_error(format!("{}.batch_size must be > 0", name)));
            }
        }
        Ok(())
    }
}

/// Deep-merge `overlay` into `base`: tables merge recursively, every other
/// value in `overlay` replaces the one in `base`.
pub fn merge_values(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_table), toml::Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Number of micro-batches to accumulate to reach `effective_batch_size`.
///
/// Always at least 1.
pub fn count_batch_accum(batch_size: usize, effective_batch_size: usize, num_replicas: usize) -> usize {
    let per_step = (batch_size * num_replicas.max(1)).max(1);
    effective_batch_size.div_ceil(per_step).max(1)
}
