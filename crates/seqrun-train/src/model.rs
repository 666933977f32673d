//! Model capability consumed by the training and inference loops.

use candle_core::{Device, Tensor, Var, D};
use candle_nn::VarMap;
use seqrun_core::{config_error, Result, RunConfig};

use crate::data::Batch;
use crate::optim::named_variables;

/// Execution mode of a forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

/// Outputs of a teacher-forced forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Shape `[batch, target_time, vocab]`.
    pub logits: Tensor,
    /// Shape `[batch, target_time, source_time]`, when the model attends.
    pub attention: Option<Tensor>,
}

/// Un-normalized loss and the weight it should be divided by.
#[derive(Debug, Clone)]
pub struct LossPair {
    pub sum: Tensor,
    pub weight: f64,
}

impl LossPair {
    /// `sum / weight`, or `sum` when the weight is zero.
    pub fn normalized(&self) -> Result<Tensor> {
        if self.weight > 0.0 {
            Ok((&self.sum / self.weight)?)
        } else {
            Ok(self.sum.clone())
        }
    }
}

/// A decoded output sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub tokens: Vec<String>,
    /// Sum of token log-probabilities.
    pub score: Option<f32>,
}

/// A trainable sequence model.
pub trait SequenceModel {
    fn varmap(&self) -> &VarMap;

    /// Trainable variables in a stable order.
    fn trainable_variables(&self) -> Result<Vec<(String, Var)>> {
        named_variables(self.varmap())
    }

    fn forward(&self, batch: &Batch, mode: Mode) -> Result<ModelOutput>;

    /// Masked token cross-entropy summed over the batch, weighted by the
    /// number of reference tokens.
    fn compute_loss(&self, output: &ModelOutput, batch: &Batch, _training: bool) -> Result<LossPair> {
        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| config_error("computing a loss requires labels"))?;
        let cross_entropy = token_cross_entropy(&output.logits, &labels.ids_out)?;
        let mask = sequence_mask(&labels.length, cross_entropy.dim(1)?, cross_entropy.device())?;
        let sum = (cross_entropy * mask)?.sum_all()?;
        Ok(LossPair {
            sum,
            weight: labels.length.iter().sum::<usize>() as f64,
        })
    }

    /// Greedy decoding of at most `max_length` tokens per example.
    fn predict(&self, batch: &Batch, max_length: usize) -> Result<Vec<Hypothesis>>;

    fn detokenize(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }

    /// Language models score their own inputs and have no labels side.
    fn unsupervised(&self) -> bool {
        false
    }
}

/// Builds a model and contributes model-specific configuration defaults.
pub trait ModelFactory {
    type Model: SequenceModel;

    /// Values layered between the built-in defaults and the user files.
    fn auto_config(&self, _num_replicas: usize) -> Option<toml::Value> {
        None
    }

    fn build(&self, config: &RunConfig, device: &Device) -> Result<Self::Model>;
}

/// Per-position cross-entropy, shape `[batch, time]`.
pub fn token_cross_entropy(logits: &Tensor, ids_out: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs
        .gather(&ids_out.unsqueeze(2)?.contiguous()?, 2)?
        .squeeze(2)?;
    Ok(picked.neg()?)
}

/// `1.0` at valid positions and `0.0` at padding, shape `[batch, time]`.
pub fn sequence_mask(lengths: &[usize], time: usize, device: &Device) -> Result<Tensor> {
    let mut mask = vec![0f32; lengths.len() * time];
    for (row, &length) in lengths.iter().enumerate() {
        for value in mask[row * time..row * time + length.min(time)].iter_mut() {
            *value = 1.0;
        }
    }
    Ok(Tensor::from_vec(mask, (lengths.len(), time), device)?)
}
