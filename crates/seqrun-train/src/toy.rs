//! A small attentional sequence model.
//!
//! Source tokens are embedded and mean-pooled into a context vector. Each
//! target position combines its input embedding with that context, attends
//! over the source embeddings and projects to the target vocabulary. It is
//! cheap enough to train on CPU and exercises every part of the runner.

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Embedding, Linear, VarBuilder, VarMap};
use seqrun_core::{config_error, Result, RunConfig};

use crate::data::vocab::{Vocab, BOS_ID, EOS_ID};
use crate::data::Batch;
use crate::model::{sequence_mask, Hypothesis, Mode, ModelFactory, ModelOutput, SequenceModel};

pub struct TokenTagger {
    varmap: VarMap,
    source_embedding: Embedding,
    target_embedding: Embedding,
    output: Linear,
    target_vocab: Vocab,
    device: Device,
}

struct Encoded {
    /// `[batch, source_time, hidden]`
    memory: Tensor,
    /// `[batch, 1, source_time]`, 0 at valid positions and -1e9 at padding.
    attention_bias: Tensor,
    /// `[batch, hidden]`
    context: Tensor,
}

impl TokenTagger {
    pub fn new(source_vocab: &Vocab, target_vocab: Vocab, hidden_size: usize, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let source_embedding =
            candle_nn::embedding(source_vocab.len(), hidden_size, vb.pp("source_embedding"))?;
        let target_embedding =
            candle_nn::embedding(target_vocab.len(), hidden_size, vb.pp("target_embedding"))?;
        let output = candle_nn::linear(hidden_size, target_vocab.len(), vb.pp("output"))?;
        Ok(Self {
            varmap,
            source_embedding,
            target_embedding,
            output,
            target_vocab,
            device: device.clone(),
        })
    }

    pub fn target_vocab(&self) -> &Vocab {
        &self.target_vocab
    }

    fn encode(&self, batch: &Batch) -> Result<Encoded> {
        let memory = self.source_embedding.forward(&batch.features)?;
        let source_time = memory.dim(1)?;
        let mask = sequence_mask(&batch.features_length, source_time, &self.device)?;

        let summed = memory.broadcast_mul(&mask.unsqueeze(2)?)?.sum(1)?;
        let counts: Vec<f32> = batch
            .features_length
            .iter()
            .map(|&n| n.max(1) as f32)
            .collect();
        let counts = Tensor::from_vec(counts, (batch.size(), 1), &self.device)?;
        let context = summed.broadcast_div(&counts)?;

        let attention_bias = ((mask - 1.0)? * 1e9)?.unsqueeze(1)?;
        Ok(Encoded {
            memory,
            attention_bias,
            context,
        })
    }

    fn decode(&self, encoded: &Encoded, ids_in: &Tensor) -> Result<ModelOutput> {
        let inputs = self.target_embedding.forward(ids_in)?;
        let state = inputs
            .broadcast_add(&encoded.context.unsqueeze(1)?)?
            .tanh()?;

        let keys = encoded.memory.transpose(1, 2)?.contiguous()?;
        let scores = state.contiguous()?.matmul(&keys)?.broadcast_add(&encoded.attention_bias)?;
        let attention = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attended = attention.matmul(&encoded.memory)?;

        let logits = self.output.forward(&(state + attended)?)?;
        Ok(ModelOutput {
            logits,
            attention: Some(attention),
        })
    }
}

impl SequenceModel for TokenTagger {
    fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    fn forward(&self, batch: &Batch, mode: Mode) -> Result<ModelOutput> {
        let labels = batch.labels.as_ref().ok_or_else(|| {
            config_error(format!("{:?} forward pass requires labels", mode))
        })?;
        let encoded = self.encode(batch)?;
        self.decode(&encoded, &labels.ids_in)
    }

    fn predict(&self, batch: &Batch, max_length: usize) -> Result<Vec<Hypothesis>> {
        let encoded = self.encode(batch)?;
        let size = batch.size();
        let mut inputs: Vec<Vec<u32>> = vec![vec![BOS_ID]; size];
        let mut outputs: Vec<Vec<u32>> = vec![Vec::new(); size];
        let mut scores = vec![0f32; size];
        let mut finished = vec![false; size];

        for step in 0..max_length {
            let time = step + 1;
            let flat: Vec<u32> = inputs.iter().flatten().copied().collect();
            let ids_in = Tensor::from_vec(flat, (size, time), &self.device)?;
            let logits = self.decode(&encoded, &ids_in)?.logits;
            let last = logits.narrow(1, time - 1, 1)?.squeeze(1)?;
            let log_probs = candle_nn::ops::log_softmax(&last, D::Minus1)?;
            let best = log_probs.argmax(D::Minus1)?.to_vec1::<u32>()?;
            let log_probs = log_probs.to_vec2::<f32>()?;

            for row in 0..size {
                let token = if finished[row] { EOS_ID } else { best[row] };
                if !finished[row] {
                    scores[row] += log_probs[row][token as usize];
                    if token == EOS_ID {
                        finished[row] = true;
                    } else {
                        outputs[row].push(token);
                    }
                }
                inputs[row].push(token);
            }
            if finished.iter().all(|&done| done) {
                break;
            }
        }

        Ok(outputs
            .into_iter()
            .zip(scores)
            .map(|(ids, score)| Hypothesis {
                tokens: ids
                    .iter()
                    .map(|&id| self.target_vocab.token(id).to_string())
                    .collect(),
                score: Some(score),
            })
            .collect())
    }
}

/// Builds a [`TokenTagger`] from the `[data]` vocabularies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenTaggerFactory;

impl ModelFactory for TokenTaggerFactory {
    type Model = TokenTagger;

    fn auto_config(&self, _num_replicas: usize) -> Option<toml::Value> {
        let mut train = toml::map::Map::new();
        train.insert("batch_type".into(), toml::Value::String("tokens".into()));
        train.insert("maximum_features_length".into(), toml::Value::Integer(100));
        train.insert("maximum_labels_length".into(), toml::Value::Integer(100));
        let mut params = toml::map::Map::new();
        params.insert("learning_rate".into(), toml::Value::Float(0.001));

        let mut root = toml::map::Map::new();
        root.insert("train".into(), toml::Value::Table(train));
        root.insert("params".into(), toml::Value::Table(params));
        Some(toml::Value::Table(root))
    }

    fn build(&self, config: &RunConfig, device: &Device) -> Result<TokenTagger> {
        let source = config
            .data
            .source_vocabulary
            .as_ref()
            .ok_or_else(|| config_error("data.source_vocabulary is required"))?;
        let target = config
            .data
            .target_vocabulary
            .as_ref()
            .ok_or_else(|| config_error("data.target_vocabulary is required"))?;
        let source_vocab = Vocab::from_file(source)?;
        let target_vocab = Vocab::from_file(target)?;
        TokenTagger::new(&source_vocab, target_vocab, config.params.hidden_size, device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dataset::Example;

    fn tagger() -> Result<TokenTagger> {
        let vocab = Vocab::from_tokens(["a", "b", "c"]);
        TokenTagger::new(&vocab, vocab.clone(), 8, &Device::Cpu)
    }

    fn batch(with_labels: bool) -> Result<Batch> {
        let a = Example {
            index: 0,
            source: vec![4, 5],
            target: with_labels.then(|| vec![4]),
            target_tokens: with_labels.then(|| vec!["a".to_string()]),
        };
        let b = Example {
            index: 1,
            source: vec![6],
            target: with_labels.then(|| vec![5, 6]),
            target_tokens: with_labels.then(|| vec!["b".to_string(), "c".to_string()]),
        };
        Batch::from_examples(&[&a, &b], true, &Device::Cpu)
    }

    #[test]
    fn test_forward_shapes() -> Result<()> {
        let model = tagger()?;
        let output = model.forward(&batch(true)?, Mode::Train)?;
        assert_eq!(output.logits.dims(), &[2, 3, 7]);
        let attention = output.attention.unwrap();
        assert_eq!(attention.dims(), &[2, 3, 2]);

        // The second example has one source token, so padding gets no weight.
        let rows = attention.to_vec3::<f32>()?;
        for row in &rows[1] {
            assert!(row[1] < 1e-6);
            assert!((row[0] - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_forward_requires_labels() -> Result<()> {
        let model = tagger()?;
        assert!(model.forward(&batch(false)?, Mode::Eval).is_err());
        Ok(())
    }

    #[test]
    fn test_loss_is_weighted_by_reference_tokens() -> Result<()> {
        let model = tagger()?;
        let batch = batch(true)?;
        let output = model.forward(&batch, Mode::Train)?;
        let loss = model.compute_loss(&output, &batch, true)?;
        assert_eq!(loss.weight, 5.0);
        assert!(loss.normalized()?.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn test_predict_respects_max_length() -> Result<()> {
        let model = tagger()?;
        let hypotheses = model.predict(&batch(false)?, 3)?;
        assert_eq!(hypotheses.len(), 2);
        for hyp in &hypotheses {
            assert!(hyp.tokens.len() <= 3);
            assert!(hyp.score.unwrap() <= 0.0);
        }
        assert!(model.predict(&batch(false)?, 0)?.iter().all(|h| h.tokens.is_empty()));
        Ok(())
    }

    #[test]
    fn test_factory_requires_vocabularies() {
        let config = RunConfig::new("run");
        let err = TokenTaggerFactory.build(&config, &Device::Cpu).err().unwrap();
        assert!(err.is_configuration());
        assert!(TokenTaggerFactory.auto_config(1).is_some());
    }
}
