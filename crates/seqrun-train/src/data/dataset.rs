//! Parallel text datasets and batching by examples or tokens.

use std::path::Path;

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::rngs::StdRng;
use rand::SeedableRng;
use seqrun_core::{config_error, BatchType, IoResultExt, Result, TrainSection};

use super::vocab::{Vocab, BOS_ID, EOS_ID, PAD_ID};

/// One tokenized input line with its optional reference.
#[derive(Debug, Clone)]
pub struct Example {
    /// Position of the line in the input file.
    pub index: usize,
    pub source: Vec<u32>,
    pub target: Option<Vec<u32>>,
    pub target_tokens: Option<Vec<String>>,
}

impl Example {
    /// Padded cost of this example in a token-denominated batch.
    pub fn num_tokens(&self) -> usize {
        let target = self.target.as_ref().map(|t| t.len() + 1).unwrap_or(0);
        self.source.len().max(target).max(1)
    }
}

/// Reference side of a batch.
#[derive(Debug, Clone)]
pub struct Labels {
    /// `<s> t_1 .. t_n`, padded. Shape `[batch, time]`.
    pub ids_in: Tensor,
    /// `t_1 .. t_n </s>`, padded. Shape `[batch, time]`.
    pub ids_out: Tensor,
    /// Valid positions per example, including the end token.
    pub length: Vec<usize>,
    pub tokens: Vec<Vec<String>>,
}

/// A padded batch of examples.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Source ids, shape `[batch, time]`.
    pub features: Tensor,
    pub features_length: Vec<usize>,
    pub labels: Option<Labels>,
    /// Input line index per example, present when output order must be restored.
    pub index: Option<Vec<usize>>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.features_length.len()
    }

    pub fn from_examples(examples: &[&Example], with_index: bool, device: &Device) -> Result<Self> {
        if examples.is_empty() {
            return Err(config_error("cannot build an empty batch"));
        }
        let batch = examples.len();
        let features_length: Vec<usize> = examples.iter().map(|e| e.source.len()).collect();
        let source_time = features_length.iter().copied().max().unwrap_or(0).max(1);
        let mut features = vec![PAD_ID; batch * source_time];
        for (row, example) in examples.iter().enumerate() {
            features[row * source_time..row * source_time + example.source.len()]
                .copy_from_slice(&example.source);
        }
        let features = Tensor::from_vec(features, (batch, source_time), device)?;

        let labels = if examples.iter().all(|e| e.target.is_some()) {
            let targets: Vec<&Vec<u32>> = examples.iter().filter_map(|e| e.target.as_ref()).collect();
            let time = targets.iter().map(|t| t.len()).max().unwrap_or(0) + 1;
            let mut ids_in = vec![PAD_ID; batch * time];
            let mut ids_out = vec![PAD_ID; batch * time];
            for (row, target) in targets.iter().enumerate() {
                let base = row * time;
                ids_in[base] = BOS_ID;
                ids_in[base + 1..base + 1 + target.len()].copy_from_slice(target);
                ids_out[base..base + target.len()].copy_from_slice(target);
                ids_out[base + target.len()] = EOS_ID;
            }
            Some(Labels {
                ids_in: Tensor::from_vec(ids_in, (batch, time), device)?,
                ids_out: Tensor::from_vec(ids_out, (batch, time), device)?,
                length: targets.iter().map(|t| t.len() + 1).collect(),
                tokens: examples
                    .iter()
                    .map(|e| e.target_tokens.clone().unwrap_or_default())
                    .collect(),
            })
        } else {
            None
        };

        Ok(Self {
            features,
            features_length,
            labels,
            index: with_index.then(|| examples.iter().map(|e| e.index).collect()),
        })
    }
}

/// How a dataset is cut into batches.
#[derive(Debug, Clone)]
pub struct BatchingOptions {
    pub batch_size: usize,
    pub batch_type: BatchType,
    /// Shuffle window in examples. `Some(0)` shuffles the whole dataset.
    pub shuffle_buffer: Option<usize>,
    pub seed: u64,
    /// Loop over the dataset forever.
    pub repeat: bool,
    pub with_index: bool,
    /// Group examples of similar source length, reordering the stream.
    pub sort_by_length: bool,
}

impl BatchingOptions {
    /// Shuffled, repeated (unless single pass) batches for training.
    pub fn training(train: &TrainSection, batch_size: usize, seed: u64) -> Self {
        Self {
            batch_size,
            batch_type: train.batch_type,
            shuffle_buffer: Some(train.sample_buffer_size),
            seed,
            repeat: !train.single_pass,
            with_index: false,
            sort_by_length: false,
        }
    }

    /// Single pass, length-sorted batches tagged with their input index.
    pub fn inference(batch_size: usize) -> Self {
        Self {
            batch_size,
            batch_type: BatchType::Examples,
            shuffle_buffer: None,
            seed: 0,
            repeat: false,
            with_index: true,
            sort_by_length: true,
        }
    }

    /// Single pass in file order.
    pub fn evaluation(batch_size: usize) -> Self {
        Self {
            with_index: false,
            sort_by_length: false,
            ..Self::inference(batch_size)
        }
    }
}

/// An in-memory tokenized text dataset.
#[derive(Debug, Clone, Default)]
pub struct TextDataset {
    examples: Vec<Example>,
}

impl TextDataset {
    pub fn from_examples(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    /// Load whitespace-tokenized features and optional labels, one example per line.
    pub fn from_files(
        features_file: &Path,
        labels_file: Option<&Path>,
        source_vocab: &Vocab,
        target_vocab: &Vocab,
    ) -> Result<Self> {
        let features = read_lines(features_file)?;
        let labels = match labels_file {
            Some(path) => {
                let labels = read_lines(path)?;
                if labels.len() != features.len() {
                    return Err(config_error(format!(
                        "{} has {} lines but {} has {}",
                        features_file.display(),
                        features.len(),
                        path.display(),
                        labels.len()
                    )));
                }
                Some(labels)
            }
            None => None,
        };

        let examples = features
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let source = source_vocab.encode(&tokenize(line));
                let target_tokens = labels.as_ref().map(|l| tokenize(&l[index]));
                Example {
                    index,
                    source,
                    target: target_tokens.as_ref().map(|t| target_vocab.encode(t)),
                    target_tokens,
                }
            })
            .collect::<Vec<_>>();
        tracing::debug!(
            path = %features_file.display(),
            examples = examples.len(),
            "Loaded text dataset"
        );
        Ok(Self { examples })
    }

    /// Drop examples longer than the given limits.
    pub fn filter_lengths(mut self, max_features: Option<usize>, max_labels: Option<usize>) -> Self {
        let before = self.examples.len();
        self.examples.retain(|e| {
            max_features.map_or(true, |max| e.source.len() <= max)
                && max_labels.map_or(true, |max| e.target.as_ref().map_or(true, |t| t.len() <= max))
        });
        let dropped = before - self.examples.len();
        if dropped > 0 {
            tracing::info!(dropped, kept = self.examples.len(), "Filtered examples by length");
        }
        self
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn has_labels(&self) -> bool {
        !self.examples.is_empty() && self.examples.iter().all(|e| e.target.is_some())
    }

    pub fn batches(&self, options: BatchingOptions, device: &Device) -> Batches<'_> {
        let mut batches = Batches {
            dataset: self,
            rng: StdRng::seed_from_u64(options.seed),
            options,
            order: Vec::new(),
            pos: 0,
            device: device.clone(),
        };
        batches.new_epoch();
        batches
    }
}

/// Iterator over the batches of a [`TextDataset`].
pub struct Batches<'a> {
    dataset: &'a TextDataset,
    options: BatchingOptions,
    rng: StdRng,
    order: Vec<usize>,
    pos: usize,
    device: Device,
}

impl<'a> Batches<'a> {
    fn new_epoch(&mut self) {
        let examples = &self.dataset.examples;
        self.order = (0..examples.len()).collect();
        if let Some(buffer) = self.options.shuffle_buffer {
            let window = if buffer == 0 { self.order.len().max(1) } else { buffer };
            for chunk in self.order.chunks_mut(window) {
                chunk.shuffle(&mut self.rng);
            }
        }
        if self.options.sort_by_length {
            self.order.sort_by_key(|&i| examples[i].source.len());
        }
        self.pos = 0;
    }

    fn take_batch(&mut self) -> Vec<&'a Example> {
        let dataset: &'a TextDataset = self.dataset;
        let examples = &dataset.examples;
        let size = self.options.batch_size.max(1);
        let mut selected: Vec<&Example> = Vec::new();
        let mut max_tokens = 0;
        while self.pos < self.order.len() {
            let example = &examples[self.order[self.pos]];
            match self.options.batch_type {
                BatchType::Examples if selected.len() >= size => break,
                BatchType::Tokens => {
                    let padded = max_tokens.max(example.num_tokens()) * (selected.len() + 1);
                    if !selected.is_empty() && padded > size {
                        break;
                    }
                    max_tokens = max_tokens.max(example.num_tokens());
                }
                _ => {}
            }
            selected.push(example);
            self.pos += 1;
        }
        selected
    }
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dataset.is_empty() {
            return None;
        }
        if self.pos >= self.order.len() {
            if !self.options.repeat {
                return None;
            }
            self.new_epoch();
        }
        let selected = self.take_batch();
        Some(Batch::from_examples(
            &selected,
            self.options.with_index,
            &self.device,
        ))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).with_path(path)?;
    Ok(content.lines().map(str::to_string).collect())
}

fn tokenize(line: &str) -> Vec<String> {
    line.split_whitespace().map(str::to_string).collect()
}
