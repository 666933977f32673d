//! Inference and scoring loops.
//!
//! Both loops run the model without gradients, split each batch into
//! per-example lines and write them to a [`RecordSink`]. Batches carrying an
//! `index` are routed through an [`OrderRestorer`] so lines come out in input
//! order even when batches were reordered by length.

use std::time::{Duration, Instant};

use candle_core::D;
use seqrun_core::{config_error, Result, ScoreSection};
use seqrun_train::data::Batch;
use seqrun_train::model::{sequence_mask, token_cross_entropy, Mode, SequenceModel};

use crate::order::{OrderRestorer, RecordSink};
use crate::output::format_translation_output;

/// Aggregate timing of an inference or scoring run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceStats {
    /// Time spent in the model only.
    pub total_time: Duration,
    pub examples: usize,
    pub tokens: usize,
}

impl InferenceStats {
    pub fn log(&self) {
        let seconds = self.total_time.as_secs_f64();
        tracing::info!("Total prediction time (s): {:.6}", seconds);
        if self.examples > 0 {
            tracing::info!(
                "Average prediction time (s): {:.6}",
                seconds / self.examples as f64
            );
        }
        if self.tokens > 0 && seconds > 0.0 {
            tracing::info!("Tokens per second: {:.6}", self.tokens as f64 / seconds);
        }
    }
}

/// Writes records directly, or in index order once an indexed record shows up.
struct RecordRouter<S> {
    direct: Option<S>,
    ordered: Option<OrderRestorer<String, S>>,
}

impl<S: RecordSink<String>> RecordRouter<S> {
    fn new(sink: S) -> Self {
        Self {
            direct: Some(sink),
            ordered: None,
        }
    }

    fn emit(&mut self, index: Option<usize>, record: String) -> Result<()> {
        match index {
            Some(index) => {
                if self.ordered.is_none() {
                    let sink = self
                        .direct
                        .take()
                        .ok_or_else(|| config_error("output sink already released"))?;
                    self.ordered = Some(OrderRestorer::new(sink));
                }
                if let Some(restorer) = self.ordered.as_mut() {
                    restorer.push(index, record)?;
                }
                Ok(())
            }
            None => match self.direct.as_mut() {
                Some(sink) => sink.write(record),
                None => Err(config_error(
                    "batch without example indices in an index-ordered stream",
                )),
            },
        }
    }

    fn finish(self) {
        if let Some(restorer) = self.ordered {
            restorer.into_sink();
        }
    }
}

/// Decode every batch and write one detokenized line per example.
pub fn infer<M, I, S>(
    model: &M,
    batches: I,
    max_length: usize,
    sink: S,
    log_time: bool,
) -> Result<InferenceStats>
where
    M: SequenceModel,
    I: IntoIterator<Item = Result<Batch>>,
    S: RecordSink<String>,
{
    let mut router = RecordRouter::new(sink);
    let mut stats = InferenceStats::default();

    for batch in batches {
        let batch = batch?;
        let start = Instant::now();
        let hypotheses = model.predict(&batch, max_length)?;
        stats.total_time += start.elapsed();
        stats.examples += batch.size();

        for (i, hypothesis) in hypotheses.iter().enumerate() {
            stats.tokens += hypothesis.tokens.len();
            let index = batch.index.as_ref().map(|index| index[i]);
            router.emit(index, model.detokenize(&hypothesis.tokens))?;
        }
    }
    router.finish();

    if log_time {
        stats.log();
    }
    Ok(stats)
}

/// Score reference labels: one `score ||| sentence` line per example, where
/// the score is the summed cross-entropy over valid positions.
pub fn score<M, I, S>(
    model: &M,
    batches: I,
    options: &ScoreSection,
    sink: S,
    log_time: bool,
) -> Result<InferenceStats>
where
    M: SequenceModel,
    I: IntoIterator<Item = Result<Batch>>,
    S: RecordSink<String>,
{
    let mut router = RecordRouter::new(sink);
    let mut stats = InferenceStats::default();

    for batch in batches {
        let batch = batch?;
        let labels = batch
            .labels
            .as_ref()
            .ok_or_else(|| config_error("scoring requires reference labels"))?;

        let start = Instant::now();
        let output = model.forward(&batch, Mode::Eval)?;
        let cross_entropy = token_cross_entropy(&output.logits, &labels.ids_out)?;
        let mask = sequence_mask(&labels.length, cross_entropy.dim(1)?, cross_entropy.device())?;
        let scores = (&cross_entropy * mask)?.sum(D::Minus1)?.to_vec1::<f32>()?;
        let cross_entropy = cross_entropy.to_vec2::<f32>()?;
        let attention = match (&output.attention, options.with_alignments) {
            (Some(attention), Some(_)) => Some(attention.to_vec3::<f32>()?),
            _ => None,
        };
        stats.total_time += start.elapsed();
        stats.examples += batch.size();

        for b in 0..batch.size() {
            // The end token is scored but not printed.
            let length = labels.length[b].saturating_sub(1);
            let tokens = &labels.tokens[b][..length.min(labels.tokens[b].len())];
            stats.tokens += tokens.len();

            let token_scores = options
                .with_token_level
                .then(|| &cross_entropy[b][..length]);
            let alignments = attention.as_ref().map(|attention| {
                let source_length = batch.features_length[b];
                attention[b][..length]
                    .iter()
                    .map(|row| row[..source_length.min(row.len())].to_vec())
                    .collect::<Vec<_>>()
            });
            let line = format_translation_output(
                &model.detokenize(tokens),
                Some(scores[b]),
                token_scores,
                alignments.as_deref(),
                options.with_alignments,
            );
            let index = batch.index.as_ref().map(|index| index[b]);
            router.emit(index, line)?;
        }
    }
    router.finish();

    if log_time {
        stats.log();
    }
    Ok(stats)
}
