//! Evaluation loop: loss, perplexity and optional saved predictions.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::Device;
use seqrun_core::{config_error, EvalSection, Result};
use seqrun_train::checkpoint::CheckpointRecord;
use seqrun_train::data::{BatchingOptions, TextDataset};
use seqrun_train::logging::log_evaluation;
use seqrun_train::model::{Mode, SequenceModel};
use seqrun_train::train::CheckpointHook;

use crate::order::{OrderRestorer, RecordSink};
use crate::output::{LineWriter, OutputStream};
use crate::scorers::ExternalEvaluator;

/// Metrics of one evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub step: usize,
    /// Average cross-entropy per reference token (nats).
    pub loss: f64,
    /// `exp(loss)`.
    pub perplexity: f64,
    pub num_tokens: usize,
    /// Detokenized predictions in input order, when requested.
    pub predictions: Option<Vec<String>>,
}

/// Receives the predictions of every evaluation cycle.
pub trait ResultsConsumer {
    fn consume(&mut self, step: usize, predictions: &[String]) -> Result<()>;
}

/// Writes predictions to `<dir>/predictions.txt.<step>`.
#[derive(Debug, Clone)]
pub struct SavePredictions {
    dir: PathBuf,
}

impl SavePredictions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `model_dir/eval`.
    pub fn in_model_dir(model_dir: &Path) -> Self {
        Self::new(model_dir.join("eval"))
    }

    pub fn path_for(&self, step: usize) -> PathBuf {
        self.dir.join(format!("predictions.txt.{}", step))
    }
}

impl ResultsConsumer for SavePredictions {
    fn consume(&mut self, step: usize, predictions: &[String]) -> Result<()> {
        let path = self.path_for(step);
        let mut writer = LineWriter::new(OutputStream::open(Some(path.as_path()))?);
        for line in predictions {
            writer.write(line.clone())?;
        }
        writer.into_inner().finish()?;
        tracing::info!(step, path = %path.display(), "Saved evaluation predictions");
        Ok(())
    }
}

/// Runs evaluation passes over a labelled dataset.
pub struct Evaluator {
    dataset: TextDataset,
    batch_size: usize,
    max_decoding_length: usize,
    save_predictions: bool,
    consumers: Vec<Box<dyn ResultsConsumer>>,
}

impl Evaluator {
    pub fn new(dataset: TextDataset, batch_size: usize, max_decoding_length: usize) -> Result<Self> {
        if !dataset.has_labels() {
            return Err(config_error("evaluation requires a labels file"));
        }
        Ok(Self {
            dataset,
            batch_size,
            max_decoding_length,
            save_predictions: false,
            consumers: Vec::new(),
        })
    }

    /// Enable predictions with the `[eval]` section; predictions are then
    /// written under `model_dir/eval`, and external scores under
    /// `model_dir/external_eval` against `labels_file`.
    pub fn from_config(
        dataset: TextDataset,
        eval: &EvalSection,
        max_decoding_length: usize,
        model_dir: &Path,
        labels_file: Option<&Path>,
    ) -> Result<Self> {
        let mut evaluator = Self::new(dataset, eval.batch_size, max_decoding_length)?;
        let external = !eval.external_evaluators.is_empty();
        if eval.save_eval_predictions || external {
            evaluator = evaluator.with_consumer(Box::new(SavePredictions::in_model_dir(model_dir)));
        }
        if external {
            let labels_file = labels_file
                .ok_or_else(|| config_error("external evaluators require data.eval_labels_file"))?;
            evaluator = evaluator.with_consumer(Box::new(ExternalEvaluator::from_kinds(
                labels_file,
                model_dir.join("external_eval"),
                &eval.external_evaluators,
            )?));
        }
        Ok(evaluator)
    }

    /// Register a consumer; predictions are produced from then on.
    pub fn with_consumer(mut self, consumer: Box<dyn ResultsConsumer>) -> Self {
        self.save_predictions = true;
        self.consumers.push(consumer);
        self
    }

    pub fn saves_predictions(&self) -> bool {
        self.save_predictions
    }

    pub fn evaluate<M: SequenceModel>(
        &mut self,
        model: &M,
        device: &Device,
        step: usize,
    ) -> Result<EvaluationResult> {
        if self.save_predictions && model.unsupervised() {
            return Err(config_error(
                "this model does not support saving evaluation predictions",
            ));
        }

        let mut loss_sum = 0f64;
        let mut weight = 0f64;
        let mut predictions = OrderRestorer::new(Vec::new());
        let mut options = BatchingOptions::evaluation(self.batch_size);
        options.with_index = self.save_predictions;

        for batch in self.dataset.batches(options, device) {
            let batch = batch?;
            let output = model.forward(&batch, Mode::Eval)?;
            let loss = model.compute_loss(&output, &batch, false)?;
            loss_sum += loss.sum.to_scalar::<f32>()? as f64;
            weight += loss.weight;

            if self.save_predictions {
                let hypotheses = model.predict(&batch, self.max_decoding_length)?;
                let index = batch.index.as_ref().ok_or_else(|| {
                    config_error("evaluation batches are missing example indices")
                })?;
                for (i, hypothesis) in hypotheses.iter().enumerate() {
                    predictions.push(index[i], model.detokenize(&hypothesis.tokens))?;
                }
            }
        }

        let loss = if weight > 0.0 { loss_sum / weight } else { 0.0 };
        let perplexity = loss.exp();
        log_evaluation(step, loss, perplexity);

        let predictions = if self.save_predictions {
            let predictions = predictions.into_sink();
            for consumer in self.consumers.iter_mut() {
                consumer.consume(step, &predictions)?;
            }
            Some(predictions)
        } else {
            None
        };

        Ok(EvaluationResult {
            step,
            loss,
            perplexity,
            num_tokens: weight as usize,
            predictions,
        })
    }
}

/// Evaluates after checkpoint saves, at most once every `delay`.
pub struct PeriodicEvaluator {
    evaluator: Evaluator,
    device: Device,
    delay: Duration,
    last_run: Option<Instant>,
    last_step: Option<usize>,
    results: Vec<EvaluationResult>,
}

impl PeriodicEvaluator {
    pub fn new(evaluator: Evaluator, device: Device, delay: Duration) -> Self {
        Self {
            evaluator,
            device,
            delay,
            last_run: None,
            last_step: None,
            results: Vec::new(),
        }
    }

    pub fn results(&self) -> &[EvaluationResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<EvaluationResult> {
        self.results
    }

    fn due(&self) -> bool {
        self.last_run.map_or(true, |last| last.elapsed() >= self.delay)
    }

    /// Evaluate at `step` unless that step was already evaluated.
    pub fn evaluate_now<M: SequenceModel>(&mut self, model: &M, step: usize) -> Result<()> {
        if self.last_step == Some(step) {
            return Ok(());
        }
        let result = self.evaluator.evaluate(model, &self.device, step)?;
        self.last_run = Some(Instant::now());
        self.last_step = Some(step);
        self.results.push(result);
        Ok(())
    }
}

impl<M: SequenceModel> CheckpointHook<M> for PeriodicEvaluator {
    fn after_save(&mut self, model: &M, record: &CheckpointRecord) -> Result<()> {
        if self.due() {
            self.evaluate_now(model, record.step)
        } else {
            tracing::debug!(step = record.step, "Skipping evaluation until eval_delay has elapsed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use seqrun_train::data::{Example, Vocab};
    use seqrun_train::toy::TokenTagger;

    struct Collect(Rc<RefCell<Vec<(usize, Vec<String>)>>>);

    impl ResultsConsumer for Collect {
        fn consume(&mut self, step: usize, predictions: &[String]) -> Result<()> {
            self.0.borrow_mut().push((step, predictions.to_vec()));
            Ok(())
        }
    }

    fn dataset(with_labels: bool) -> TextDataset {
        let sources: [&[u32]; 3] = [&[4, 5, 6], &[5], &[6, 4]];
        TextDataset::from_examples(
            sources
                .iter()
                .enumerate()
                .map(|(index, source)| Example {
                    index,
                    source: source.to_vec(),
                    target: with_labels.then(|| source.to_vec()),
                    target_tokens: with_labels.then(|| vec!["x".to_string(); source.len()]),
                })
                .collect(),
        )
    }

    fn tagger() -> Result<TokenTagger> {
        let vocab = Vocab::from_tokens(["a", "b", "c"]);
        TokenTagger::new(&vocab, vocab.clone(), 8, &Device::Cpu)
    }

    #[test]
    fn test_requires_labels() {
        assert!(Evaluator::new(dataset(false), 2, 5).is_err());
    }

    #[test]
    fn test_loss_and_perplexity() -> Result<()> {
        let model = tagger()?;
        let mut evaluator = Evaluator::new(dataset(true), 2, 5)?;
        let result = evaluator.evaluate(&model, &Device::Cpu, 7)?;
        assert_eq!(result.step, 7);
        // Six reference tokens plus one end token per example.
        assert_eq!(result.num_tokens, 9);
        assert!(result.loss > 0.0);
        assert!((result.perplexity - result.loss.exp()).abs() < 1e-9);
        assert!(result.predictions.is_none());
        Ok(())
    }

    #[test]
    fn test_consumers_receive_ordered_predictions() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let model = tagger()?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut evaluator = Evaluator::new(dataset(true), 2, 4)?
            .with_consumer(Box::new(SavePredictions::in_model_dir(tmp.path())))
            .with_consumer(Box::new(Collect(seen.clone())));
        let result = evaluator.evaluate(&model, &Device::Cpu, 3)?;

        let predictions = result.predictions.expect("predictions");
        assert_eq!(predictions.len(), 3);
        assert_eq!(seen.borrow().as_slice(), &[(3, predictions.clone())]);

        let saved = std::fs::read_to_string(tmp.path().join("eval/predictions.txt.3"))?;
        assert_eq!(saved.lines().count(), 3);
        assert_eq!(saved.lines().collect::<Vec<_>>(), predictions);
        Ok(())
    }

    #[test]
    fn test_external_evaluators_score_predictions() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let labels = tmp.path().join("eval.tgt");
        std::fs::write(&labels, "x x x\nx\nx x\n")?;
        let eval = EvalSection {
            batch_size: 2,
            external_evaluators: vec![seqrun_core::ScorerKind::Accuracy],
            ..EvalSection::default()
        };
        let mut evaluator = Evaluator::from_config(dataset(true), &eval, 4, tmp.path(), Some(&labels))?;
        assert!(evaluator.saves_predictions());
        evaluator.evaluate(&tagger()?, &Device::Cpu, 9)?;

        assert!(tmp.path().join("eval/predictions.txt.9").is_file());
        let scores = std::fs::read_to_string(tmp.path().join("external_eval/scores.jsonl"))?;
        assert_eq!(scores.lines().count(), 1);
        assert!(scores.contains("\"step\":9"), "{}", scores);

        let missing = Evaluator::from_config(dataset(true), &eval, 4, tmp.path(), None);
        assert!(missing.err().map_or(false, |e| e.is_configuration()));
        Ok(())
    }

    #[test]
    fn test_periodic_evaluation_is_throttled() -> Result<()> {
        let model = tagger()?;
        let evaluator = Evaluator::new(dataset(true), 2, 4)?;
        let mut periodic = PeriodicEvaluator::new(evaluator, Device::Cpu, Duration::from_secs(3600));
        let record = |step| CheckpointRecord {
            step,
            path: PathBuf::from(format!("step_{}", step)),
        };

        periodic.after_save(&model, &record(10))?;
        periodic.after_save(&model, &record(20))?;
        periodic.evaluate_now(&model, 20)?;
        periodic.evaluate_now(&model, 20)?;

        let steps: Vec<usize> = periodic.results().iter().map(|r| r.step).collect();
        assert_eq!(steps, vec![10, 20]);
        Ok(())
    }
}
