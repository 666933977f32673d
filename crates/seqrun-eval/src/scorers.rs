//! External scorers run on evaluation predictions against reference files.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use seqrun_core::{config_error, IoResultExt, Result, ScorerKind};

use crate::evaluate::ResultsConsumer;

/// Scores a set of hypotheses against aligned references.
pub trait Scorer {
    fn name(&self) -> &'static str;

    /// Higher is better.
    fn score(&self, references: &[String], hypotheses: &[String]) -> f64;
}

pub fn make_scorer(kind: ScorerKind) -> Box<dyn Scorer> {
    match kind {
        ScorerKind::Bleu => Box::new(Bleu::default()),
        ScorerKind::Accuracy => Box::new(SentenceAccuracy),
    }
}

/// Corpus BLEU with uniform n-gram weights and the brevity penalty,
/// on whitespace tokens, scaled to `[0, 100]`.
#[derive(Debug, Clone)]
pub struct Bleu {
    max_order: usize,
}

impl Default for Bleu {
    fn default() -> Self {
        Self { max_order: 4 }
    }
}

impl Bleu {
    pub fn with_max_order(max_order: usize) -> Self {
        Self {
            max_order: max_order.max(1),
        }
    }
}

impl Scorer for Bleu {
    fn name(&self) -> &'static str {
        "bleu"
    }

    fn score(&self, references: &[String], hypotheses: &[String]) -> f64 {
        let mut matches = vec![0usize; self.max_order];
        let mut totals = vec![0usize; self.max_order];
        let mut reference_length = 0;
        let mut hypothesis_length = 0;

        for (reference, hypothesis) in references.iter().zip(hypotheses) {
            let reference: Vec<&str> = reference.split_whitespace().collect();
            let hypothesis: Vec<&str> = hypothesis.split_whitespace().collect();
            reference_length += reference.len();
            hypothesis_length += hypothesis.len();

            for n in 1..=self.max_order {
                let reference_counts = ngram_counts(&reference, n);
                for (ngram, count) in ngram_counts(&hypothesis, n) {
                    let clip = reference_counts.get(&ngram).copied().unwrap_or(0);
                    matches[n - 1] += count.min(clip);
                }
                totals[n - 1] += hypothesis.len().saturating_sub(n - 1);
            }
        }

        if hypothesis_length == 0 || matches.iter().any(|&m| m == 0) {
            return 0.0;
        }
        let log_precision: f64 = matches
            .iter()
            .zip(&totals)
            .map(|(&m, &t)| (m as f64 / t as f64).ln())
            .sum::<f64>()
            / self.max_order as f64;
        let brevity_penalty = if hypothesis_length < reference_length {
            (1.0 - reference_length as f64 / hypothesis_length as f64).exp()
        } else {
            1.0
        };
        100.0 * brevity_penalty * log_precision.exp()
    }
}

fn ngram_counts<'a>(tokens: &[&'a str], n: usize) -> HashMap<Vec<&'a str>, usize> {
    let mut counts = HashMap::new();
    for window in tokens.windows(n) {
        *counts.entry(window.to_vec()).or_insert(0) += 1;
    }
    counts
}

/// Percentage of hypotheses whose tokens equal the reference tokens.
#[derive(Debug, Clone, Copy)]
pub struct SentenceAccuracy;

impl Scorer for SentenceAccuracy {
    fn name(&self) -> &'static str {
        "accuracy"
    }

    fn score(&self, references: &[String], hypotheses: &[String]) -> f64 {
        let total = references.len().min(hypotheses.len());
        if total == 0 {
            return 0.0;
        }
        let exact = references
            .iter()
            .zip(hypotheses)
            .filter(|(r, h)| r.split_whitespace().eq(h.split_whitespace()))
            .count();
        100.0 * exact as f64 / total as f64
    }
}

/// One line of `scores.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub step: usize,
    pub scorer: String,
    pub score: f64,
}

/// Scores every evaluation cycle against a labels file and appends the
/// results to `<output_dir>/scores.jsonl`.
pub struct ExternalEvaluator {
    references: Vec<String>,
    output_dir: PathBuf,
    scorers: Vec<Box<dyn Scorer>>,
}

impl ExternalEvaluator {
    pub fn new(labels_file: &Path, output_dir: impl Into<PathBuf>, scorers: Vec<Box<dyn Scorer>>) -> Result<Self> {
        let text = std::fs::read_to_string(labels_file).with_path(labels_file)?;
        Ok(Self {
            references: text.lines().map(str::to_string).collect(),
            output_dir: output_dir.into(),
            scorers,
        })
    }

    pub fn from_kinds(labels_file: &Path, output_dir: impl Into<PathBuf>, kinds: &[ScorerKind]) -> Result<Self> {
        Self::new(labels_file, output_dir, kinds.iter().copied().map(make_scorer).collect())
    }

    pub fn scores_path(&self) -> PathBuf {
        self.output_dir.join("scores.jsonl")
    }

    pub fn score(&self, step: usize, predictions: &[String]) -> Result<Vec<ScoreReport>> {
        if predictions.len() != self.references.len() {
            return Err(config_error(format!(
                "{} predictions for {} references",
                predictions.len(),
                self.references.len()
            )));
        }
        Ok(self
            .scorers
            .iter()
            .map(|scorer| ScoreReport {
                step,
                scorer: scorer.name().to_string(),
                score: scorer.score(&self.references, predictions),
            })
            .collect())
    }
}

impl ResultsConsumer for ExternalEvaluator {
    fn consume(&mut self, step: usize, predictions: &[String]) -> Result<()> {
        let reports = self.score(step, predictions)?;
        std::fs::create_dir_all(&self.output_dir).with_path(&self.output_dir)?;
        let path = self.scores_path();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_path(&path)?;
        for report in &reports {
            tracing::info!(step, scorer = %report.scorer, score = report.score, "Evaluation score");
            writeln!(file, "{}", serde_json::to_string(report)?).with_path(&path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &[&str]) -> Vec<String> {
        text.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_bleu_bounds() {
        let refs = lines(&["the cat sat on the mat", "a b c d e"]);
        assert!((Bleu::default().score(&refs, &refs) - 100.0).abs() < 1e-9);
        assert_eq!(Bleu::default().score(&refs, &lines(&["x y z", "q r s t"])), 0.0);
    }

    #[test]
    fn test_bleu_brevity_penalty() {
        let refs = lines(&["a b c d"]);
        let short = Bleu::with_max_order(1).score(&refs, &lines(&["a b"]));
        // Unigram precision is 1, so only the brevity penalty remains.
        assert!((short - 100.0 * (-1.0f64).exp()).abs() < 1e-9, "got {}", short);
    }

    #[test]
    fn test_bleu_clips_repeated_ngrams() {
        let refs = lines(&["a b"]);
        let score = Bleu::with_max_order(1).score(&refs, &lines(&["a a"]));
        assert!((score - 50.0).abs() < 1e-9, "got {}", score);
    }

    #[test]
    fn test_sentence_accuracy_ignores_spacing() {
        let refs = lines(&["x y", "z", "x  z"]);
        let hyps = lines(&["x y", "y", "x z"]);
        let score = SentenceAccuracy.score(&refs, &hyps);
        assert!((score - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_consumer_appends_reports() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let labels = tmp.path().join("ref.txt");
        std::fs::write(&labels, "x y\nz\n")?;
        let out = tmp.path().join("external_eval");
        let mut evaluator =
            ExternalEvaluator::from_kinds(&labels, &out, &[ScorerKind::Bleu, ScorerKind::Accuracy])?;

        evaluator.consume(5, &lines(&["x y", "y"]))?;
        evaluator.consume(10, &lines(&["x y", "z"]))?;

        let reports: Vec<ScoreReport> = std::fs::read_to_string(evaluator.scores_path())?
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[1], ScoreReport { step: 5, scorer: "accuracy".into(), score: 50.0 });
        assert_eq!(reports[3], ScoreReport { step: 10, scorer: "accuracy".into(), score: 100.0 });
        Ok(())
    }

    #[test]
    fn test_prediction_count_must_match_references() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let labels = tmp.path().join("ref.txt");
        std::fs::write(&labels, "x y\nz\n")?;
        let mut evaluator = ExternalEvaluator::from_kinds(&labels, tmp.path(), &[ScorerKind::Bleu])?;
        assert!(evaluator.consume(1, &lines(&["x y"])).unwrap_err().is_configuration());
        Ok(())
    }
}
