//! Inference, scoring and evaluation for seqrun models.
//!
//! Provides:
//! - An order-restoring collector for records completed out of order
//! - Inference and scoring loops writing one line per example
//! - Evaluation with loss, perplexity and prediction consumers
//! - External BLEU and accuracy scorers on evaluation predictions

pub mod evaluate;
pub mod infer;
pub mod order;
pub mod output;
pub mod scorers;

pub use evaluate::{EvaluationResult, Evaluator, PeriodicEvaluator, ResultsConsumer, SavePredictions};
pub use infer::{infer, score, InferenceStats};
pub use order::{OrderRestorer, RecordSink};
pub use output::{format_translation_output, LineWriter, OutputStream};
pub use scorers::{make_scorer, Bleu, ExternalEvaluator, ScoreReport, Scorer, SentenceAccuracy};
