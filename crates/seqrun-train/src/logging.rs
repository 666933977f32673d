//! Structured logging for training and evaluation with tracing.

use tracing::{error, info, span, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format of the global subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable console output.
    #[default]
    Pretty,
    /// One JSON object per event, for production monitoring.
    Json,
}

const DEFAULT_FILTER: &str = "info,seqrun_core=info,seqrun_train=info,seqrun_eval=info,seqrun_cli=info";

/// Initialize the global subscriber.
///
/// Reads the filter from RUST_LOG (defaults to "info" for seqrun crates).
pub fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

/// Status line emitted every `save_summary_steps` optimizer steps.
///
/// `rates` holds `(counter, elements per second)` since the previous report.
pub fn log_training_status(step: usize, rates: &[(String, f64)], learning_rate: f64, loss: f64) {
    let span = span!(Level::INFO, "training_status", step = step);
    let _enter = span.enter();

    if !loss.is_finite() {
        error!(step, loss, "Training diverged! NaN or infinite loss detected");
    }

    let throughput = rates
        .iter()
        .map(|(name, rate)| format!("{} words/s = {}", name, *rate as u64))
        .collect::<Vec<_>>()
        .join(", ");
    info!(
        step,
        learning_rate,
        loss,
        event = "training_status",
        "Step = {} ; {} ; Learning rate = {:.6} ; Loss = {:.6}",
        step,
        throughput,
        learning_rate,
        loss
    );
}

/// Log checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str, loss: Option<f64>) {
    info!(
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Saved checkpoint {}",
        path
    );
}

/// Log evaluation results.
pub fn log_evaluation(step: usize, eval_loss: f64, eval_ppl: f64) {
    info!(
        step = step,
        eval_loss = eval_loss,
        eval_perplexity = eval_ppl,
        event = "evaluation",
        "Evaluation completed"
    );
}
