//! # Seqrun Training Library
//!
//! Training orchestration for sequence models built on candle.
//!
//! ## Architecture Overview
//!
//! - **Training loop**: manual gradient accumulation that decouples the
//!   optimizer step from the micro-batch step
//! - **Checkpoints**: save, prune, restore and average `step_<N>` records
//! - **Autotuning**: binary search of the largest feasible token batch size
//!   with out-of-process trial runs
//! - **Data**: whitespace-tokenized text files batched by examples or tokens
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use candle_core::Device;
//! use seqrun_core::{ProcessRole, RunConfig};
//! use seqrun_train::{
//!     data::{BatchingOptions, TextDataset, Vocab},
//!     model::{ModelFactory, SequenceModel},
//!     optim::Adam,
//!     toy::TokenTaggerFactory,
//!     train::Trainer,
//! };
//!
//! # fn main() -> seqrun_core::Result<()> {
//! let config = RunConfig::load(&["run.toml"], None)?;
//! let device = Device::Cpu;
//! let model = TokenTaggerFactory.build(&config, &device)?;
//! let optimizer = Adam::from_params(model.trainable_variables()?, &config.params)?;
//!
//! let source_vocab = Vocab::from_file("src.vocab")?;
//! let dataset = TextDataset::from_files(
//!     Path::new("train.src"),
//!     Some(Path::new("train.tgt")),
//!     &source_vocab,
//!     model.target_vocab(),
//! )?;
//! let options = BatchingOptions::training(&config.train, 32, 0);
//! let mut trainer = Trainer::new(model, optimizer, config, ProcessRole::Chief)?;
//! trainer.run(dataset.batches(options, &device), None)?;
//! # Ok(())
//! # }
//! ```

pub mod accumulate;
pub mod autotune;
pub mod checkpoint;
pub mod data;
pub mod export;
pub mod logging;
pub mod model;
pub mod optim;
pub mod toy;
pub mod train;

pub use accumulate::GradientAccumulator;
pub use autotune::{BatchSizeAutotuner, ProcessTrialRunner, ResourceLimits, TrialRunner};
pub use checkpoint::{CheckpointManager, CheckpointMeta, CheckpointRecord};
pub use logging::{init_logging, LogFormat};
pub use model::{Hypothesis, LossPair, Mode, ModelFactory, ModelOutput, SequenceModel};
pub use optim::Optimizer;
pub use train::{finalize_training_parameters, CheckpointHook, TrainOutcome, Trainer};
