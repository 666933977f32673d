//! Core types shared across seqrun crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Layered run configuration with TOML support
//! - Process role detection for multi-process runs

pub mod config;
pub mod error;
pub mod role;

// Re-export commonly used types
pub use config::{
    count_batch_accum, merge_values, AlignmentType, AutotuneConfig, BatchType, DataConfig,
    DecayConfig, EvalSection, ExporterKind, InferSection, ParamsConfig, RunConfig, ScoreSection,
    ScorerKind, TrainSection,
};
pub use error::{checkpoint_error, config_error, IoResultExt, Result, RunnerError};
pub use role::{ProcessRole, CLUSTER_SPEC_ENV};
