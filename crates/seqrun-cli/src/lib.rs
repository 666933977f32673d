//! Runner facade and command line of the `seqrun` binary.

pub mod cli;
pub mod runner;

pub use cli::{Cli, Command};
pub use runner::{Runner, RunnerOptions, TrainAndEvalOutcome};
