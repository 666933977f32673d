pub mod dataset;
pub mod vocab;

pub use dataset::{Batch, BatchingOptions, Batches, Example, Labels, TextDataset};
pub use vocab::Vocab;
