//! Everything around a training run that isn't the model: reading datasets, batching, metric
//! reporting, evaluation and the checkpointing loop.

pub mod analytics;
pub mod evaluator;
pub mod lj_speech;
pub mod reporter;
pub mod trainer;

pub use analytics::{Coverage, CoverageGenerator};
pub use evaluator::{EvaluateCore, StandardEvaluator};
pub use lj_speech::{make_batches, pad_sequences, Dataset, EncodedEntry, Entry, TextBatch};
pub use reporter::{DictSummary, Observation, Reporter, Summary};
pub use trainer::{Trainer, TrainerConfig, Updater};
