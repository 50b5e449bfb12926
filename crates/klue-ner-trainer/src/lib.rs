//! # KLUE NER Trainer
//!
//! Fine-tunes a BERT encoder for Korean named entity recognition on top of
//! `klue-ner-core`: batch collation, masked cross-entropy, a linear warmup
//! schedule and the training loop with evaluation and checkpointing.

pub mod collator;
pub mod loss;
pub mod model;
pub mod schedule;
pub mod trainer;

pub use collator::{Batch, DataCollator};
pub use model::{fetch_pretrained, Architecture, PretrainedFiles, TokenClassifier};
pub use schedule::LinearSchedule;
pub use trainer::{run_training, Trainer, TrainerState};
