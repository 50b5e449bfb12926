use thiserror::Error;

use crate::align::AlignError;

/// Errors that can occur while preparing NER training data.
#[derive(Debug, Error)]
pub enum NerError {
    /// Character labels could not be mapped onto sub-word tokens.
    #[error("label alignment failed: {0}")]
    Align(#[from] AlignError),

    /// The configuration file is missing, malformed or has invalid values.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A label id or label name is not part of the vocabulary.
    #[error("unknown label: {0}")]
    UnknownLabel(String),

    /// An example carries a different number of labels than units.
    #[error("example {index} has {labels} labels for {units} units")]
    LabelCountMismatch {
        /// Position of the example in its split.
        index: usize,
        /// Number of `ner_tags`.
        labels: usize,
        /// Number of characters (or tokens) in the sentence.
        units: usize,
    },

    /// A dataset file could not be parsed.
    #[error("malformed dataset at {location}: {reason}")]
    Dataset {
        /// File and line of the offending record.
        location: String,
        /// What went wrong.
        reason: String,
    },

    /// Fetching a file from the Hugging Face Hub failed.
    #[error("hub download failed for {file}: {reason}")]
    Hub {
        /// Repository-relative file name.
        file: String,
        /// Underlying error message.
        reason: String,
    },

    /// Tokenizer loading or encoding failed.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A Parquet split could not be decoded.
    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Entity-level scoring rejected its input.
    #[error("metric computation failed: {0}")]
    Metrics(String),

    /// A regex pattern failed to compile (should not happen with static patterns).
    #[error("regex compilation error: {0}")]
    Regex(#[from] regex::Error),
}

/// Result type alias for klue-ner operations.
pub type Result<T> = std::result::Result<T, NerError>;
