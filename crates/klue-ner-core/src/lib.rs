//! # KLUE NER Core
//!
//! Data side of Korean NER fine-tuning: the label vocabulary, character to
//! sub-word label alignment, typed run configuration, dataset readers,
//! tokenization and seqeval-style metrics.
//!
//! ## Quick Start
//!
//! ```rust
//! use klue_ner_core::{BoundaryPolicy, LabelAligner};
//!
//! // "이순신" annotated per character: B-PS I-PS I-PS
//! let labels = [6, 7, 7];
//! // [CLS] 이순 ##신 [SEP]
//! let offsets = [(0, 0), (0, 2), (2, 3), (0, 0)];
//!
//! let aligner = LabelAligner::new(BoundaryPolicy::End);
//! assert_eq!(aligner.align(&labels, &offsets).unwrap(), vec![-100, 7, 7, -100]);
//! ```
pub mod align;
pub mod config;
pub mod dataset;
pub mod error;
pub mod labels;
pub mod metric;
pub mod preprocess;

// Re-export primary API
pub use align::{align, AlignError, BoundaryPolicy, LabelAligner};
pub use config::{BestMetric, IntervalStrategy, TrainConfig};
pub use dataset::{DatasetDict, DatasetLoader, NerExample};
pub use error::{NerError, Result};
pub use labels::{EntityType, NerLabel, IGNORE_INDEX, OUTSIDE_ID};
pub use metric::{compute_metrics, EvalReport};
pub use preprocess::{Preprocessor, TokenizedExample};
