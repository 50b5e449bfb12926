//! # Tokenization and Label Preprocessing
//!
//! Encodes each example's sentence with a Hugging Face tokenizer and attaches
//! the aligned per-token labels.

use std::path::Path;

use tokenizers::{Tokenizer, TruncationParams};
use tracing::{debug, info};

use crate::align::{BoundaryPolicy, LabelAligner};
use crate::config::TrainConfig;
use crate::dataset::NerExample;
use crate::error::{NerError, Result};

/// Model-ready view of one example.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    /// Character offsets per token, `(0, 0)` for special tokens.
    pub offsets: Vec<(usize, usize)>,
    /// Aligned label per token, `-100` where the loss ignores it.
    pub labels: Vec<i64>,
}

impl TokenizedExample {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Tokenizes sentences and aligns their character labels.
pub struct Preprocessor {
    tokenizer: Tokenizer,
    aligner: LabelAligner,
}

impl Preprocessor {
    /// Wrap a tokenizer, truncating to `max_length` tokens and disabling padding.
    pub fn new(
        mut tokenizer: Tokenizer,
        max_length: usize,
        policy: BoundaryPolicy,
    ) -> Result<Self> {
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| NerError::Tokenizer(e.to_string()))?;
        tokenizer.with_padding(None);

        Ok(Self {
            tokenizer,
            aligner: LabelAligner::new(policy),
        })
    }

    /// Load `tokenizer.json` and apply the run's length and policy settings.
    pub fn from_file<P: AsRef<Path>>(path: P, config: &TrainConfig) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(path.as_ref()).map_err(|e| NerError::Tokenizer(e.to_string()))?;
        Self::new(tokenizer, config.max_token_length, config.boundary_policy)
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Encode one example. `index` only feeds error messages.
    pub fn process(&self, example: &NerExample, index: usize) -> Result<TokenizedExample> {
        let sentence = example.text();
        let units = sentence.chars().count();
        if units != example.ner_tags.len() {
            return Err(NerError::LabelCountMismatch {
                index,
                labels: example.ner_tags.len(),
                units,
            });
        }

        // Char offsets, not byte offsets: Hangul is three bytes per syllable.
        let encoding = self
            .tokenizer
            .encode_char_offsets(sentence.as_str(), true)
            .map_err(|e| NerError::Tokenizer(e.to_string()))?;

        let offsets = encoding.get_offsets().to_vec();
        let labels = self.aligner.align(&example.ner_tags, &offsets)?;

        Ok(TokenizedExample {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
            offsets,
            labels,
        })
    }

    /// Encode a whole split, stopping at the first failure.
    pub fn process_all(&self, examples: &[NerExample]) -> Result<Vec<TokenizedExample>> {
        let processed = examples
            .iter()
            .enumerate()
            .map(|(index, example)| self.process(example, index))
            .collect::<Result<Vec<_>>>()?;

        let tokens: usize = processed.iter().map(TokenizedExample::len).sum();
        info!(
            examples = processed.len(),
            tokens,
            policy = ?self.aligner.policy(),
            "Tokenized split"
        );
        Ok(processed)
    }

    /// `(index, token, label)` rows for eyeballing one example's alignment.
    pub fn debug_rows(&self, example: &NerExample) -> Result<Vec<(usize, String, i64)>> {
        let processed = self.process(example, 0)?;
        let tokens: Vec<String> = processed
            .input_ids
            .iter()
            .map(|&id| {
                self.tokenizer
                    .id_to_token(id)
                    .unwrap_or_else(|| format!("<{}>", id))
            })
            .collect();

        let rows: Vec<_> = tokens
            .into_iter()
            .zip(processed.labels)
            .enumerate()
            .map(|(idx, (token, label))| (idx, token, label))
            .collect();
        debug!(rows = rows.len(), "Built alignment table");
        Ok(rows)
    }
}
