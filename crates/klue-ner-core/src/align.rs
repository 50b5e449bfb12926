//! # Character-to-Token Label Alignment
//!
//! Maps per-character BIO labels onto the sub-word tokens produced by a
//! tokenizer, using the tokenizer's character offset mapping.
//!
//! The base labels are padded with one [`IGNORE_INDEX`] on each side so that
//! the leading special token, whose offset is `(0, 0)`, reads a sentinel.
//! The shift means `padded[end]` is the label of a token's last character
//! and `padded[start]` the label of the character just before it.

use serde::Deserialize;
use thiserror::Error;

use crate::labels::{is_entity_id, IGNORE_INDEX, OUTSIDE_ID};

/// Offset pair marking a special token.
const SPECIAL_OFFSET: (usize, usize) = (0, 0);

/// Errors raised while aligning labels to tokens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlignError {
    /// The encoding does not start and end with a special token.
    #[error("offset mapping of length {len} must start and end with a (0, 0) special token")]
    MissingSpecialTokens {
        /// Length of the offending offset mapping.
        len: usize,
    },

    /// A token offset points past the padded label sequence.
    #[error("token {token} has offset {offset} but only {len} padded labels exist")]
    OffsetOutOfRange {
        /// Index of the token in the offset mapping.
        token: usize,
        /// The offending character offset.
        offset: usize,
        /// Length of the padded label sequence.
        len: usize,
    },
}

/// Which boundary label wins when a token's start and end labels differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Always the end label, i.e. the token's last character.
    #[default]
    End,
    /// End label if it is an entity, else start label if it is an entity, else `O`.
    EndThenStart,
    /// Start label if it is an entity, else end label if it is an entity, else `O`.
    StartThenEnd,
}

impl BoundaryPolicy {
    /// Resolve one token from its two boundary labels.
    pub fn resolve(self, label_start: i64, label_end: i64) -> i64 {
        if label_start == OUTSIDE_ID && label_end == OUTSIDE_ID {
            return OUTSIDE_ID;
        }
        if label_start == IGNORE_INDEX && label_end == IGNORE_INDEX {
            return IGNORE_INDEX;
        }

        match self {
            BoundaryPolicy::End => label_end,
            BoundaryPolicy::EndThenStart => [label_end, label_start]
                .into_iter()
                .find(|&id| is_entity_id(id))
                .unwrap_or(OUTSIDE_ID),
            BoundaryPolicy::StartThenEnd => [label_start, label_end]
                .into_iter()
                .find(|&id| is_entity_id(id))
                .unwrap_or(OUTSIDE_ID),
        }
    }
}

/// Aligns character labels to sub-word tokens under a fixed policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelAligner {
    policy: BoundaryPolicy,
}

impl LabelAligner {
    /// Create an aligner with the given boundary policy.
    pub fn new(policy: BoundaryPolicy) -> Self {
        Self { policy }
    }

    /// The boundary policy in use.
    pub fn policy(&self) -> BoundaryPolicy {
        self.policy
    }

    /// Produce one label per token. See [`align`].
    pub fn align(
        &self,
        base_labels: &[i64],
        offset_mapping: &[(usize, usize)],
    ) -> Result<Vec<i64>, AlignError> {
        align(base_labels, offset_mapping, self.policy)
    }
}

/// Produce one label per entry of `offset_mapping`.
///
/// `offset_mapping` must begin and end with a `(0, 0)` special token. Every
/// offset must index into `base_labels` padded by one sentinel on each side;
/// anything else is an error, never a clamp.
///
/// # Examples
/// ```
/// use klue_ner_core::align::{align, BoundaryPolicy};
///
/// // B-PS, I-PS, O
/// let labels = [6, 7, 12];
/// let offsets = [(0, 0), (0, 1), (1, 3), (0, 0)];
/// let aligned = align(&labels, &offsets, BoundaryPolicy::End).unwrap();
/// assert_eq!(aligned, vec![-100, 6, 12, -100]);
/// ```
pub fn align(
    base_labels: &[i64],
    offset_mapping: &[(usize, usize)],
    policy: BoundaryPolicy,
) -> Result<Vec<i64>, AlignError> {
    check_special_tokens(offset_mapping)?;

    let mut padded = Vec::with_capacity(base_labels.len() + 2);
    padded.push(IGNORE_INDEX);
    padded.extend_from_slice(base_labels);
    padded.push(IGNORE_INDEX);

    let lookup = |token: usize, offset: usize| {
        padded
            .get(offset)
            .copied()
            .ok_or(AlignError::OffsetOutOfRange {
                token,
                offset,
                len: padded.len(),
            })
    };

    offset_mapping
        .iter()
        .enumerate()
        .map(|(token, &(start, end))| {
            let label_start = lookup(token, start)?;
            let label_end = lookup(token, end)?;
            Ok(policy.resolve(label_start, label_end))
        })
        .collect()
}

fn check_special_tokens(offset_mapping: &[(usize, usize)]) -> Result<(), AlignError> {
    match (offset_mapping.first(), offset_mapping.last()) {
        (Some(&first), Some(&last))
            if offset_mapping.len() >= 2 && first == SPECIAL_OFFSET && last == SPECIAL_OFFSET =>
        {
            Ok(())
        }
        _ => Err(AlignError::MissingSpecialTokens {
            len: offset_mapping.len(),
        }),
    }
}
