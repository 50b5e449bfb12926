//! Token-level cross-entropy that skips `-100` labels.

use candle_core::{DType, Result, Tensor, D};
use klue_ner_core::IGNORE_INDEX;

/// Mean negative log-likelihood over positions whose label is not `-100`.
///
/// `logits` is `[batch, seq_len, num_labels]`, `labels` is `[batch, seq_len]`
/// of `i64`. A batch with no scored positions yields a zero loss.
pub fn masked_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, num_labels) = logits.dims3()?;
    let logits = logits
        .to_dtype(DType::F32)?
        .reshape((batch * seq_len, num_labels))?;
    let labels = labels.reshape(batch * seq_len)?;

    let mask = labels.ne(IGNORE_INDEX)?;
    let safe_labels = mask.where_cond(&labels, &labels.zeros_like()?)?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&safe_labels.unsqueeze(1)?, 1)?
        .squeeze(1)?;

    let mask = mask.to_dtype(DType::F32)?;
    let total = (picked * &mask)?.sum_all()?.neg()?;
    let count = mask.sum_all()?.maximum(1f32)?;
    total / count
}
