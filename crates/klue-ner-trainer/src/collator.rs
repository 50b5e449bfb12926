//! Dynamic padding of tokenized examples into model batches.

use candle_core::{Device, Result, Tensor};
use klue_ner_core::{TokenizedExample, IGNORE_INDEX};

/// Row-major padded batch, before it becomes tensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddedBatch {
    pub batch_size: usize,
    pub seq_len: usize,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<i64>,
}

/// Model inputs for one batch, all shaped `[batch, seq_len]`.
pub struct Batch {
    pub input_ids: Tensor,
    pub token_type_ids: Tensor,
    pub attention_mask: Tensor,
    pub labels: Tensor,
}

/// Pads to the longest example in the batch.
#[derive(Debug, Clone, Copy)]
pub struct DataCollator {
    pad_token_id: u32,
}

impl DataCollator {
    pub fn new(pad_token_id: u32) -> Self {
        Self { pad_token_id }
    }

    /// Pad ids with the pad token, the mask with 0 and labels with `-100`.
    pub fn pad(&self, examples: &[&TokenizedExample]) -> PaddedBatch {
        let batch_size = examples.len();
        let seq_len = examples.iter().map(|e| e.len()).max().unwrap_or(0);

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        let mut labels = Vec::with_capacity(batch_size * seq_len);

        for example in examples {
            let pad = seq_len - example.len();
            input_ids.extend_from_slice(&example.input_ids);
            input_ids.extend(std::iter::repeat_n(self.pad_token_id, pad));
            attention_mask.extend_from_slice(&example.attention_mask);
            attention_mask.extend(std::iter::repeat_n(0, pad));
            labels.extend_from_slice(&example.labels);
            labels.extend(std::iter::repeat_n(IGNORE_INDEX, pad));
        }

        PaddedBatch {
            batch_size,
            seq_len,
            input_ids,
            attention_mask,
            labels,
        }
    }

    /// Pad and move the batch to `device`.
    pub fn collate(&self, examples: &[&TokenizedExample], device: &Device) -> Result<Batch> {
        let padded = self.pad(examples);
        let shape = (padded.batch_size, padded.seq_len);

        let input_ids = Tensor::from_vec(padded.input_ids, shape, device)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = Tensor::from_vec(padded.attention_mask, shape, device)?;
        let labels = Tensor::from_vec(padded.labels, shape, device)?;

        Ok(Batch {
            input_ids,
            token_type_ids,
            attention_mask,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(ids: &[u32], labels: &[i64]) -> TokenizedExample {
        TokenizedExample {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            offsets: vec![(0, 0); ids.len()],
            labels: labels.to_vec(),
        }
    }

    #[test]
    fn test_pad_to_longest() {
        let a = example(&[2, 10, 11, 3], &[-100, 6, 7, -100]);
        let b = example(&[2, 12, 3], &[-100, 12, -100]);
        let padded = DataCollator::new(0).pad(&[&a, &b]);

        assert_eq!(padded.batch_size, 2);
        assert_eq!(padded.seq_len, 4);
        assert_eq!(padded.input_ids, vec![2, 10, 11, 3, 2, 12, 3, 0]);
        assert_eq!(padded.attention_mask, vec![1, 1, 1, 1, 1, 1, 1, 0]);
        assert_eq!(padded.labels[4..], [-100, 12, -100, -100]);
    }

    #[test]
    fn test_collate_shapes() {
        let a = example(&[2, 10, 3], &[-100, 6, -100]);
        let batch = DataCollator::new(1).collate(&[&a, &a], &Device::Cpu).unwrap();
        assert_eq!(batch.input_ids.dims(), &[2, 3]);
        assert_eq!(batch.labels.dims(), &[2, 3]);
        assert_eq!(
            batch.token_type_ids.to_vec2::<u32>().unwrap(),
            vec![vec![0, 0, 0], vec![0, 0, 0]]
        );
    }
}
