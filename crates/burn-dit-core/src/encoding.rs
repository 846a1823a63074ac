//! Host-side RoPE table and its conversion to burn tensors

use std::ops::Range;

use burn::prelude::*;

use crate::rope::ConfigurationError;

/// Dense `[1, sequence, heads, channels]` table of interleaved
/// `(cos, sin)` pairs
///
/// The buffer is immutable once built; reshaping and slicing return new
/// tables.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodingTensor {
    data: Vec<f32>,
    shape: [usize; 4],
}

impl EncodingTensor {
    pub(crate) fn from_parts(data: Vec<f32>, shape: [usize; 4]) -> Self {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>());
        Self { data, shape }
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn sequence_len(&self) -> usize {
        self.shape[1]
    }

    pub fn heads(&self) -> usize {
        self.shape[2]
    }

    pub fn channels(&self) -> usize {
        self.shape[3]
    }

    /// Raw row-major buffer
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    fn offset(&self, position: usize, head: usize, channel: usize) -> usize {
        (position * self.shape[2] + head) * self.shape[3] + channel
    }

    /// Value at `(0, position, head, channel)`
    ///
    /// # Panics
    ///
    /// Panics if any index is out of bounds
    pub fn get(&self, position: usize, head: usize, channel: usize) -> f32 {
        assert!(
            position < self.shape[1] && head < self.shape[2] && channel < self.shape[3],
            "index ({position}, {head}, {channel}) out of bounds for {:?}",
            self.shape
        );
        self.data[self.offset(position, head, channel)]
    }

    /// `(cos, sin)` of one channel pair
    pub fn pair(&self, position: usize, head: usize, pair: usize) -> (f32, f32) {
        (
            self.get(position, head, pair * 2),
            self.get(position, head, pair * 2 + 1),
        )
    }

    /// Reinterprets `[1, N, 1, C]` as `[1, N, heads, C / heads]`
    ///
    /// Only valid for tables built with a single head, where the channel
    /// axis is reinterpreted rather than replicated.
    pub fn split_heads(self, heads: usize) -> Result<Self, ConfigurationError> {
        let channels = self.shape[2] * self.shape[3];
        if heads == 0 {
            return Err(ConfigurationError::NoHeads);
        }
        if self.shape[2] != 1 || channels % heads != 0 || (channels / heads) % 2 != 0 {
            return Err(ConfigurationError::HeadSplit { channels, heads });
        }
        Ok(Self {
            data: self.data,
            shape: [1, self.shape[1], heads, channels / heads],
        })
    }

    /// Sub-table covering a range of positions
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the sequence
    pub fn positions(&self, range: Range<usize>) -> Self {
        assert!(
            range.start <= range.end && range.end <= self.shape[1],
            "position range {range:?} out of bounds for {} positions",
            self.shape[1]
        );
        let row = self.shape[2] * self.shape[3];
        Self {
            data: self.data[range.start * row..range.end * row].to_vec(),
            shape: [1, range.len(), self.shape[2], self.shape[3]],
        }
    }

    pub fn to_data(&self) -> TensorData {
        TensorData::new(self.data.clone(), self.shape)
    }

    pub fn into_data(self) -> TensorData {
        TensorData::new(self.data, self.shape)
    }

    /// Uploads the table to a device
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        Tensor::from_data(self.to_data(), device)
    }
}
