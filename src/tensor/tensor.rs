use std::io::{Read, Write};

use crate::tensor::TensorDim;

/// Dense `f32` tensor. An empty `data` vector means "not allocated".
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dim: TensorDim,
    pub data: Vec<f32>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TensorError {
    pub message: String,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::empty()
    }
}

impl Tensor {
    pub fn new(dim: TensorDim, data: Vec<f32>) -> Result<Self, TensorError> {
        let expected = dim.data_len();
        if expected != data.len() {
            return Err(TensorError {
                message: format!(
                    "Tensor dim/data mismatch: {dim} implies {expected} elements, got {}",
                    data.len()
                ),
            });
        }
        Ok(Self { dim, data })
    }

    pub fn zeros(dim: TensorDim) -> Self {
        Self::filled(dim, 0.0)
    }

    pub fn filled(dim: TensorDim, value: f32) -> Self {
        Self {
            dim,
            data: vec![value; dim.data_len()],
        }
    }

    /// An unallocated placeholder.
    pub fn empty() -> Self {
        Self {
            dim: TensorDim::default(),
            data: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn batch(&self) -> usize {
        self.dim.batch()
    }

    pub fn reshape(&self, dim: TensorDim) -> Result<Self, TensorError> {
        Self::new(dim, self.data.clone())
    }

    pub fn add(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip_with(other, "add", |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip_with(other, "sub", |a, b| a - b)
    }

    pub fn multiply(&self, other: &Self) -> Result<Self, TensorError> {
        self.zip_with(other, "multiply", |a, b| a * b)
    }

    pub fn scale(&self, factor: f32) -> Self {
        self.apply(|value| value * factor)
    }

    pub fn apply(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            dim: self.dim,
            data: self.data.iter().map(|value| f(*value)).collect(),
        }
    }

    pub fn add_inplace_scaled(&mut self, other: &Self, scale: f32) -> Result<(), TensorError> {
        if self.data.len() != other.data.len() {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in add_inplace_scaled: {} vs {}",
                    self.dim, other.dim
                ),
            });
        }
        for (value, delta) in self.data.iter_mut().zip(other.data.iter()) {
            *value += *delta * scale;
        }
        Ok(())
    }

    pub fn fill(&mut self, value: f32) {
        self.data.iter_mut().for_each(|slot| *slot = value);
    }

    /// Matrix product over the `rows x width` views of both operands,
    /// optionally transposing either side first.
    pub fn dot(&self, other: &Self, trans_lhs: bool, trans_rhs: bool) -> Result<Self, TensorError> {
        let (lhs_rows, lhs_cols) = matrix_view(&self.dim, trans_lhs);
        let (rhs_rows, rhs_cols) = matrix_view(&other.dim, trans_rhs);
        if lhs_cols != rhs_rows {
            return Err(TensorError {
                message: format!(
                    "Shape mismatch in dot: {} x {} (trans_lhs={trans_lhs}, trans_rhs={trans_rhs})",
                    self.dim, other.dim
                ),
            });
        }
        let lhs_stride = self.dim.width();
        let rhs_stride = other.dim.width();
        let lhs_at = |i: usize, k: usize| {
            if trans_lhs {
                self.data[k * lhs_stride + i]
            } else {
                self.data[i * lhs_stride + k]
            }
        };
        let rhs_at = |k: usize, j: usize| {
            if trans_rhs {
                other.data[j * rhs_stride + k]
            } else {
                other.data[k * rhs_stride + j]
            }
        };

        let mut out = vec![0.0_f32; lhs_rows * rhs_cols];
        for i in 0..lhs_rows {
            for j in 0..rhs_cols {
                let mut acc = 0.0_f32;
                for k in 0..lhs_cols {
                    acc += lhs_at(i, k) * rhs_at(k, j);
                }
                out[i * rhs_cols + j] = acc;
            }
        }
        Self::new(TensorDim::new(lhs_rows, 1, 1, rhs_cols), out)
    }

    /// Column sums over the `rows x width` view, as a `1:1:1:width` tensor.
    pub fn sum_rows(&self) -> Self {
        let width = self.dim.width();
        let mut out = vec![0.0_f32; width];
        for row in self.data.chunks(width.max(1)) {
            for (acc, value) in out.iter_mut().zip(row) {
                *acc += *value;
            }
        }
        Self {
            dim: TensorDim::vector(width),
            data: out,
        }
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().copied().sum()
    }

    pub fn mean(&self) -> Result<f32, TensorError> {
        if self.data.is_empty() {
            return Err(TensorError {
                message: "mean expects non-empty tensor".to_string(),
            });
        }
        Ok(self.sum() / self.data.len() as f32)
    }

    pub fn relu(&self) -> Self {
        self.apply(|value| value.max(0.0))
    }

    pub fn sigmoid(&self) -> Self {
        self.apply(|value| 1.0 / (1.0 + (-value).exp()))
    }

    pub fn tanh(&self) -> Self {
        self.apply(f32::tanh)
    }

    /// Row-wise softmax over the width axis.
    pub fn softmax(&self) -> Self {
        let width = self.dim.width().max(1);
        let mut out = self.data.clone();
        for row in out.chunks_mut(width) {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let mut total = 0.0_f32;
            for value in row.iter_mut() {
                *value = (*value - max).exp();
                total += *value;
            }
            for value in row.iter_mut() {
                *value /= total;
            }
        }
        Self {
            dim: self.dim,
            data: out,
        }
    }

    /// Index of the largest element of every sample.
    pub fn argmax(&self) -> Vec<usize> {
        let feature = self.dim.feature_len().max(1);
        self.data
            .chunks(feature)
            .map(|sample| {
                sample
                    .iter()
                    .enumerate()
                    .fold((0usize, f32::NEG_INFINITY), |best, (index, value)| {
                        if *value > best.1 {
                            (index, *value)
                        } else {
                            best
                        }
                    })
                    .0
            })
            .collect()
    }

    /// Stacks single- or multi-sample tensors with equal feature extents
    /// along the batch axis.
    pub fn concat_batch(parts: &[Self]) -> Result<Self, TensorError> {
        let Some(first) = parts.first() else {
            return Err(TensorError {
                message: "concat_batch expects at least one tensor".to_string(),
            });
        };
        let mut batch = 0;
        let mut data = Vec::new();
        for part in parts {
            if part.dim.with_batch(1) != first.dim.with_batch(1) {
                return Err(TensorError {
                    message: format!(
                        "concat_batch feature mismatch: {} vs {}",
                        first.dim, part.dim
                    ),
                });
            }
            batch += part.dim.batch();
            data.extend_from_slice(&part.data);
        }
        Self::new(first.dim.with_batch(batch), data)
    }

    pub fn write_to(&self, writer: &mut impl Write) -> std::io::Result<()> {
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads exactly `self.len()` little-endian values into `self`.
    pub fn read_from(&mut self, reader: &mut impl Read) -> std::io::Result<()> {
        let mut bytes = [0u8; 4];
        for value in &mut self.data {
            reader.read_exact(&mut bytes)?;
            *value = f32::from_le_bytes(bytes);
        }
        Ok(())
    }

    fn zip_with(
        &self,
        other: &Self,
        op: &str,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<Self, TensorError> {
        if self.dim != other.dim {
            return Err(TensorError {
                message: format!("Shape mismatch in {op}: {} vs {}", self.dim, other.dim),
            });
        }
        let data = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| f(*a, *b))
            .collect();
        Self::new(self.dim, data)
    }
}

fn matrix_view(dim: &TensorDim, transposed: bool) -> (usize, usize) {
    if transposed {
        (dim.width(), dim.rows())
    } else {
        (dim.rows(), dim.width())
    }
}
