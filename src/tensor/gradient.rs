//! # Gradients
//!
//! The derivative attached to a parameter by an external backward pass.

use super::{TensorData, TensorError};
use ndarray::{ArrayD, IxDyn};

/// A gradient in coordinate form: `values[k]` belongs at flat (row-major) index
/// `indices[k]` of a tensor of shape `shape`. Duplicate indices sum.
#[derive(Clone, Debug, PartialEq)]
pub struct SparseGradient {
    shape: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<TensorData>,
}

impl SparseGradient {
    pub fn new(
        shape: &[usize],
        indices: Vec<usize>,
        values: Vec<TensorData>,
    ) -> Result<Self, TensorError> {
        if indices.len() != values.len() {
            return Err(TensorError::Generic(format!(
                "sparse gradient has {} indices but {} values",
                indices.len(),
                values.len()
            )));
        }
        let size: usize = shape.iter().product();
        if let Some(&index) = indices.iter().find(|&&i| i >= size) {
            return Err(TensorError::IndexOutOfBounds {
                index,
                shape: shape.to_vec(),
            });
        }
        Ok(SparseGradient {
            shape: shape.to_vec(),
            indices,
            values,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of stored (index, value) entries.
    pub fn nnz(&self) -> usize {
        self.indices.len()
    }

    /// Scatters the entries into a dense array.
    pub fn to_dense(&self) -> ArrayD<TensorData> {
        let mut dense = ArrayD::zeros(IxDyn(&self.shape));
        // Freshly allocated arrays are standard layout.
        if let Some(slice) = dense.as_slice_mut() {
            for (&i, &v) in self.indices.iter().zip(&self.values) {
                slice[i] += v;
            }
        }
        dense
    }
}

/// The gradient currently attached to a parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Gradient {
    Dense(ArrayD<TensorData>),
    /// Produced by embedding-style lookups. The optimizer refuses these.
    Sparse(SparseGradient),
}

impl Gradient {
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(g) => g.shape(),
            Gradient::Sparse(g) => g.shape(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Gradient::Sparse(_))
    }

    /// Borrows the dense values, or `None` for a sparse gradient.
    pub fn as_dense(&self) -> Option<&ArrayD<TensorData>> {
        match self {
            Gradient::Dense(g) => Some(g),
            Gradient::Sparse(_) => None,
        }
    }

    /// Adds a dense contribution. A sparse gradient is densified first.
    pub(crate) fn accumulate(&mut self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if incoming.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: incoming.shape().to_vec(),
            });
        }
        match self {
            Gradient::Dense(g) => *g += incoming,
            Gradient::Sparse(s) => {
                let mut dense = s.to_dense();
                dense += incoming;
                *self = Gradient::Dense(dense);
            }
        }
        Ok(())
    }

    pub(crate) fn fill_zero(&mut self) {
        match self {
            Gradient::Dense(g) => g.fill(0.0),
            Gradient::Sparse(s) => {
                s.indices.clear();
                s.values.clear();
            }
        }
    }
}
