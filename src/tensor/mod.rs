//! # Tensor Module
//!
//! Defines the `Tensor` parameter handle shared between a model and the optimizer,
//! the `Gradient` attached to it, and the elementwise helpers the optimizer needs.

use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// --- Submodules ---
pub mod gradient;
pub mod ops;

// --- Re-exports ---
pub use gradient::{Gradient, SparseGradient};

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Incompatible shapes for operation {op}: {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Vec<usize>,
        shape2: Vec<usize>,
    },
    #[error("Index out of bounds: flat index {index} for shape {shape:?}")]
    IndexOutOfBounds { index: usize, shape: Vec<usize> },
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
    #[error("Generic error: {0}")]
    Generic(String),
}

/// Element type of every tensor in the crate.
pub type TensorData = f32;

/// # Tensor
///
/// A mutable, fixed-shape parameter. Cloning a `Tensor` clones the handle, not the
/// data: every clone reads and writes the same storage and sees the same gradient
/// slot, which is how a model and its optimizer share parameters.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<RwLock<ArrayD<TensorData>>>,
    shape: Vec<usize>,
    // Shared so a gradient written through one handle is visible to all of them.
    grad: Arc<Mutex<Option<Gradient>>>,
}

impl Tensor {
    /// Creates a new Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>) -> Self {
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            shape,
            grad: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates a tensor from a flat vector and a shape.
    pub fn from_vec(shape: &[usize], values: Vec<TensorData>) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Self::new(data))
    }

    /// Stable identity of the underlying storage, shared by all clones of this handle.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Read access to the values. Recovers the data if a writer panicked.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write access to the values. Outside the crate, values change only through
    /// [`Tensor::assign`], so the shape stays fixed.
    pub(crate) fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Overwrites the values, keeping the shape fixed.
    pub fn assign(&self, values: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if values.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: values.shape().to_vec(),
            });
        }
        self.data_mut().assign(values);
        Ok(())
    }

    fn grad_slot(&self) -> MutexGuard<'_, Option<Gradient>> {
        self.grad.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns a copy of the attached gradient, if any.
    pub fn grad(&self) -> Option<Gradient> {
        self.grad_slot().clone()
    }

    /// Whether a gradient is currently attached.
    pub fn has_grad(&self) -> bool {
        self.grad_slot().is_some()
    }

    /// Replaces the attached gradient.
    pub fn set_grad(&self, grad: Gradient) -> Result<(), TensorError> {
        if grad.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: grad.shape().to_vec(),
            });
        }
        *self.grad_slot() = Some(grad);
        Ok(())
    }

    /// Adds a dense gradient into the slot, as a backward pass for one more loss term does.
    pub fn accumulate_grad(&self, incoming: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if incoming.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: incoming.shape().to_vec(),
            });
        }
        let mut slot = self.grad_slot();
        match slot.as_mut() {
            Some(existing) => existing.accumulate(incoming)?,
            None => *slot = Some(Gradient::Dense(incoming.clone())),
        }
        Ok(())
    }

    /// Zeroes the gradient in place if one exists. A missing gradient stays missing.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad_slot().as_mut() {
            grad.fill_zero();
        }
    }

    /// Detaches the gradient entirely, so the next step skips this parameter.
    pub fn clear_grad(&self) {
        *self.grad_slot() = None;
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize]) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)))
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize]) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn clones_share_data_and_gradient() {
        let p = zeros(&[2]);
        let q = p.clone();
        assert_eq!(p.id(), q.id());

        q.data_mut().fill(3.0);
        assert!(p.data().iter().all(|&x| x == 3.0));

        q.accumulate_grad(&array![1.0, 2.0].into_dyn()).unwrap();
        assert!(p.has_grad());
    }

    #[test]
    fn assign_keeps_the_shape_fixed() {
        let p = zeros(&[2]);
        let err = p.assign(&array![1.0, 2.0, 3.0].into_dyn()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
        assert_eq!(p.data().shape(), &[2]);

        p.assign(&array![4.0, 5.0].into_dyn()).unwrap();
        assert_eq!(p.data_clone(), array![4.0, 5.0].into_dyn());
    }

    #[test]
    fn accumulate_sums_successive_backward_passes() {
        let p = zeros(&[2]);
        p.accumulate_grad(&array![1.0, 2.0].into_dyn()).unwrap();
        p.accumulate_grad(&array![0.5, -1.0].into_dyn()).unwrap();
        match p.grad() {
            Some(Gradient::Dense(g)) => assert_eq!(g, array![1.5, 1.0].into_dyn()),
            other => panic!("expected dense gradient, got {:?}", other),
        }
    }

    #[test]
    fn accumulate_rejects_wrong_shape() {
        let p = zeros(&[2]);
        let err = p.accumulate_grad(&array![1.0, 2.0, 3.0].into_dyn()).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn zero_grad_keeps_slot_and_clear_grad_drops_it() {
        let p = ones(&[3]);
        p.accumulate_grad(&array![1.0, 1.0, 1.0].into_dyn()).unwrap();
        p.zero_grad();
        match p.grad() {
            Some(Gradient::Dense(g)) => assert!(g.iter().all(|&x| x == 0.0)),
            other => panic!("expected zeroed dense gradient, got {:?}", other),
        }
        p.clear_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn distinct_tensors_have_distinct_ids() {
        let a = zeros(&[1]);
        let b = zeros(&[1]);
        assert_ne!(a.id(), b.id());
    }
}
