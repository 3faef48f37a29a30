//! # Tensor Operations
//!
//! Reductions and in-place updates on raw `ArrayD` buffers. These do not touch
//! gradient slots; the optimizer uses them on its own copies.

use super::{TensorData, TensorError};
use ndarray::ArrayD;

fn check_same_shape(
    op: &str,
    a: &ArrayD<TensorData>,
    b: &ArrayD<TensorData>,
) -> Result<(), TensorError> {
    if a.shape() != b.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: op.to_string(),
            shape1: a.shape().to_vec(),
            shape2: b.shape().to_vec(),
        });
    }
    Ok(())
}

/// Dot product of the flattened arrays.
pub fn dot(a: &ArrayD<TensorData>, b: &ArrayD<TensorData>) -> Result<TensorData, TensorError> {
    check_same_shape("dot", a, b)?;
    Ok(a.iter().zip(b.iter()).map(|(x, y)| x * y).sum())
}

/// Squared Euclidean norm of the flattened array.
pub fn squared_norm(a: &ArrayD<TensorData>) -> TensorData {
    a.iter().map(|x| x * x).sum()
}

/// `target -= coeff * other`, elementwise.
pub fn sub_scaled(
    target: &mut ArrayD<TensorData>,
    coeff: TensorData,
    other: &ArrayD<TensorData>,
) -> Result<(), TensorError> {
    check_same_shape("sub_scaled", target, other)?;
    target.scaled_add(-coeff, other);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn dot_flattens_any_rank() {
        let a = array![[1.0, 2.0], [3.0, 4.0]].into_dyn();
        let b = array![[1.0, 0.0], [0.0, 1.0]].into_dyn();
        assert_eq!(dot(&a, &b).unwrap(), 5.0);
        assert_eq!(squared_norm(&a), 30.0);
    }

    #[test]
    fn dot_rejects_different_shapes() {
        let a = array![1.0, 2.0].into_dyn();
        let b = array![[1.0, 2.0]].into_dyn();
        assert!(matches!(
            dot(&a, &b),
            Err(TensorError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn sub_scaled_updates_in_place() {
        let mut a = array![1.0, 1.0].into_dyn();
        sub_scaled(&mut a, 0.5, &array![2.0, -2.0].into_dyn()).unwrap();
        assert_eq!(a, array![0.0, 2.0].into_dyn());
    }
}
