//! # Parameter Initialization
//!
//! Seeded random initialization. The generator is always passed in explicitly;
//! nothing here touches process-wide random state.

use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Seed used by the multi-task training runs unless overridden.
pub const DEFAULT_SEED: u64 = 11711;

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// Values drawn uniformly from `[-bound, bound)`.
pub fn uniform<R: Rng + ?Sized>(shape: &[usize], bound: TensorData, rng: &mut R) -> Tensor {
    if !(bound > 0.0) {
        return Tensor::new(ArrayD::zeros(IxDyn(shape)));
    }
    let range = Uniform::new(-bound, bound);
    Tensor::new(ArrayD::from_shape_simple_fn(IxDyn(shape), || range.sample(rng)))
}

/// Linear-layer initialization: uniform in `[-1/sqrt(fan_in), 1/sqrt(fan_in))`.
pub fn kaiming_uniform<R: Rng + ?Sized>(shape: &[usize], fan_in: usize, rng: &mut R) -> Tensor {
    let k = (1.0 / fan_in.max(1) as TensorData).sqrt();
    uniform(shape, k, rng)
}
