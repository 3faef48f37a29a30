//! # Optimization Algorithms (`optim`)
//!
//! AdamW with a gradient-conflict resolution pass for multi-task training.

use crate::tensor::TensorError;

// --- Submodules ---
pub mod adamw;
pub mod config;
pub mod state;
pub mod surgery;

// Re-exports
pub use adamw::{AdamW, GroupRecord, OptimizerStateDict, ParamGroup};
pub use config::{AdamWConfig, ParamGroupOptions};
pub use state::{ParamState, ParamStateRecord};
pub use surgery::{gradient_surgery, SurgeryReport};

// --- Errors ---

#[derive(thiserror::Error, Debug)]
pub enum OptimError {
    #[error("Invalid {name}: {value} - {reason}")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("Parameter at position {position} is already managed by this optimizer")]
    DuplicateParameter { position: usize },
    #[error("AdamW does not support sparse gradients (parameter at position {position})")]
    SparseGradient { position: usize },
    #[error("Optimizer state does not match the managed parameters: {0}")]
    StateMismatch(String),
    #[error("Tensor error: {0}")]
    Tensor(#[from] TensorError),
}

// --- Optimizer Trait ---

/// Base trait for optimizers.
pub trait Optimizer {
    /// Performs a single optimization step over every managed parameter that
    /// currently has a gradient attached.
    fn step(&mut self) -> Result<(), OptimError>;

    /// Zeros the gradients of all managed parameters.
    /// Call this before accumulating gradients for a new batch.
    fn zero_grad(&mut self);
}
