//! # multitask_optim
//!
//! An AdamW optimizer for multi-task fine-tuning of a shared encoder. Before each
//! update, the gradients present at step time go through a pairwise projection
//! pass ("gradient surgery", see [`optim::surgery`]); the update itself is
//! bias-corrected Adam with decoupled weight decay.
//!
//! The model lives outside this crate. It shares its parameters as [`Tensor`]
//! handles (through [`nn::Module`]), writes gradients into them, and calls
//! [`optim::Optimizer::step`]. [`train::MultiTaskTrainer`] wires that loop up
//! for several task objectives, and [`utils::serialization`] checkpoints it.

pub mod nn;
pub mod optim;
pub mod tensor;
pub mod train;
pub mod utils;

#[cfg(feature = "python")]
pub mod bindings; // PyO3 module, built into the cdylib

pub use optim::{AdamW, AdamWConfig, OptimError, Optimizer};
pub use tensor::{Gradient, Tensor, TensorError};
