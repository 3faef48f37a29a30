//! # Checkpoint Serialization Utilities
//!
//! Functions for saving and loading model parameters together with optimizer state.
//! Uses `serde` for serialization and `bincode` as the binary format.

use crate::nn::Module;
use crate::optim::{AdamW, AdamWConfig, OptimError, OptimizerStateDict};
use crate::tensor::{Tensor, TensorData};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
    #[error("Tensor shape mismatch during loading: key '{key}', expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("Stored tensor '{key}' is malformed: {source}")]
    Malformed {
        key: String,
        source: ndarray::ShapeError,
    },
    #[error("Missing key in state dict during loading: '{0}'")]
    MissingKey(String),
    #[error("Unexpected key in state dict during loading: '{0}'")]
    UnexpectedKey(String),
    #[error("Optimizer state could not be restored: {0}")]
    Optimizer(#[from] OptimError),
}

// --- Serializable Tensor Wrapper ---

/// Shape plus row-major values of an `ArrayD`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializableTensor {
    pub shape: Vec<usize>,
    pub data: Vec<TensorData>,
}

impl SerializableTensor {
    pub fn from_array(array: &ArrayD<TensorData>) -> Self {
        SerializableTensor {
            shape: array.shape().to_vec(),
            // `iter()` walks logical order regardless of memory layout.
            data: array.iter().copied().collect(),
        }
    }

    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self::from_array(&tensor.data())
    }

    /// Fails if the number of values does not match the shape.
    pub fn into_array(self) -> Result<ArrayD<TensorData>, ndarray::ShapeError> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)
    }
}

// --- State Dictionary Type ---
// BTreeMap for consistent ordering (helpful for diffs/debugging).
type StateDict = BTreeMap<String, SerializableTensor>;

/// Everything needed to resume training: parameters, optimizer state and the
/// optimizer configuration they were produced with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub params: StateDict,
    pub optimizer: OptimizerStateDict,
    pub config: AdamWConfig,
}

fn state_dict_of(module: &dyn Module) -> StateDict {
    module
        .parameters()
        .iter()
        .map(|(key, tensor)| (key.clone(), SerializableTensor::from_tensor(tensor)))
        .collect()
}

/// Stored values matched to the module's parameters, checked and ready to write.
type StagedParams = Vec<(Tensor, ArrayD<TensorData>)>;

/// Matches stored tensors to the module's parameters and checks them without
/// writing anything. With `strict`, the key sets must match exactly; otherwise
/// missing and extra keys are skipped with a warning.
fn stage_state_dict(
    module: &dyn Module,
    mut state_dict: StateDict,
    strict: bool,
) -> Result<StagedParams, SerializationError> {
    let module_tensors = module.parameters();
    let mut staged = Vec::with_capacity(module_tensors.len());

    for (key, target) in module_tensors {
        let Some(stored) = state_dict.remove(&key) else {
            if strict {
                return Err(SerializationError::MissingKey(key));
            }
            tracing::warn!(key = %key, "key not found in loaded state dict, skipping");
            continue;
        };

        let array = stored.into_array().map_err(|source| SerializationError::Malformed {
            key: key.clone(),
            source,
        })?;
        if target.shape() != array.shape() {
            return Err(SerializationError::ShapeMismatch {
                expected: target.shape().to_vec(),
                got: array.shape().to_vec(),
                key,
            });
        }
        staged.push((target, array));
    }

    // Whatever is left was not claimed by the module.
    if let Some(extra) = state_dict.keys().next() {
        if strict {
            return Err(SerializationError::UnexpectedKey(extra.clone()));
        }
        for key in state_dict.keys() {
            tracing::warn!(key = %key, "key in loaded state dict is not used by the module");
        }
    }
    Ok(staged)
}

fn commit_params(staged: StagedParams) {
    for (target, array) in staged {
        target.data_mut().assign(&array);
    }
}

/// Copies stored values into the module's parameters. A failed load leaves the
/// module untouched.
fn apply_state_dict(
    module: &dyn Module,
    state_dict: StateDict,
    strict: bool,
) -> Result<(), SerializationError> {
    commit_params(stage_state_dict(module, state_dict, strict)?);
    Ok(())
}

// --- Parameter-only save/load ---

/// Saves the module's parameters to a file.
pub fn save<P: AsRef<Path>>(module: &dyn Module, path: P) -> Result<(), SerializationError> {
    let writer = BufWriter::new(File::create(path.as_ref())?);
    bincode::serialize_into(writer, &state_dict_of(module))?;
    Ok(())
}

/// Loads parameters saved by [`save`] into the module.
pub fn load<P: AsRef<Path>>(
    module: &dyn Module,
    path: P,
    strict: bool,
) -> Result<(), SerializationError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    let state_dict: StateDict = bincode::deserialize_from(reader)?;
    apply_state_dict(module, state_dict, strict)
}

// --- Full checkpoints ---

/// Saves parameters, optimizer state and optimizer defaults.
pub fn save_checkpoint<P: AsRef<Path>>(
    module: &dyn Module,
    optimizer: &AdamW,
    path: P,
) -> Result<(), SerializationError> {
    let checkpoint = Checkpoint {
        params: state_dict_of(module),
        optimizer: optimizer.state_dict(),
        config: *optimizer.defaults(),
    };
    let writer = BufWriter::new(File::create(path.as_ref())?);
    bincode::serialize_into(writer, &checkpoint)?;
    tracing::debug!(path = %path.as_ref().display(), params = checkpoint.params.len(), "saved checkpoint");
    Ok(())
}

/// Reads a checkpoint without applying it, e.g. to rebuild the optimizer from
/// the stored config before calling [`restore_checkpoint`].
pub fn read_checkpoint<P: AsRef<Path>>(path: P) -> Result<Checkpoint, SerializationError> {
    let reader = BufReader::new(File::open(path.as_ref())?);
    Ok(bincode::deserialize_from(reader)?)
}

/// Applies a checkpoint to a module and an optimizer managing its parameters.
/// Both the optimizer state and the parameters are checked first; on error
/// neither is modified.
pub fn restore_checkpoint(
    module: &dyn Module,
    optimizer: &mut AdamW,
    checkpoint: Checkpoint,
    strict: bool,
) -> Result<(), SerializationError> {
    if checkpoint.config != *optimizer.defaults() {
        tracing::warn!(
            stored = ?checkpoint.config,
            current = ?optimizer.defaults(),
            "optimizer defaults differ from the checkpoint"
        );
    }
    let optimizer_state = optimizer.stage_state_dict(checkpoint.optimizer)?;
    let params = stage_state_dict(module, checkpoint.params, strict)?;
    optimizer.commit_state(optimizer_state);
    commit_params(params);
    Ok(())
}

/// Reads and applies a checkpoint saved by [`save_checkpoint`].
pub fn load_checkpoint<P: AsRef<Path>>(
    module: &dyn Module,
    optimizer: &mut AdamW,
    path: P,
    strict: bool,
) -> Result<(), SerializationError> {
    let checkpoint = read_checkpoint(path)?;
    restore_checkpoint(module, optimizer, checkpoint, strict)
}
