//! # Per-Parameter Optimizer State

use super::OptimError;
use crate::tensor::TensorData;
use crate::utils::serialization::SerializableTensor;
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Moment estimates and step counter of one parameter.
///
/// Created the first time the parameter is stepped with a gradient present;
/// only the owning optimizer writes to it.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamState {
    pub(crate) m: ArrayD<TensorData>, // 1st moment estimate
    pub(crate) v: ArrayD<TensorData>, // 2nd moment estimate
    pub(crate) t: u64,
}

impl ParamState {
    /// Zero moments of the given shape, `t = 0`.
    pub fn new(shape: &[usize]) -> Self {
        ParamState {
            m: ArrayD::zeros(IxDyn(shape)),
            v: ArrayD::zeros(IxDyn(shape)),
            t: 0,
        }
    }

    /// Exponential moving average of gradients.
    pub fn exp_avg(&self) -> &ArrayD<TensorData> {
        &self.m
    }

    /// Exponential moving average of squared gradients.
    pub fn exp_avg_sq(&self) -> &ArrayD<TensorData> {
        &self.v
    }

    /// Number of updates applied to the parameter.
    pub fn step(&self) -> u64 {
        self.t
    }

    pub fn shape(&self) -> &[usize] {
        self.m.shape()
    }

    pub fn to_record(&self) -> ParamStateRecord {
        ParamStateRecord {
            t: self.t,
            m: SerializableTensor::from_array(&self.m),
            v: SerializableTensor::from_array(&self.v),
        }
    }

    pub fn from_record(record: ParamStateRecord) -> Result<Self, OptimError> {
        if record.m.shape != record.v.shape {
            return Err(OptimError::StateMismatch(format!(
                "moment shapes differ: {:?} vs {:?}",
                record.m.shape, record.v.shape
            )));
        }
        let m = record.m.into_array().map_err(crate::tensor::TensorError::from)?;
        let v = record.v.into_array().map_err(crate::tensor::TensorError::from)?;
        Ok(ParamState { m, v, t: record.t })
    }
}

/// Serialized form of [`ParamState`], stored verbatim in checkpoints.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParamStateRecord {
    pub t: u64,
    pub m: SerializableTensor,
    pub v: SerializableTensor,
}
