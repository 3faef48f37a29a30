//! # Neural Network Module (`nn`)
//!
//! The seam between a model and the optimizer. A model (encoder plus task heads)
//! lives outside this crate; it only has to hand out its parameters by name.

use crate::tensor::Tensor;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Anything that owns trainable parameters.
pub trait Module: Debug {
    /// The module's parameters keyed by a descriptive name (e.g. "sentiment.weight").
    /// BTreeMap keeps the order deterministic, so optimizer positions and
    /// checkpoints line up across runs.
    fn parameters(&self) -> BTreeMap<String, Tensor>;

    /// Zeros the gradients of all parameters.
    fn zero_grad(&self) {
        for param in self.parameters().values() {
            param.zero_grad();
        }
    }
}

/// A flat, named set of parameters. Useful when the model is assembled elsewhere
/// and only its tensors are handed over.
#[derive(Clone, Debug, Default)]
pub struct ParameterDict {
    params: BTreeMap<String, Tensor>,
}

impl ParameterDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, param: Tensor) -> Option<Tensor> {
        self.params.insert(name.into(), param)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.params.get(name)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl FromIterator<(String, Tensor)> for ParameterDict {
    fn from_iter<I: IntoIterator<Item = (String, Tensor)>>(iter: I) -> Self {
        ParameterDict {
            params: iter.into_iter().collect(),
        }
    }
}

impl Module for ParameterDict {
    fn parameters(&self) -> BTreeMap<String, Tensor> {
        self.params.clone()
    }
}
