//! # Python Bindings (`multitask_optim`)
//!
//! Exposes the AdamW optimizer to a Python training loop. Parameters are copied
//! in from NumPy once; Python reads them back with `param(i)` after each step.

use numpy::{IntoPyArray, PyArrayDyn, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyIndexError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::optim::{AdamW, AdamWConfig, OptimError, Optimizer};
use crate::tensor::{Tensor, TensorData, TensorError};
use crate::utils::serialization::{self, SerializationError};

// --- Rust errors -> Python exceptions ---

impl From<TensorError> for PyErr {
    fn from(err: TensorError) -> PyErr {
        PyValueError::new_err(err.to_string())
    }
}

impl From<OptimError> for PyErr {
    fn from(err: OptimError) -> PyErr {
        match err {
            OptimError::InvalidHyperparameter { .. } | OptimError::DuplicateParameter { .. } => {
                PyValueError::new_err(err.to_string())
            }
            _ => PyRuntimeError::new_err(err.to_string()),
        }
    }
}

impl From<SerializationError> for PyErr {
    fn from(err: SerializationError) -> PyErr {
        PyRuntimeError::new_err(err.to_string())
    }
}

// --- Optimizer (`multitask_optim.AdamW`) ---

#[pyclass(name = "AdamW")]
struct PyAdamW {
    optimizer: AdamW,
    params: Vec<Tensor>,
}

impl PyAdamW {
    fn tensor(&self, index: usize) -> PyResult<&Tensor> {
        self.params.get(index).ok_or_else(|| {
            PyIndexError::new_err(format!(
                "parameter index {} out of range for {} parameters",
                index,
                self.params.len()
            ))
        })
    }
}

#[pymethods]
impl PyAdamW {
    #[new]
    #[pyo3(signature = (params, lr=1e-3, betas=(0.9, 0.999), eps=1e-6, weight_decay=0.0, correct_bias=true, gradient_surgery=true))]
    fn new<'py>(
        params: Vec<PyReadonlyArrayDyn<'py, TensorData>>,
        lr: f64,
        betas: (f64, f64),
        eps: f64,
        weight_decay: f64,
        correct_bias: bool,
        gradient_surgery: bool,
    ) -> PyResult<Self> {
        let params: Vec<Tensor> = params
            .iter()
            .map(|array| Tensor::new(array.as_array().to_owned()))
            .collect();
        let config = AdamWConfig {
            lr,
            betas,
            eps,
            weight_decay,
            correct_bias,
            gradient_surgery,
        };
        let optimizer = AdamW::new(params.iter().cloned(), config)?;
        Ok(PyAdamW { optimizer, params })
    }

    fn __len__(&self) -> usize {
        self.params.len()
    }

    /// Adds `grad` to the gradient of parameter `index`, or detaches it when `grad` is None.
    #[pyo3(signature = (index, grad=None))]
    fn accumulate_grad<'py>(
        &self,
        index: usize,
        grad: Option<PyReadonlyArrayDyn<'py, TensorData>>,
    ) -> PyResult<()> {
        let tensor = self.tensor(index)?;
        match grad {
            Some(grad) => tensor.accumulate_grad(&grad.as_array().to_owned())?,
            None => tensor.clear_grad(),
        }
        Ok(())
    }

    fn step(&mut self) -> PyResult<()> {
        self.optimizer.step().map_err(PyErr::from)
    }

    /// Zeros the gradients in place, or detaches them with `set_to_none=True`.
    #[pyo3(signature = (set_to_none=true))]
    fn zero_grad(&mut self, set_to_none: bool) {
        if set_to_none {
            self.optimizer.clear_grad();
        } else {
            self.optimizer.zero_grad();
        }
    }

    /// Copy of the current values of parameter `index`.
    fn param<'py>(&self, py: Python<'py>, index: usize) -> PyResult<Bound<'py, PyArrayDyn<TensorData>>> {
        Ok(self.tensor(index)?.data_clone().into_pyarray_bound(py))
    }

    /// Number of updates applied to parameter `index`, None before the first one.
    fn state_step(&self, index: usize) -> PyResult<Option<u64>> {
        let tensor = self.tensor(index)?;
        Ok(self.optimizer.state_for(tensor).map(|s| s.step()))
    }

    /// Saves the parameters (named `param.{i}`) and the optimizer state.
    fn save_checkpoint(&self, path: String) -> PyResult<()> {
        serialization::save_checkpoint(&self.named(), &self.optimizer, path)?;
        Ok(())
    }

    fn load_checkpoint(&mut self, path: String) -> PyResult<()> {
        let named = self.named();
        serialization::load_checkpoint(&named, &mut self.optimizer, path, true)?;
        Ok(())
    }

    fn __repr__(&self) -> String {
        format!(
            "AdamW(params={}, config={:?})",
            self.params.len(),
            self.optimizer.defaults()
        )
    }
}

impl PyAdamW {
    fn named(&self) -> crate::nn::ParameterDict {
        self.params
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("param.{:05}", i), t.clone()))
            .collect()
    }
}

#[pymodule]
fn multitask_optim(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAdamW>()?;
    Ok(())
}
