//! Portable shape-plus-data form of a leaf, and transfer between backends.

use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::Backend;
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::graph::Tensor;

/// Backend-independent value of a tensor: its shape and its elements in
/// column-major order.
///
/// # Example
///
/// ```
/// use std::rc::Rc;
/// use lazygrad::{CpuBackend, Tensor, TensorDescriptor};
///
/// let cpu = Rc::new(CpuBackend::new());
/// let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
/// let desc = x.to_descriptor().unwrap();
/// assert_eq!(desc, TensorDescriptor { shape: vec![2], data: vec![1.0, 2.0] });
///
/// let y = Tensor::constant_from_descriptor(&cpu, &desc).unwrap();
/// assert!(y.is_constant());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl TensorDescriptor {
    pub fn from_dense(tensor: &DenseTensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    /// Validate the element count against the shape.
    pub fn to_dense(&self) -> Result<DenseTensor, GraphError> {
        DenseTensor::from_vec(self.data.clone(), &self.shape)
    }
}

impl<B: Backend> Tensor<B> {
    /// Descriptor of the node's current value. Operation nodes are evaluated
    /// first.
    pub fn to_descriptor(&self) -> Result<TensorDescriptor, GraphError> {
        Ok(TensorDescriptor::from_dense(&self.value()?))
    }

    /// Variable leaf rebuilt from a descriptor, with a zero gradient.
    pub fn variable_from_descriptor(backend: &Rc<B>, desc: &TensorDescriptor) -> Result<Self, GraphError> {
        Self::from_dense(backend, desc.to_dense()?, true)
    }

    pub fn constant_from_descriptor(backend: &Rc<B>, desc: &TensorDescriptor) -> Result<Self, GraphError> {
        Self::from_dense(backend, desc.to_dense()?, false)
    }
}

/// Copy a leaf onto another backend, keeping its kind: a variable becomes a
/// variable with a fresh zero gradient, a constant becomes a constant.
///
/// # Errors
///
/// `InvalidOperation` for operation nodes; detach them first.
pub fn transfer<B: Backend, T: Backend>(tensor: &Tensor<B>, target: &Rc<T>) -> Result<Tensor<T>, GraphError> {
    if !tensor.is_leaf() {
        return Err(GraphError::InvalidOperation(format!(
            "cannot transfer operation node {}; detach it first",
            tensor.id()
        )));
    }
    let desc = tensor.to_descriptor()?;
    let moved = if tensor.is_variable() {
        Tensor::variable_from_descriptor(target, &desc)?
    } else {
        Tensor::constant_from_descriptor(target, &desc)?
    };
    debug!(
        from = tensor.backend().name(),
        to = target.name(),
        node = %tensor.id(),
        "leaf transferred"
    );
    Ok(moved)
}
