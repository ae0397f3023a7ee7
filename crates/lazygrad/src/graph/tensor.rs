//! Leaf construction, evaluation and gradient access.

use std::rc::Rc;

use rand::Rng;

use super::node::{NodeKind, Tensor};
use super::retained::Retained;
use super::session::Session;
use crate::backend::Backend;
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{Shape, numel};

impl<B: Backend> Tensor<B> {
    /// Gradient-accumulating leaf from column-major data.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
    /// assert!(x.requires_grad());
    /// assert_eq!(x.grad().unwrap().data(), &[0.0, 0.0, 0.0]);
    /// ```
    pub fn variable(backend: &Rc<B>, data: Vec<f64>, shape: &[usize]) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.from_vec(data, shape)?, true)
    }

    /// Leaf without gradient from column-major data.
    pub fn constant(backend: &Rc<B>, data: Vec<f64>, shape: &[usize]) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.from_vec(data, shape)?, false)
    }

    /// Rank-0 leaf.
    pub fn scalar(backend: &Rc<B>, value: f64, requires_grad: bool) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.scalar(value), requires_grad)
    }

    pub fn from_dense(backend: &Rc<B>, tensor: DenseTensor, requires_grad: bool) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.allocate(tensor), requires_grad)
    }

    /// Leaf taking one reference to an existing buffer.
    pub fn from_buffer(backend: &Rc<B>, buffer: B::Buffer, requires_grad: bool) -> Result<Self, GraphError> {
        Self::leaf(Retained::new(backend, buffer)?, requires_grad)
    }

    pub fn zeros(backend: &Rc<B>, shape: &[usize], requires_grad: bool) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.zeros(shape), requires_grad)
    }

    pub fn full(backend: &Rc<B>, shape: &[usize], value: f64, requires_grad: bool) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.full(shape, value), requires_grad)
    }

    /// Leaf with values drawn uniformly from `[low, high)`.
    pub fn random_uniform<R: Rng>(
        backend: &Rc<B>,
        shape: &[usize],
        low: f64,
        high: f64,
        rng: &mut R,
        requires_grad: bool,
    ) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.random_uniform(shape, low, high, rng), requires_grad)
    }

    /// Leaf with normally distributed values.
    pub fn random_normal<R: Rng>(
        backend: &Rc<B>,
        shape: &[usize],
        mean: f64,
        std: f64,
        rng: &mut R,
        requires_grad: bool,
    ) -> Result<Self, GraphError> {
        Self::from_buffer(backend, backend.random_normal(shape, mean, std, rng), requires_grad)
    }

    /// Shape of the node, running one forward pass if it cannot be inferred.
    pub fn shape(&self) -> Result<Shape, GraphError> {
        if let Some(shape) = self.node.shape.get() {
            return Ok(shape.clone());
        }
        let session = Session::new(self.backend());
        session.forward(self)?;
        session.close()?;
        self.node
            .shape
            .get()
            .cloned()
            .ok_or_else(|| GraphError::InvalidOperation(format!("shape of {} unknown", self.id())))
    }

    pub fn ndim(&self) -> Result<usize, GraphError> {
        Ok(self.shape()?.len())
    }

    pub fn numel(&self) -> Result<usize, GraphError> {
        Ok(numel(&self.shape()?))
    }

    /// Evaluate the node and keep its output past the session.
    ///
    /// The returned handle is owned by the node and stays valid until the
    /// node is released, dropped or recomputed.
    pub fn forward(&self) -> Result<B::Buffer, GraphError> {
        if let NodeKind::Function(func) = &self.node.kind {
            func.state.borrow_mut().keep_output = true;
        }
        let session = Session::new(self.backend());
        let buffer = session.evaluate(self, false)?;
        session.close()?;
        Ok(buffer)
    }

    /// Stop keeping the output of [`Tensor::forward`] and drop it now.
    /// Returns whether an output was held. Leaves are unaffected.
    pub fn discard_output(&self) -> bool {
        match &self.node.kind {
            NodeKind::Function(func) => {
                let mut state = func.state.borrow_mut();
                state.keep_output = false;
                state.clear_output()
            }
            _ => false,
        }
    }

    /// Host copy of the node's value.
    ///
    /// Unlike [`Tensor::forward`], reading a value does not keep the output:
    /// it is dropped with the other intermediates once copied.
    pub fn value(&self) -> Result<DenseTensor, GraphError> {
        let session = Session::new(self.backend());
        let buffer = session.forward(self)?;
        let dense = self.backend().to_dense(&buffer)?;
        session.close()?;
        Ok(dense)
    }

    pub fn to_vec(&self) -> Result<Vec<f64>, GraphError> {
        Ok(self.value()?.into_vec())
    }

    /// The single element of a unit-shaped node.
    pub fn item(&self) -> Result<f64, GraphError> {
        let value = self.value()?;
        match value.data() {
            [v] => Ok(*v),
            _ => Err(GraphError::shape_mismatch("item", &[1], value.shape())),
        }
    }

    fn grad_retained<R>(&self, f: impl FnOnce(&Retained<B>) -> R) -> Result<R, GraphError> {
        match &self.node.kind {
            NodeKind::Variable(leaf) => {
                let leaf = leaf.borrow();
                let grad = leaf.grad.as_ref().ok_or_else(|| self.released_error())?;
                Ok(f(grad))
            }
            _ => Err(GraphError::NoGradient {
                id: self.id().index(),
            }),
        }
    }

    /// Handle to the accumulated gradient buffer of a variable.
    pub fn grad_buffer(&self) -> Result<B::Buffer, GraphError> {
        self.grad_retained(|g| g.buffer().clone())
    }

    /// Host copy of the accumulated gradient.
    ///
    /// # Errors
    ///
    /// `NoGradient` unless the node is a variable.
    pub fn grad(&self) -> Result<DenseTensor, GraphError> {
        let buffer = self.grad_buffer()?;
        self.backend().to_dense(&buffer)
    }

    /// Reset the accumulated gradient to zero in place.
    pub fn zero_grad(&self) -> Result<(), GraphError> {
        let buffer = self.grad_buffer()?;
        self.backend().write(&buffer, |t| t.data_mut().fill(0.0))
    }

    /// Dispose of the node's buffers now.
    ///
    /// Further use of the node fails with `NodeReleased`, including a second
    /// `release`.
    pub fn release(&self) -> Result<(), GraphError> {
        match &self.node.kind {
            NodeKind::Variable(leaf) => {
                let (value, grad) = {
                    let mut leaf = leaf.borrow_mut();
                    (leaf.value.take(), leaf.grad.take())
                };
                let value = value.ok_or_else(|| self.released_error())?;
                value.release()?;
                if let Some(grad) = grad {
                    grad.release()?;
                }
            }
            NodeKind::Constant(value) => {
                let value = value.borrow_mut().take();
                value.ok_or_else(|| self.released_error())?.release()?;
            }
            NodeKind::Function(func) => {
                let (output, saved, pending) = {
                    let mut state = func.state.borrow_mut();
                    if state.released {
                        return Err(self.released_error());
                    }
                    state.released = true;
                    (
                        state.output.take(),
                        std::mem::take(&mut state.saved),
                        state.pending.take(),
                    )
                };
                for retained in output.into_iter().chain(saved).chain(pending) {
                    retained.release()?;
                }
            }
        }
        Ok(())
    }

    fn to_leaf(&self, requires_grad: bool) -> Result<Self, GraphError> {
        if let Some(value) = self.share_leaf_value()? {
            return Self::leaf(value, requires_grad);
        }
        let session = Session::new(self.backend());
        let buffer = session.forward(self)?;
        let leaf = Self::from_buffer(self.backend(), buffer, requires_grad)?;
        session.close()?;
        Ok(leaf)
    }

    /// Constant leaf holding this node's current value.
    pub fn detach(&self) -> Result<Self, GraphError> {
        self.to_leaf(false)
    }

    /// Variable leaf holding this node's current value and a zero gradient.
    pub fn to_variable(&self) -> Result<Self, GraphError> {
        self.to_leaf(true)
    }
}
