//! Operation strategy trait and the contexts handed to it.

use std::fmt::Debug;
use std::rc::Rc;

use super::retained::Retained;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::shape::Shape;

/// Forward and backward logic of one operation kind.
///
/// The engine never inspects an operation beyond this trait, so adding an
/// operation kind never touches the traversal code.
pub trait Operation<B: Backend>: Debug {
    /// Name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Validate operand shapes and compute the output shape.
    ///
    /// `Ok(None)` means the shape is only known after running the forward
    /// step; the node then materializes on its first shape query.
    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError>;

    /// Compute the output from the materialized inputs.
    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError>;

    /// Given the gradient of the output, produce one entry per input.
    ///
    /// Inputs that do not need a gradient get `None`.
    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError>;

    /// Whether gradients flow through this operation at all.
    fn differentiable(&self) -> bool {
        true
    }
}

/// Handed to [`Operation::forward`].
pub struct ForwardContext<'a, B: Backend> {
    backend: &'a Rc<B>,
    saved: Vec<Retained<B>>,
}

impl<'a, B: Backend> ForwardContext<'a, B> {
    pub(crate) fn new(backend: &'a Rc<B>) -> Self {
        Self {
            backend,
            saved: Vec::new(),
        }
    }

    pub fn backend(&self) -> &'a B {
        self.backend
    }

    pub(crate) fn backend_rc(&self) -> &'a Rc<B> {
        self.backend
    }

    /// Keep `buffer` alive until this node's backward step has run.
    pub fn save(&mut self, buffer: B::Buffer) -> Result<(), GraphError> {
        self.saved.push(Retained::new(self.backend, buffer)?);
        Ok(())
    }

    pub(crate) fn into_saved(self) -> Vec<Retained<B>> {
        self.saved
    }
}

/// Handed to [`Operation::backward`].
pub struct BackwardContext<'a, B: Backend> {
    pub(crate) backend: &'a Rc<B>,
    pub(crate) inputs: &'a [B::Buffer],
    pub(crate) input_shapes: &'a [Shape],
    pub(crate) needs_grad: &'a [bool],
    pub(crate) output: &'a B::Buffer,
    pub(crate) saved: &'a [B::Buffer],
}

impl<'a, B: Backend> BackwardContext<'a, B> {
    pub fn backend(&self) -> &'a B {
        self.backend
    }

    pub(crate) fn backend_rc(&self) -> &'a Rc<B> {
        self.backend
    }

    /// Materialized value of input `i`.
    pub fn input(&self, i: usize) -> &'a B::Buffer {
        &self.inputs[i]
    }

    pub fn input_shape(&self, i: usize) -> &'a [usize] {
        &self.input_shapes[i]
    }

    pub fn needs_grad(&self, i: usize) -> bool {
        self.needs_grad[i]
    }

    pub fn output(&self) -> &'a B::Buffer {
        self.output
    }

    /// Buffer `i` stored through [`ForwardContext::save`].
    pub fn saved(&self, i: usize) -> Result<&'a B::Buffer, GraphError> {
        self.saved.get(i).ok_or_else(|| {
            GraphError::InvalidOperation(format!("no saved buffer at slot {i}"))
        })
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }
}
