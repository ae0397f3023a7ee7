//! Graph builder: one constructor per primitive.
//!
//! Each constructor validates its operands and infers the output shape
//! without computing anything, then records an operation node. When every
//! operand is a constant leaf the operation is evaluated immediately instead.

mod binary;
mod blas;
mod compare;
mod index;
mod nn;
mod reduce;
mod scalar;
mod shape;
mod unary;

use std::rc::Rc;

use tracing::trace;

use crate::backend::{Backend, BufferHandle, CollectionScope};
use crate::config::config;
use crate::error::GraphError;
use crate::graph::{ForwardContext, Operation, Tensor};
use crate::shape::Shape;

/// Record `op` over `inputs`, or evaluate it at once when all inputs are
/// constants.
///
/// This is the entry point for operations defined outside the crate.
pub fn apply<B, O>(op: O, inputs: &[&Tensor<B>]) -> Result<Tensor<B>, GraphError>
where
    B: Backend,
    O: Operation<B> + 'static,
{
    let name = op.name();
    let Some(first) = inputs.first() else {
        return Err(GraphError::InvalidOperation(format!("{name} needs an input")));
    };
    let backend = first.backend();
    for input in inputs {
        if !Rc::ptr_eq(backend, input.backend()) {
            return Err(GraphError::BackendMismatch { op: name });
        }
        if input.is_released() {
            return Err(GraphError::NodeReleased {
                id: input.id().index(),
            });
        }
    }
    let shapes = inputs
        .iter()
        .map(|t| t.shape())
        .collect::<Result<Vec<_>, _>>()?;
    let shape = op.infer_shape(&shapes)?;

    if config().eager_constants && inputs.iter().all(|t| t.is_constant()) {
        return evaluate_eagerly(backend, &op, inputs, shape);
    }
    let requires_grad = op.differentiable() && inputs.iter().any(|t| t.requires_grad());
    let inputs = inputs.iter().map(|t| (*t).clone()).collect();
    Ok(Tensor::function(backend, Box::new(op), inputs, requires_grad, shape))
}

fn evaluate_eagerly<B: Backend, O: Operation<B>>(
    backend: &Rc<B>,
    op: &O,
    inputs: &[&Tensor<B>],
    shape: Option<Shape>,
) -> Result<Tensor<B>, GraphError> {
    let scope = CollectionScope::open(backend);
    let buffers = inputs
        .iter()
        .map(|t| t.current_buffer())
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&B::Buffer> = buffers.iter().collect();
    let mut ctx = ForwardContext::new(backend);
    let output = op.forward(&mut ctx, &refs)?;
    if let Some(expected) = &shape {
        if expected.as_slice() != output.shape() {
            return Err(GraphError::shape_mismatch(op.name(), expected, output.shape()));
        }
    }
    if config().check_nan && backend.has_nan(&output)? {
        return Err(GraphError::NanDetected { op: op.name() });
    }
    let leaf = Tensor::from_buffer(backend, output, false)?;
    drop(ctx);
    scope.close()?;
    trace!(op = op.name(), node = %leaf.id(), "evaluated eagerly");
    Ok(leaf)
}

/// Gradient of a broadcast operand: sum `grad` down to `shape` if needed.
pub(crate) fn reduce_to<B: Backend>(backend: &B, grad: &B::Buffer, shape: &[usize]) -> Result<B::Buffer, GraphError> {
    if grad.shape() == shape {
        Ok(grad.clone())
    } else {
        backend.sum_to(grad, shape)
    }
}
