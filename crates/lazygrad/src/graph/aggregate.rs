//! Gradient-aggregation escape hatch.
//!
//! `x.aggregate(f)` records a single node whose value is `f` applied to the
//! *value* of `x`. Its backward step differentiates through `f` with a
//! nested, self-contained forward and backward pass on a fresh variable, then
//! discards `f`'s graph. The outer graph only ever sees the wrapper, so its
//! consumer counting is unaffected by whatever `f` builds.

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use super::node::Tensor;
use super::operation::{BackwardContext, ForwardContext, Operation};
use super::session::Session;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::ops::apply;
use crate::shape::Shape;

type AggregateFn<B> = Rc<dyn Fn(&Tensor<B>) -> Result<Tensor<B>, GraphError>>;

struct Aggregate<B: Backend> {
    f: AggregateFn<B>,
}

impl<B: Backend> fmt::Debug for Aggregate<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Aggregate")
    }
}

/// Run `f` on a leaf holding `input` and copy the result out of the nested
/// session.
fn evaluate_nested<B: Backend>(
    f: &AggregateFn<B>,
    backend: &Rc<B>,
    input: &B::Buffer,
) -> Result<B::Buffer, GraphError> {
    let leaf = Tensor::from_buffer(backend, input.clone(), false)?;
    let session = Session::new(backend);
    let result = f(&leaf)?;
    let value = backend.to_dense(&session.forward(&result)?)?;
    session.close()?;
    Ok(backend.allocate(value))
}

impl<B: Backend> Operation<B> for Aggregate<B> {
    fn name(&self) -> &'static str {
        "aggregate"
    }

    fn infer_shape(&self, _inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        Ok(None)
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let backend = ctx.backend_rc();
        evaluate_nested(&self.f, backend, inputs[0])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        if !ctx.needs_grad(0) {
            return Ok(vec![None]);
        }
        let backend = ctx.backend_rc();
        let value = backend.to_dense(ctx.input(0))?;
        let x = Tensor::from_dense(backend, value, true)?;
        let y = (self.f)(&x)?;
        if y.requires_grad() {
            y.backward_with(grad)?;
        }
        let dx = x.grad()?;
        trace!(node = %x.id(), "aggregate inner backward finished");
        Ok(vec![Some(backend.allocate(dx))])
    }
}

impl<B: Backend> Tensor<B> {
    /// Wrap `f` applied to this node's value in a single graph node.
    ///
    /// The output shape is found by running `f` once, so constructing the
    /// node evaluates this node.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
    /// let y = x.aggregate(|v| v.square()?.sum_all()).unwrap();
    /// y.backward().unwrap();
    /// assert_eq!(y.item().unwrap(), 5.0);
    /// assert_eq!(x.grad().unwrap().data(), &[2.0, 4.0]);
    /// ```
    pub fn aggregate<F>(&self, f: F) -> Result<Tensor<B>, GraphError>
    where
        F: Fn(&Tensor<B>) -> Result<Tensor<B>, GraphError> + 'static,
    {
        let op = Aggregate { f: Rc::new(f) };
        let out = apply(op, &[self])?;
        out.shape()?;
        Ok(out)
    }
}
