//! Elementwise comparisons producing 0/1 masks. Gradients stop here.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::CompareOp;
use crate::shape::{Shape, broadcast_shapes};

#[derive(Debug)]
struct Compare {
    op: CompareOp,
}

impl<B: Backend> Operation<B> for Compare {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        broadcast_shapes(&inputs[0], &inputs[1]).map(Some)
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().compare(self.op, inputs[0], inputs[1])
    }

    fn backward(&self, _ctx: &BackwardContext<'_, B>, _grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        Ok(vec![None, None])
    }

    fn differentiable(&self) -> bool {
        false
    }
}

impl<B: Backend> Tensor<B> {
    fn compare(&self, op: CompareOp, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(Compare { op }, &[self, other])
    }

    pub fn gt(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.compare(CompareOp::Gt, other)
    }

    pub fn ge(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.compare(CompareOp::Ge, other)
    }

    pub fn lt(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.compare(CompareOp::Lt, other)
    }

    pub fn le(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.compare(CompareOp::Le, other)
    }

    /// Elementwise equality mask.
    pub fn eq_elem(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.compare(CompareOp::Eq, other)
    }
}
