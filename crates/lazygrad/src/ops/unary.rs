//! Elementwise unary maps.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::{BinaryOp, UnaryOp};
use crate::shape::Shape;

#[derive(Debug)]
struct Unary {
    op: UnaryOp,
}

impl<B: Backend> Operation<B> for Unary {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        Ok(Some(inputs[0].clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().unary(self.op, inputs[0])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let x = ctx.input(0);
        let y = ctx.output();
        let dx = match self.op {
            UnaryOp::Neg => b.unary(UnaryOp::Neg, grad)?,
            UnaryOp::Exp => b.binary(BinaryOp::Mul, grad, y)?,
            UnaryOp::Ln => b.binary(BinaryOp::Div, grad, x)?,
            UnaryOp::Sqrt => {
                let half = b.binary(BinaryOp::Div, grad, y)?;
                b.scalar_op(BinaryOp::Mul, &half, 0.5, false)?
            }
            UnaryOp::Abs => {
                let sign = b.unary(UnaryOp::Sign, x)?;
                b.binary(BinaryOp::Mul, grad, &sign)?
            }
            UnaryOp::Relu => {
                let mask = b.unary(UnaryOp::Step, x)?;
                b.binary(BinaryOp::Mul, grad, &mask)?
            }
            UnaryOp::Sigmoid => {
                // y * (1 - y)
                let rest = b.scalar_op(BinaryOp::Sub, y, 1.0, true)?;
                let slope = b.binary(BinaryOp::Mul, y, &rest)?;
                b.binary(BinaryOp::Mul, grad, &slope)?
            }
            UnaryOp::Tanh => {
                let y2 = b.unary(UnaryOp::Square, y)?;
                let slope = b.scalar_op(BinaryOp::Sub, &y2, 1.0, true)?;
                b.binary(BinaryOp::Mul, grad, &slope)?
            }
            UnaryOp::Square => {
                let twice = b.scalar_op(BinaryOp::Mul, x, 2.0, false)?;
                b.binary(BinaryOp::Mul, grad, &twice)?
            }
            UnaryOp::Identity => grad.clone(),
            UnaryOp::Step | UnaryOp::Sign => b.zeros(ctx.input_shape(0)),
        };
        Ok(vec![Some(dx)])
    }
}

impl<B: Backend> Tensor<B> {
    fn unary(&self, op: UnaryOp) -> Result<Tensor<B>, GraphError> {
        apply(Unary { op }, &[self])
    }

    pub fn neg(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Exp)
    }

    /// Natural logarithm.
    pub fn ln(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Ln)
    }

    pub fn sqrt(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn abs(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Abs)
    }

    pub fn relu(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Relu)
    }

    pub fn sigmoid(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn tanh(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn square(&self) -> Result<Tensor<B>, GraphError> {
        self.unary(UnaryOp::Square)
    }
}
