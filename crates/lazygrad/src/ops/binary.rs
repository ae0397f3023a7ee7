//! Elementwise binary operations with broadcasting.

use super::{apply, reduce_to};
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::{BinaryOp, CompareOp, UnaryOp};
use crate::shape::{Shape, broadcast_shapes};

#[derive(Debug)]
struct Binary {
    op: BinaryOp,
}

impl<B: Backend> Operation<B> for Binary {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        broadcast_shapes(&inputs[0], &inputs[1]).map(Some)
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().binary(self.op, inputs[0], inputs[1])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let (lhs, rhs) = (ctx.input(0), ctx.input(1));
        let (ga, gb) = match self.op {
            BinaryOp::Add => (Some(grad.clone()), Some(grad.clone())),
            BinaryOp::Sub => (Some(grad.clone()), Some(b.unary(UnaryOp::Neg, grad)?)),
            BinaryOp::Mul => (
                Some(b.binary(BinaryOp::Mul, grad, rhs)?),
                Some(b.binary(BinaryOp::Mul, grad, lhs)?),
            ),
            BinaryOp::Div => {
                let ga = b.binary(BinaryOp::Div, grad, rhs)?;
                // d(a/b)/db = -y / b
                let gy = b.binary(BinaryOp::Mul, &ga, ctx.output())?;
                (Some(ga), Some(b.unary(UnaryOp::Neg, &gy)?))
            }
            BinaryOp::Pow => {
                let lowered = b.scalar_op(BinaryOp::Sub, rhs, 1.0, false)?;
                let power = b.binary(BinaryOp::Pow, lhs, &lowered)?;
                let slope = b.binary(BinaryOp::Mul, rhs, &power)?;
                let ga = b.binary(BinaryOp::Mul, grad, &slope)?;
                let gb = if ctx.needs_grad(1) {
                    let log = b.unary(UnaryOp::Ln, lhs)?;
                    let slope = b.binary(BinaryOp::Mul, ctx.output(), &log)?;
                    Some(b.binary(BinaryOp::Mul, grad, &slope)?)
                } else {
                    None
                };
                (Some(ga), gb)
            }
            BinaryOp::Maximum | BinaryOp::Minimum => {
                // ties route the gradient to the left operand
                let cmp = if self.op == BinaryOp::Maximum { CompareOp::Ge } else { CompareOp::Le };
                let mask = b.compare(cmp, lhs, rhs)?;
                let ga = b.binary(BinaryOp::Mul, grad, &mask)?;
                let gb = b.binary(BinaryOp::Sub, grad, &ga)?;
                (Some(ga), Some(gb))
            }
        };
        let ga = ga.map(|g| reduce_to(b, &g, ctx.input_shape(0))).transpose()?;
        let gb = gb.map(|g| reduce_to(b, &g, ctx.input_shape(1))).transpose()?;
        Ok(vec![ga, gb])
    }
}

impl<B: Backend> Tensor<B> {
    fn binary(&self, op: BinaryOp, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(Binary { op }, &[self, other])
    }

    /// Elementwise sum with broadcasting.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// let m = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
    /// let row = Tensor::variable(&cpu, vec![10.0, 20.0], &[2]).unwrap();
    /// let s = m.add(&row).unwrap();
    /// assert_eq!(s.to_vec().unwrap(), vec![11.0, 12.0, 23.0, 24.0]);
    ///
    /// s.sum_all().unwrap().backward().unwrap();
    /// assert_eq!(row.grad().unwrap().data(), &[2.0, 2.0]);
    /// ```
    pub fn add(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Div, other)
    }

    /// `self ^ other`. The exponent's gradient uses `ln(self)`, so it is only
    /// finite for positive bases.
    pub fn pow(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Pow, other)
    }

    pub fn maximum(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Maximum, other)
    }

    pub fn minimum(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        self.binary(BinaryOp::Minimum, other)
    }
}
