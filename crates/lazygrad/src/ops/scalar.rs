//! Elementwise operations with a constant operand.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::{BinaryOp, UnaryOp};
use crate::shape::Shape;

/// `x op c`, or `c op x` when `reversed`.
#[derive(Debug)]
struct ScalarOp {
    op: BinaryOp,
    c: f64,
    reversed: bool,
}

impl<B: Backend> Operation<B> for ScalarOp {
    fn name(&self) -> &'static str {
        match (self.op, self.reversed) {
            (BinaryOp::Add, _) => "add_scalar",
            (BinaryOp::Sub, false) => "sub_scalar",
            (BinaryOp::Sub, true) => "rsub_scalar",
            (BinaryOp::Mul, _) => "mul_scalar",
            (BinaryOp::Div, false) => "div_scalar",
            (BinaryOp::Div, true) => "rdiv_scalar",
            (BinaryOp::Pow, false) => "powf",
            (BinaryOp::Pow, true) => "rpowf",
            (BinaryOp::Maximum, _) => "clamp_min",
            (BinaryOp::Minimum, _) => "clamp_max",
        }
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        Ok(Some(inputs[0].clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().scalar_op(self.op, inputs[0], self.c, self.reversed)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let x = ctx.input(0);
        let c = self.c;
        let dx = match (self.op, self.reversed) {
            (BinaryOp::Add, _) | (BinaryOp::Sub, false) => grad.clone(),
            (BinaryOp::Sub, true) => b.unary(UnaryOp::Neg, grad)?,
            (BinaryOp::Mul, _) => b.scalar_op(BinaryOp::Mul, grad, c, false)?,
            (BinaryOp::Div, false) => b.scalar_op(BinaryOp::Div, grad, c, false)?,
            (BinaryOp::Div, true) => {
                // d(c/x) = -c / x^2
                let x2 = b.unary(UnaryOp::Square, x)?;
                let slope = b.scalar_op(BinaryOp::Div, &x2, -c, true)?;
                b.binary(BinaryOp::Mul, grad, &slope)?
            }
            (BinaryOp::Pow, false) => {
                let lowered = b.scalar_op(BinaryOp::Pow, x, c - 1.0, false)?;
                let slope = b.scalar_op(BinaryOp::Mul, &lowered, c, false)?;
                b.binary(BinaryOp::Mul, grad, &slope)?
            }
            (BinaryOp::Pow, true) => {
                let slope = b.scalar_op(BinaryOp::Mul, ctx.output(), c.ln(), false)?;
                b.binary(BinaryOp::Mul, grad, &slope)?
            }
            (BinaryOp::Maximum, _) => {
                let above = b.scalar_op(BinaryOp::Sub, x, c, false)?;
                let mask = b.unary(UnaryOp::Step, &above)?;
                b.binary(BinaryOp::Mul, grad, &mask)?
            }
            (BinaryOp::Minimum, _) => {
                let below = b.scalar_op(BinaryOp::Sub, x, c, true)?;
                let mask = b.unary(UnaryOp::Step, &below)?;
                b.binary(BinaryOp::Mul, grad, &mask)?
            }
        };
        Ok(vec![Some(dx)])
    }
}

impl<B: Backend> Tensor<B> {
    fn scalar_op(&self, op: BinaryOp, c: f64, reversed: bool) -> Result<Tensor<B>, GraphError> {
        apply(ScalarOp { op, c, reversed }, &[self])
    }

    /// `self + c`
    pub fn add_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Add, c, false)
    }

    /// `self - c`
    pub fn sub_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Sub, c, false)
    }

    /// `c - self`
    pub fn rsub_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Sub, c, true)
    }

    /// `self * c`
    pub fn mul_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Mul, c, false)
    }

    /// `self / c`
    pub fn div_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Div, c, false)
    }

    /// `c / self`
    pub fn rdiv_scalar(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Div, c, true)
    }

    /// `self ^ c`
    pub fn powf(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Pow, c, false)
    }

    /// `max(self, c)` elementwise. The gradient passes where `self > c`.
    pub fn clamp_min(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Maximum, c, false)
    }

    /// `min(self, c)` elementwise. The gradient passes where `self < c`.
    pub fn clamp_max(&self, c: f64) -> Result<Tensor<B>, GraphError> {
        self.scalar_op(BinaryOp::Minimum, c, false)
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use approx::assert_relative_eq;

    use crate::backend::CpuBackend;
    use crate::graph::Tensor;

    #[test]
    fn test_scalar_forward_values() {
        let cpu = Rc::new(CpuBackend::new());
        let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
        assert_eq!(x.add_scalar(1.0).unwrap().to_vec().unwrap(), vec![2.0, 3.0]);
        assert_eq!(x.rsub_scalar(1.0).unwrap().to_vec().unwrap(), vec![0.0, -1.0]);
        assert_eq!(x.rdiv_scalar(4.0).unwrap().to_vec().unwrap(), vec![4.0, 2.0]);
        assert_eq!(x.powf(3.0).unwrap().to_vec().unwrap(), vec![1.0, 8.0]);
        assert_eq!(x.clamp_min(1.5).unwrap().to_vec().unwrap(), vec![1.5, 2.0]);
    }

    #[test]
    fn test_rdiv_gradient() {
        let cpu = Rc::new(CpuBackend::new());
        let x = Tensor::variable(&cpu, vec![2.0], &[1]).unwrap();
        x.rdiv_scalar(3.0).unwrap().sum_all().unwrap().backward().unwrap();
        assert_relative_eq!(x.grad().unwrap().data()[0], -0.75);
    }

    #[test]
    fn test_powf_gradient() {
        let cpu = Rc::new(CpuBackend::new());
        let x = Tensor::variable(&cpu, vec![2.0], &[1]).unwrap();
        x.powf(3.0).unwrap().sum_all().unwrap().backward().unwrap();
        assert_relative_eq!(x.grad().unwrap().data()[0], 12.0);
    }

    #[test]
    fn test_clamp_gradients() {
        let cpu = Rc::new(CpuBackend::new());
        let x = Tensor::variable(&cpu, vec![0.0, 2.0], &[2]).unwrap();
        let y = x.clamp_min(1.0).unwrap().add(&x.clamp_max(1.0).unwrap()).unwrap();
        y.sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 1.0]);
    }
}
