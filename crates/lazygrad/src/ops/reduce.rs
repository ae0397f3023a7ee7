//! Reductions over axes.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::{ArgReduceOp, BinaryOp, CompareOp, ReduceOp};
use crate::shape::{Shape, check_axis, normalize_axes, reduced_shape};

#[derive(Debug)]
struct Reduce {
    op: ReduceOp,
    /// Sorted, deduplicated, never empty unless the input is rank 0.
    axes: Shape,
    keep_dims: bool,
}

impl Reduce {
    fn count(&self, input: &[usize]) -> usize {
        self.axes.iter().map(|&a| input[a]).product()
    }
}

impl<B: Backend> Operation<B> for Reduce {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let input = &inputs[0];
        normalize_axes(&self.axes, input.len())?;
        if self.count(input) == 0 && self.op != ReduceOp::Sum {
            return Err(GraphError::InvalidOperation(format!(
                "{} over an empty axis",
                self.op.name()
            )));
        }
        Ok(Some(reduced_shape(input, &self.axes, self.keep_dims)))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().reduce(self.op, inputs[0], &self.axes, self.keep_dims)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let input_shape = ctx.input_shape(0);
        let kept = reduced_shape(input_shape, &self.axes, true);
        let grad_kept = b.reshape(grad, &kept)?;
        let dx = match self.op {
            ReduceOp::Sum => b.broadcast_to(&grad_kept, input_shape)?,
            ReduceOp::Mean => {
                let spread = b.broadcast_to(&grad_kept, input_shape)?;
                b.scalar_op(BinaryOp::Div, &spread, self.count(input_shape) as f64, false)?
            }
            ReduceOp::Max | ReduceOp::Min => {
                // ties share the gradient evenly
                let extreme = b.reshape(ctx.output(), &kept)?;
                let extreme = b.broadcast_to(&extreme, input_shape)?;
                let mask = b.compare(CompareOp::Eq, ctx.input(0), &extreme)?;
                let ties = b.reduce(ReduceOp::Sum, &mask, &self.axes, true)?;
                let weight = b.binary(BinaryOp::Div, &mask, &ties)?;
                b.binary(BinaryOp::Mul, &weight, &grad_kept)?
            }
        };
        Ok(vec![Some(dx)])
    }
}

#[derive(Debug)]
struct ArgReduce {
    op: ArgReduceOp,
    axis: usize,
    keep_dims: bool,
}

impl<B: Backend> Operation<B> for ArgReduce {
    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let input = &inputs[0];
        check_axis(self.axis, input.len())?;
        if input[self.axis] == 0 {
            return Err(GraphError::InvalidOperation(format!(
                "{} over an empty axis",
                self.op.name()
            )));
        }
        Ok(Some(reduced_shape(input, &[self.axis], self.keep_dims)))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().arg_reduce(self.op, inputs[0], self.axis, self.keep_dims)
    }

    fn backward(&self, _ctx: &BackwardContext<'_, B>, _grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        Ok(vec![None])
    }

    fn differentiable(&self) -> bool {
        false
    }
}

impl<B: Backend> Tensor<B> {
    fn reduce(&self, op: ReduceOp, axes: &[usize], keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        let axes = normalize_axes(axes, self.ndim()?)?;
        apply(Reduce { op, axes, keep_dims }, &[self])
    }

    /// Sum over `axes`; an empty slice reduces every axis.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// // [[1, 2, 3], [4, 5, 6]]
    /// let m = Tensor::constant(&cpu, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(m.sum(&[1], false).unwrap().to_vec().unwrap(), vec![6.0, 15.0]);
    /// assert_eq!(m.sum(&[0], true).unwrap().shape().unwrap().as_slice(), &[1, 3]);
    /// ```
    pub fn sum(&self, axes: &[usize], keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        self.reduce(ReduceOp::Sum, axes, keep_dims)
    }

    pub fn mean(&self, axes: &[usize], keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        self.reduce(ReduceOp::Mean, axes, keep_dims)
    }

    pub fn max(&self, axes: &[usize], keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        self.reduce(ReduceOp::Max, axes, keep_dims)
    }

    pub fn min(&self, axes: &[usize], keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        self.reduce(ReduceOp::Min, axes, keep_dims)
    }

    /// Sum of every element, as a rank-0 tensor.
    pub fn sum_all(&self) -> Result<Tensor<B>, GraphError> {
        self.sum(&[], false)
    }

    pub fn mean_all(&self) -> Result<Tensor<B>, GraphError> {
        self.mean(&[], false)
    }

    /// Position of the maximum along `axis` (first one on ties).
    pub fn argmax(&self, axis: usize, keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        apply(
            ArgReduce {
                op: ArgReduceOp::ArgMax,
                axis,
                keep_dims,
            },
            &[self],
        )
    }

    pub fn argmin(&self, axis: usize, keep_dims: bool) -> Result<Tensor<B>, GraphError> {
        apply(
            ArgReduce {
                op: ArgReduceOp::ArgMin,
                axis,
                keep_dims,
            },
            &[self],
        )
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use approx::assert_relative_eq;

    use crate::backend::CpuBackend;
    use crate::graph::Tensor;

    fn cpu() -> Rc<CpuBackend> {
        Rc::new(CpuBackend::new())
    }

    #[test]
    fn test_mean_gradient_is_uniform() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0, 4.0], &[4]).unwrap();
        let m = x.mean_all().unwrap();
        assert_relative_eq!(m.item().unwrap(), 2.5);
        m.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.25; 4]);
    }

    #[test]
    fn test_sum_axis_gradient_broadcasts() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0; 6], &[2, 3]).unwrap();
        let w = Tensor::constant(&cpu, vec![1.0, 2.0], &[2]).unwrap();
        x.sum(&[1], false).unwrap().mul(&w).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_max_gradient_splits_ties() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![3.0, 1.0, 3.0], &[3]).unwrap();
        let m = x.max(&[0], false).unwrap();
        assert_eq!(m.item().unwrap(), 3.0);
        m.backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.5, 0.0, 0.5]);
    }

    #[test]
    fn test_min_over_axis() {
        let cpu = cpu();
        // [[1, 5], [4, 2]]
        let x = Tensor::variable(&cpu, vec![1.0, 4.0, 5.0, 2.0], &[2, 2]).unwrap();
        let m = x.min(&[1], false).unwrap();
        assert_eq!(m.to_vec().unwrap(), vec![1.0, 2.0]);
        m.sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_argmax_is_not_differentiable() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 4.0, 5.0, 2.0], &[2, 2]).unwrap();
        let idx = x.argmax(1, false).unwrap();
        assert!(!idx.requires_grad());
        assert_eq!(idx.to_vec().unwrap(), vec![1.0, 0.0]);
        assert_eq!(x.argmin(0, true).unwrap().to_vec().unwrap(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_invalid_axis() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
        assert!(x.sum(&[1], false).is_err());
        assert!(x.argmax(2, false).is_err());
    }
}
