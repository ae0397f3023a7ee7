//! Layout operations: reshape, permutation, broadcasting, slicing and
//! concatenation.

use std::ops::Range;

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::shape::{
    Shape, can_broadcast_to, check_axis, invert_permutation, numel, shape_of, validate_permutation,
};

#[derive(Debug)]
struct Reshape {
    shape: Shape,
}

impl<B: Backend> Operation<B> for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        if numel(&inputs[0]) != numel(&self.shape) {
            return Err(GraphError::shape_mismatch("reshape", &inputs[0], &self.shape));
        }
        Ok(Some(self.shape.clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().reshape(inputs[0], &self.shape)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        Ok(vec![Some(ctx.backend().reshape(grad, ctx.input_shape(0))?)])
    }
}

#[derive(Debug)]
struct Permute {
    perm: Vec<usize>,
}

impl<B: Backend> Operation<B> for Permute {
    fn name(&self) -> &'static str {
        "permute"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        validate_permutation(&self.perm, inputs[0].len())?;
        Ok(Some(self.perm.iter().map(|&p| inputs[0][p]).collect()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().permute(inputs[0], &self.perm)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let inverse = invert_permutation(&self.perm);
        Ok(vec![Some(ctx.backend().permute(grad, &inverse)?)])
    }
}

#[derive(Debug)]
struct BroadcastTo {
    shape: Shape,
}

impl<B: Backend> Operation<B> for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        if !can_broadcast_to(&inputs[0], &self.shape) {
            return Err(GraphError::BroadcastMismatch {
                lhs: inputs[0].to_vec(),
                rhs: self.shape.to_vec(),
            });
        }
        Ok(Some(self.shape.clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().broadcast_to(inputs[0], &self.shape)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        Ok(vec![Some(ctx.backend().sum_to(grad, ctx.input_shape(0))?)])
    }
}

fn check_range(shape: &[usize], axis: usize, start: usize, len: usize) -> Result<(), GraphError> {
    check_axis(axis, shape.len())?;
    let dim_size = shape[axis];
    if start.checked_add(len).is_none_or(|end| end > dim_size) {
        return Err(GraphError::IndexOutOfBounds {
            index: start.saturating_add(len),
            dim_size,
        });
    }
    Ok(())
}

#[derive(Debug)]
struct Narrow {
    axis: usize,
    start: usize,
    len: usize,
}

impl<B: Backend> Operation<B> for Narrow {
    fn name(&self) -> &'static str {
        "narrow"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        check_range(&inputs[0], self.axis, self.start, self.len)?;
        let mut shape = inputs[0].clone();
        shape[self.axis] = self.len;
        Ok(Some(shape))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().narrow(inputs[0], self.axis, self.start, self.len)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let zeros = b.zeros(ctx.input_shape(0));
        Ok(vec![Some(b.embed(&zeros, grad, self.axis, self.start)?)])
    }
}

#[derive(Debug)]
struct Concat {
    axis: usize,
}

impl<B: Backend> Operation<B> for Concat {
    fn name(&self) -> &'static str {
        "concat"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let first = inputs.first().ok_or(GraphError::EmptyConcat)?;
        check_axis(self.axis, first.len())?;
        let mut out = first.clone();
        out[self.axis] = 0;
        for part in inputs {
            if part.len() != first.len() {
                return Err(GraphError::RankMismatch {
                    op: "concat",
                    expected: first.len(),
                    actual: part.len(),
                });
            }
            let agrees = part
                .iter()
                .zip(first.iter())
                .enumerate()
                .all(|(i, (a, b))| i == self.axis || a == b);
            if !agrees {
                return Err(GraphError::shape_mismatch("concat", first, part));
            }
            out[self.axis] += part[self.axis];
        }
        Ok(Some(out))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().concat(inputs, self.axis)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let mut offset = 0;
        let mut grads = Vec::with_capacity(ctx.num_inputs());
        for i in 0..ctx.num_inputs() {
            let len = ctx.input_shape(i)[self.axis];
            let part = if ctx.needs_grad(i) {
                Some(ctx.backend().narrow(grad, self.axis, offset, len)?)
            } else {
                None
            };
            grads.push(part);
            offset += len;
        }
        Ok(grads)
    }
}

/// `base` with the slice at `start` along `axis` replaced by `values`.
#[derive(Debug)]
struct SetNarrow {
    axis: usize,
    start: usize,
}

impl<B: Backend> Operation<B> for SetNarrow {
    fn name(&self) -> &'static str {
        "set_narrow"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let (base, values) = (&inputs[0], &inputs[1]);
        if base.len() != values.len() {
            return Err(GraphError::RankMismatch {
                op: "set_narrow",
                expected: base.len(),
                actual: values.len(),
            });
        }
        check_axis(self.axis, base.len())?;
        for (i, (&b, &v)) in base.iter().zip(values.iter()).enumerate() {
            if i != self.axis && b != v {
                return Err(GraphError::shape_mismatch("set_narrow", base, values));
            }
        }
        check_range(base, self.axis, self.start, values[self.axis])?;
        Ok(Some(base.clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().embed(inputs[0], inputs[1], self.axis, self.start)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let values_shape = ctx.input_shape(1);
        let g_base = if ctx.needs_grad(0) {
            let hole = b.zeros(values_shape);
            Some(b.embed(grad, &hole, self.axis, self.start)?)
        } else {
            None
        };
        let g_values = if ctx.needs_grad(1) {
            Some(b.narrow(grad, self.axis, self.start, values_shape[self.axis])?)
        } else {
            None
        };
        Ok(vec![g_base, g_values])
    }
}

impl<B: Backend> Tensor<B> {
    /// Same elements under a new shape. Element counts must agree.
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor<B>, GraphError> {
        apply(Reshape { shape: shape_of(shape) }, &[self])
    }

    /// Reorder axes: output axis `i` is input axis `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor<B>, GraphError> {
        apply(Permute { perm: perm.to_vec() }, &[self])
    }

    /// Swap two axes.
    pub fn transpose(&self, a: usize, b: usize) -> Result<Tensor<B>, GraphError> {
        let ndim = self.ndim()?;
        check_axis(a, ndim)?;
        check_axis(b, ndim)?;
        let mut perm: Vec<usize> = (0..ndim).collect();
        perm.swap(a, b);
        self.permute(&perm)
    }

    /// Drop a size-one axis.
    pub fn squeeze(&self, axis: usize) -> Result<Tensor<B>, GraphError> {
        let shape = self.shape()?;
        check_axis(axis, shape.len())?;
        if shape[axis] != 1 {
            let mut expected = shape.clone();
            expected[axis] = 1;
            return Err(GraphError::shape_mismatch("squeeze", &expected, &shape));
        }
        let mut out = shape;
        out.remove(axis);
        self.reshape(&out)
    }

    /// Insert a size-one axis at `axis` (which may equal the rank).
    pub fn unsqueeze(&self, axis: usize) -> Result<Tensor<B>, GraphError> {
        let mut shape = self.shape()?;
        if axis > shape.len() {
            return Err(GraphError::InvalidAxis {
                axis,
                ndim: shape.len(),
            });
        }
        shape.insert(axis, 1);
        self.reshape(&shape)
    }

    /// Entries `start..start + len` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor<B>, GraphError> {
        apply(Narrow { axis, start, len }, &[self])
    }

    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor<B>, GraphError> {
        apply(BroadcastTo { shape: shape_of(shape) }, &[self])
    }

    /// Join tensors along `axis`; all other dimensions must agree.
    pub fn concat(parts: &[&Tensor<B>], axis: usize) -> Result<Tensor<B>, GraphError> {
        if parts.is_empty() {
            return Err(GraphError::EmptyConcat);
        }
        apply(Concat { axis }, parts)
    }

    /// Entry `index` along the first axis, with that axis removed.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// // [[1, 2], [3, 4]] stored column-major
    /// let m = Tensor::variable(&cpu, vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap();
    /// let row = m.get(1).unwrap();
    /// assert_eq!(row.shape().unwrap().as_slice(), &[2]);
    /// assert_eq!(row.to_vec().unwrap(), vec![3.0, 4.0]);
    /// ```
    pub fn get(&self, index: usize) -> Result<Tensor<B>, GraphError> {
        let shape = self.shape()?;
        let row = self.narrow(0, index, 1)?;
        row.reshape(&shape[1..])
    }

    /// Entries `range` along the first axis.
    pub fn get_range(&self, range: Range<usize>) -> Result<Tensor<B>, GraphError> {
        if range.start > range.end {
            return Err(GraphError::InvalidOperation(format!(
                "get_range with decreasing range {}..{}",
                range.start, range.end
            )));
        }
        self.narrow(0, range.start, range.end - range.start)
    }

    /// Copy of `self` with the slice at `start` along `axis` replaced by
    /// `values`. Gradients flow to both operands; the overwritten region
    /// contributes nothing to `self`.
    pub fn set_narrow(&self, axis: usize, start: usize, values: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(SetNarrow { axis, start }, &[self, values])
    }
}
