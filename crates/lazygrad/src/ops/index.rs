//! Indexed selection and accumulation.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::shape::{Shape, check_axis};

fn check_indices(shape: &[usize], axis: usize, indices: &[usize]) -> Result<(), GraphError> {
    check_axis(axis, shape.len())?;
    if let Some(&index) = indices.iter().find(|&&i| i >= shape[axis]) {
        return Err(GraphError::IndexOutOfBounds {
            index,
            dim_size: shape[axis],
        });
    }
    Ok(())
}

/// `index` must have the rank of `target` and fit inside it off `axis`.
fn check_index_shape(op: &'static str, target: &[usize], axis: usize, index: &[usize]) -> Result<(), GraphError> {
    check_axis(axis, target.len())?;
    if index.len() != target.len() {
        return Err(GraphError::RankMismatch {
            op,
            expected: target.len(),
            actual: index.len(),
        });
    }
    let fits = target
        .iter()
        .zip(index)
        .enumerate()
        .all(|(d, (&t, &i))| d == axis || i <= t);
    if !fits {
        return Err(GraphError::shape_mismatch(op, target, index));
    }
    Ok(())
}

#[derive(Debug)]
struct IndexSelect {
    axis: usize,
    indices: Vec<usize>,
}

impl<B: Backend> Operation<B> for IndexSelect {
    fn name(&self) -> &'static str {
        "index_select"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        check_indices(&inputs[0], self.axis, &self.indices)?;
        let mut shape = inputs[0].clone();
        shape[self.axis] = self.indices.len();
        Ok(Some(shape))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().index_select(inputs[0], self.axis, &self.indices)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let zeros = b.zeros(ctx.input_shape(0));
        Ok(vec![Some(b.index_add(&zeros, self.axis, &self.indices, grad)?)])
    }
}

#[derive(Debug)]
struct IndexAdd {
    axis: usize,
    indices: Vec<usize>,
}

impl<B: Backend> Operation<B> for IndexAdd {
    fn name(&self) -> &'static str {
        "index_add"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let (base, src) = (&inputs[0], &inputs[1]);
        check_indices(base, self.axis, &self.indices)?;
        let mut expected = base.clone();
        expected[self.axis] = self.indices.len();
        if *src != expected {
            return Err(GraphError::shape_mismatch("index_add", &expected, src));
        }
        Ok(Some(base.clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().index_add(inputs[0], self.axis, &self.indices, inputs[1])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let g_src = if ctx.needs_grad(1) {
            Some(ctx.backend().index_select(grad, self.axis, &self.indices)?)
        } else {
            None
        };
        Ok(vec![Some(grad.clone()), g_src])
    }
}

#[derive(Debug)]
struct Gather {
    axis: usize,
}

impl<B: Backend> Operation<B> for Gather {
    fn name(&self) -> &'static str {
        "gather"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        check_index_shape("gather", &inputs[0], self.axis, &inputs[1])?;
        Ok(Some(inputs[1].clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().gather(inputs[0], self.axis, inputs[1])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let zeros = b.zeros(ctx.input_shape(0));
        let gx = b.scatter_add(&zeros, self.axis, ctx.input(1), grad)?;
        Ok(vec![Some(gx), None])
    }
}

#[derive(Debug)]
struct ScatterAdd {
    axis: usize,
}

impl<B: Backend> Operation<B> for ScatterAdd {
    fn name(&self) -> &'static str {
        "scatter_add"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let (base, index, src) = (&inputs[0], &inputs[1], &inputs[2]);
        check_index_shape("scatter_add", base, self.axis, index)?;
        if index != src {
            return Err(GraphError::shape_mismatch("scatter_add", index, src));
        }
        Ok(Some(base.clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        ctx.backend().scatter_add(inputs[0], self.axis, inputs[1], inputs[2])
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let g_src = if ctx.needs_grad(2) {
            Some(ctx.backend().gather(grad, self.axis, ctx.input(1))?)
        } else {
            None
        };
        Ok(vec![Some(grad.clone()), None, g_src])
    }
}

impl<B: Backend> Tensor<B> {
    /// Entries at `indices` along `axis`, in that order. Repeats allowed.
    pub fn index_select(&self, axis: usize, indices: &[usize]) -> Result<Tensor<B>, GraphError> {
        apply(
            IndexSelect {
                axis,
                indices: indices.to_vec(),
            },
            &[self],
        )
    }

    /// `self` with slice `k` of `src` added at position `indices[k]` along
    /// `axis`. Repeated indices accumulate.
    pub fn index_add(&self, axis: usize, indices: &[usize], src: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(
            IndexAdd {
                axis,
                indices: indices.to_vec(),
            },
            &[self, src],
        )
    }

    /// Pick along `axis` with a per-element index tensor of the same rank.
    /// The output takes the shape of `index`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// // [[1, 2], [3, 4]]
    /// let x = Tensor::variable(&cpu, vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap();
    /// let index = Tensor::constant(&cpu, vec![1.0, 0.0], &[2, 1]).unwrap();
    /// let picked = x.gather(1, &index).unwrap();
    /// assert_eq!(picked.to_vec().unwrap(), vec![2.0, 3.0]);
    /// ```
    pub fn gather(&self, axis: usize, index: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(Gather { axis }, &[self, index])
    }

    /// Adjoint of [`Tensor::gather`]: add `src` into `self` at the positions
    /// selected by `index` along `axis`.
    pub fn scatter_add(&self, axis: usize, index: &Tensor<B>, src: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(ScatterAdd { axis }, &[self, index, src])
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use crate::backend::CpuBackend;
    use crate::error::GraphError;
    use crate::graph::Tensor;

    fn cpu() -> Rc<CpuBackend> {
        Rc::new(CpuBackend::new())
    }

    #[test]
    fn test_index_select_repeats_accumulate_gradient() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        let y = x.index_select(0, &[2, 0, 2]).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![3.0, 1.0, 3.0]);
        y.sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[1.0, 0.0, 2.0]);
    }

    #[test]
    fn test_index_select_out_of_bounds() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        assert!(matches!(
            x.index_select(0, &[3]),
            Err(GraphError::IndexOutOfBounds { index: 3, dim_size: 3 })
        ));
    }

    #[test]
    fn test_index_add_gradients() {
        let cpu = cpu();
        let base = Tensor::variable(&cpu, vec![0.0; 3], &[3]).unwrap();
        let src = Tensor::variable(&cpu, vec![5.0, 7.0], &[2]).unwrap();
        let out = base.index_add(0, &[1, 1], &src).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![0.0, 12.0, 0.0]);
        let w = Tensor::constant(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
        out.mul(&w).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(base.grad().unwrap().data(), &[1.0, 2.0, 3.0]);
        assert_eq!(src.grad().unwrap().data(), &[2.0, 2.0]);
    }

    #[test]
    fn test_gather_scatter_adjoint() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap();
        let index = Tensor::constant(&cpu, vec![1.0, 1.0], &[2, 1]).unwrap();
        x.gather(1, &index).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(x.grad().unwrap().data(), &[0.0, 0.0, 1.0, 1.0]);

        let base = Tensor::variable(&cpu, vec![0.0; 4], &[2, 2]).unwrap();
        let src = Tensor::variable(&cpu, vec![1.0, 2.0], &[2, 1]).unwrap();
        let out = base.scatter_add(1, &index, &src).unwrap();
        assert_eq!(out.to_vec().unwrap(), vec![0.0, 0.0, 1.0, 2.0]);
        out.mul(&x).unwrap().sum_all().unwrap().backward().unwrap();
        assert_eq!(src.grad().unwrap().data(), &[2.0, 4.0]);
    }

    #[test]
    fn test_gather_rank_mismatch() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
        let index = Tensor::constant(&cpu, vec![0.0], &[1, 1]).unwrap();
        assert!(matches!(x.gather(0, &index), Err(GraphError::RankMismatch { .. })));
    }
}
