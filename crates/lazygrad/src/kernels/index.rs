//! Indexing kernels: index-select/index-add and gather/scatter-add.
//!
//! Index tensors are ordinary `f64` tensors holding non-negative integers,
//! so the output of `argmax` can be fed back in directly.

use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{Shape, cartesian_to_linear, check_axis, linear_to_cartesian_into};

/// Convert an `f64` index value to `usize`, rejecting non-integral values.
pub fn to_index(value: f64) -> Result<usize, GraphError> {
    if value < 0.0 || value.fract() != 0.0 || !value.is_finite() {
        return Err(GraphError::InvalidIndex { value });
    }
    Ok(value as usize)
}

fn check_bound(index: usize, dim_size: usize) -> Result<usize, GraphError> {
    if index >= dim_size {
        return Err(GraphError::IndexOutOfBounds { index, dim_size });
    }
    Ok(index)
}

/// Select entries along `axis`; the result has `indices.len()` entries there.
pub fn index_select(
    x: &DenseTensor,
    axis: usize,
    indices: &[usize],
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, x.ndim())?;
    let dim = x.shape()[axis];
    for &i in indices {
        check_bound(i, dim)?;
    }
    let mut out_shape = Shape::from_slice(x.shape());
    out_shape[axis] = indices.len();
    let x_strides = x.strides();

    let mut out = DenseTensor::zeros(&out_shape);
    let mut idx = Shape::new();
    for linear in 0..out.len() {
        linear_to_cartesian_into(linear, &out_shape, &mut idx);
        idx[axis] = indices[idx[axis]];
        out.data_mut()[linear] = x.data()[cartesian_to_linear(&idx, &x_strides)];
    }
    Ok(out)
}

/// `base` with `src` added at `indices` along `axis` (duplicates accumulate).
pub fn index_add(
    base: &DenseTensor,
    axis: usize,
    indices: &[usize],
    src: &DenseTensor,
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, base.ndim())?;
    let mut expected = Shape::from_slice(base.shape());
    expected[axis] = indices.len();
    if src.shape() != expected.as_slice() {
        return Err(GraphError::shape_mismatch("index_add", &expected, src.shape()));
    }
    let dim = base.shape()[axis];
    for &i in indices {
        check_bound(i, dim)?;
    }
    let base_strides = base.strides();
    let mut out = base.clone();
    let mut idx = Shape::new();
    for linear in 0..src.len() {
        linear_to_cartesian_into(linear, src.shape(), &mut idx);
        idx[axis] = indices[idx[axis]];
        out.data_mut()[cartesian_to_linear(&idx, &base_strides)] += src.data()[linear];
    }
    Ok(out)
}

fn check_index_rank(op: &'static str, x: &DenseTensor, index: &DenseTensor) -> Result<(), GraphError> {
    if index.ndim() != x.ndim() {
        return Err(GraphError::RankMismatch {
            op,
            expected: x.ndim(),
            actual: index.ndim(),
        });
    }
    Ok(())
}

/// `out[i][j][k] = x[i][index[i][j][k]][k]` for `axis == 1`, and so on.
pub fn gather(x: &DenseTensor, axis: usize, index: &DenseTensor) -> Result<DenseTensor, GraphError> {
    check_axis(axis, x.ndim())?;
    check_index_rank("gather", x, index)?;
    for (d, (&xi, &ii)) in x.shape().iter().zip(index.shape()).enumerate() {
        if d != axis && ii > xi {
            return Err(GraphError::shape_mismatch("gather", x.shape(), index.shape()));
        }
    }
    let dim = x.shape()[axis];
    let x_strides = x.strides();
    let mut out = DenseTensor::zeros(index.shape());
    let mut idx = Shape::new();
    for linear in 0..index.len() {
        linear_to_cartesian_into(linear, index.shape(), &mut idx);
        idx[axis] = check_bound(to_index(index.data()[linear])?, dim)?;
        out.data_mut()[linear] = x.data()[cartesian_to_linear(&idx, &x_strides)];
    }
    Ok(out)
}

/// `base` with `src` added at the positions selected by `index` along `axis`.
/// The adjoint of [`gather`].
pub fn scatter_add(
    base: &DenseTensor,
    axis: usize,
    index: &DenseTensor,
    src: &DenseTensor,
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, base.ndim())?;
    check_index_rank("scatter_add", base, index)?;
    if index.shape() != src.shape() {
        return Err(GraphError::shape_mismatch("scatter_add", index.shape(), src.shape()));
    }
    for (d, (&bi, &ii)) in base.shape().iter().zip(index.shape()).enumerate() {
        if d != axis && ii > bi {
            return Err(GraphError::shape_mismatch("scatter_add", base.shape(), index.shape()));
        }
    }
    let dim = base.shape()[axis];
    let base_strides = base.strides();
    let mut out = base.clone();
    let mut idx = Shape::new();
    for linear in 0..index.len() {
        linear_to_cartesian_into(linear, index.shape(), &mut idx);
        idx[axis] = check_bound(to_index(index.data()[linear])?, dim)?;
        out.data_mut()[cartesian_to_linear(&idx, &base_strides)] += src.data()[linear];
    }
    Ok(out)
}
