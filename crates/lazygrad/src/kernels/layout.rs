//! Layout kernels: permutation, broadcasting, slicing and concatenation.

use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{
    Shape, broadcast_strides, can_broadcast_to, cartesian_to_linear, check_axis, compute_strides,
    linear_to_cartesian_into, numel, validate_permutation,
};

/// Permute dimensions. `perm[i]` is the source dimension of result dimension `i`.
pub fn permute(src: &DenseTensor, perm: &[usize]) -> Result<DenseTensor, GraphError> {
    validate_permutation(perm, src.ndim())?;
    let new_shape: Shape = perm.iter().map(|&p| src.shape()[p]).collect();
    let new_strides = compute_strides(&new_shape);

    let mut dest = DenseTensor::zeros(&new_shape);
    let mut old_idx = Shape::new();
    let mut new_idx = Shape::new();
    for linear_old in 0..src.len() {
        linear_to_cartesian_into(linear_old, src.shape(), &mut old_idx);
        new_idx.clear();
        new_idx.extend(perm.iter().map(|&p| old_idx[p]));
        let linear_new = cartesian_to_linear(&new_idx, &new_strides);
        dest.data_mut()[linear_new] = src.data()[linear_old];
    }
    Ok(dest)
}

/// Materialize `src` broadcast to `shape`.
pub fn broadcast_to(src: &DenseTensor, shape: &[usize]) -> Result<DenseTensor, GraphError> {
    if !can_broadcast_to(src.shape(), shape) {
        return Err(GraphError::BroadcastMismatch {
            lhs: src.shape().to_vec(),
            rhs: shape.to_vec(),
        });
    }
    let strides = broadcast_strides(src.shape(), shape);
    let total = numel(shape);
    let mut data = Vec::with_capacity(total);
    let mut idx = Shape::new();
    for linear in 0..total {
        linear_to_cartesian_into(linear, shape, &mut idx);
        data.push(src.data()[cartesian_to_linear(&idx, &strides)]);
    }
    DenseTensor::from_vec(data, shape)
}

/// Sum `src` down to `shape`, the adjoint of [`broadcast_to`].
///
/// Used to reduce the gradient of a broadcast operand back to its own shape.
pub fn sum_to(src: &DenseTensor, shape: &[usize]) -> Result<DenseTensor, GraphError> {
    if src.shape() == shape {
        return Ok(src.clone());
    }
    if !can_broadcast_to(shape, src.shape()) {
        return Err(GraphError::BroadcastMismatch {
            lhs: shape.to_vec(),
            rhs: src.shape().to_vec(),
        });
    }
    let strides = broadcast_strides(shape, src.shape());
    let mut out = DenseTensor::zeros(shape);
    let mut idx = Shape::new();
    for linear in 0..src.len() {
        linear_to_cartesian_into(linear, src.shape(), &mut idx);
        out.data_mut()[cartesian_to_linear(&idx, &strides)] += src.data()[linear];
    }
    Ok(out)
}

/// Slice `len` entries along `axis` starting at `start`.
pub fn narrow(
    src: &DenseTensor,
    axis: usize,
    start: usize,
    len: usize,
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, src.ndim())?;
    let dim = src.shape()[axis];
    if start.checked_add(len).is_none_or(|end| end > dim) {
        return Err(GraphError::IndexOutOfBounds {
            index: start.saturating_add(len),
            dim_size: dim,
        });
    }
    let mut out_shape = Shape::from_slice(src.shape());
    out_shape[axis] = len;
    let src_strides = src.strides();

    let total = numel(&out_shape);
    let mut data = Vec::with_capacity(total);
    let mut idx = Shape::new();
    for linear in 0..total {
        linear_to_cartesian_into(linear, &out_shape, &mut idx);
        idx[axis] += start;
        data.push(src.data()[cartesian_to_linear(&idx, &src_strides)]);
    }
    DenseTensor::from_vec(data, &out_shape)
}

/// Write `src` into a copy of `base` at offset `start` along `axis`.
///
/// With a zero `base` this is the adjoint of [`narrow`].
pub fn embed(
    base: &DenseTensor,
    src: &DenseTensor,
    axis: usize,
    start: usize,
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, base.ndim())?;
    if src.ndim() != base.ndim() {
        return Err(GraphError::RankMismatch {
            op: "embed",
            expected: base.ndim(),
            actual: src.ndim(),
        });
    }
    for (i, (&b, &s)) in base.shape().iter().zip(src.shape()).enumerate() {
        let fits = if i == axis { start.checked_add(s).is_some_and(|end| end <= b) } else { s == b };
        if !fits {
            return Err(GraphError::shape_mismatch("embed", base.shape(), src.shape()));
        }
    }
    let base_strides = base.strides();
    let mut out = base.clone();
    let mut idx = Shape::new();
    for linear in 0..src.len() {
        linear_to_cartesian_into(linear, src.shape(), &mut idx);
        idx[axis] += start;
        out.data_mut()[cartesian_to_linear(&idx, &base_strides)] = src.data()[linear];
    }
    Ok(out)
}

/// Concatenate tensors along `axis`. All other dimensions must agree.
pub fn concat(parts: &[&DenseTensor], axis: usize) -> Result<DenseTensor, GraphError> {
    let first = parts.first().ok_or(GraphError::EmptyConcat)?;
    check_axis(axis, first.ndim())?;
    let mut out_shape = Shape::from_slice(first.shape());
    out_shape[axis] = 0;
    for part in parts {
        if part.ndim() != first.ndim() {
            return Err(GraphError::RankMismatch {
                op: "concat",
                expected: first.ndim(),
                actual: part.ndim(),
            });
        }
        for (i, (&a, &b)) in first.shape().iter().zip(part.shape()).enumerate() {
            if i != axis && a != b {
                return Err(GraphError::shape_mismatch("concat", first.shape(), part.shape()));
            }
        }
        out_shape[axis] += part.shape()[axis];
    }

    let mut out = DenseTensor::zeros(&out_shape);
    let mut offset = 0;
    for part in parts {
        out = embed(&out, part, axis, offset)?;
        offset += part.shape()[axis];
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64], shape: &[usize]) -> DenseTensor {
        DenseTensor::from_vec(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_permute_transpose() {
        let src = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let dst = permute(&src, &[1, 0]).unwrap();
        assert_eq!(dst.shape(), &[3, 2]);
        for i in 0..2 {
            for j in 0..3 {
                assert_eq!(src.get(&[i, j]), dst.get(&[j, i]));
            }
        }
    }

    #[test]
    fn test_broadcast_and_sum_to_are_adjoint() {
        let row = t(&[1.0, 2.0, 3.0], &[3]);
        let b = broadcast_to(&row, &[2, 3]).unwrap();
        assert_eq!(b.data(), &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);
        let s = sum_to(&b, &[3]).unwrap();
        assert_eq!(s.data(), &[2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_sum_to_keepdim_shape() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s = sum_to(&x, &[2, 1]).unwrap();
        assert_eq!(s.data(), &[9.0, 12.0]);
        assert!(sum_to(&x, &[4]).is_err());
    }

    #[test]
    fn test_narrow_and_embed() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let n = narrow(&x, 1, 1, 2).unwrap();
        assert_eq!(n.shape(), &[2, 2]);
        assert_eq!(n.data(), &[3.0, 4.0, 5.0, 6.0]);

        let back = embed(&DenseTensor::zeros(&[2, 3]), &n, 1, 1).unwrap();
        assert_eq!(back.data(), &[0.0, 0.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(narrow(&x, 1, 2, 2).is_err());
        assert!(matches!(
            narrow(&x, 1, usize::MAX, 2),
            Err(GraphError::IndexOutOfBounds { index: usize::MAX, dim_size: 3 })
        ));
        assert!(embed(&x, &n, 1, usize::MAX).is_err());
    }

    #[test]
    fn test_concat() {
        let a = t(&[1.0, 2.0], &[2, 1]);
        let b = t(&[3.0, 4.0, 5.0, 6.0], &[2, 2]);
        let c = concat(&[&a, &b], 1).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(matches!(concat(&[], 0), Err(GraphError::EmptyConcat)));
    }
}
