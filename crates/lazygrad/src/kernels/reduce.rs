//! Reductions over axes.

use super::{ArgReduceOp, ReduceOp};
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{
    Shape, cartesian_to_linear, check_axis, compute_strides, linear_to_cartesian_into,
    normalize_axes, numel, reduced_shape,
};

/// Reduce over `axes` (empty means all axes).
pub fn reduce(
    x: &DenseTensor,
    op: ReduceOp,
    axes: &[usize],
    keep_dims: bool,
) -> Result<DenseTensor, GraphError> {
    let axes = normalize_axes(axes, x.ndim())?;
    let kept_shape = reduced_shape(x.shape(), &axes, true);
    let kept_strides = compute_strides(&kept_shape);
    let out_len = numel(&kept_shape);
    let count = x.len() / out_len.max(1);

    if count == 0 && matches!(op, ReduceOp::Max | ReduceOp::Min | ReduceOp::Mean) {
        return Err(GraphError::InvalidOperation(format!(
            "{} over an empty axis",
            op.name()
        )));
    }

    let init = match op {
        ReduceOp::Sum | ReduceOp::Mean => 0.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_len];
    let mut idx = Shape::new();
    for (linear, &v) in x.data().iter().enumerate() {
        linear_to_cartesian_into(linear, x.shape(), &mut idx);
        for &a in &axes {
            idx[a] = 0;
        }
        let slot = &mut acc[cartesian_to_linear(&idx, &kept_strides)];
        *slot = match op {
            ReduceOp::Sum | ReduceOp::Mean => *slot + v,
            ReduceOp::Max => slot.max(v),
            ReduceOp::Min => slot.min(v),
        };
    }
    if op == ReduceOp::Mean {
        let n = count as f64;
        for v in &mut acc {
            *v /= n;
        }
    }

    let out_shape = reduced_shape(x.shape(), &axes, keep_dims);
    DenseTensor::from_vec(acc, &out_shape)
}

/// Index of the extreme value along `axis`, stored as `f64`.
/// Ties resolve to the first occurrence.
pub fn arg_reduce(
    x: &DenseTensor,
    op: ArgReduceOp,
    axis: usize,
    keep_dims: bool,
) -> Result<DenseTensor, GraphError> {
    check_axis(axis, x.ndim())?;
    if x.shape()[axis] == 0 {
        return Err(GraphError::InvalidOperation(format!(
            "{} over an empty axis",
            op.name()
        )));
    }
    let kept_shape = reduced_shape(x.shape(), &[axis], true);
    let kept_strides = compute_strides(&kept_shape);
    let out_len = numel(&kept_shape);

    let mut best = vec![(f64::NAN, 0usize); out_len];
    let mut seen = vec![false; out_len];
    let mut idx = Shape::new();
    for (linear, &v) in x.data().iter().enumerate() {
        linear_to_cartesian_into(linear, x.shape(), &mut idx);
        let pos = idx[axis];
        idx[axis] = 0;
        let slot = cartesian_to_linear(&idx, &kept_strides);
        let better = match op {
            ArgReduceOp::ArgMax => v > best[slot].0,
            ArgReduceOp::ArgMin => v < best[slot].0,
        };
        // Column-major iteration visits positions along `axis` in increasing order.
        if !seen[slot] || better {
            best[slot] = (v, pos);
            seen[slot] = true;
        }
    }

    let data = best.into_iter().map(|(_, pos)| pos as f64).collect();
    let out_shape = reduced_shape(x.shape(), &[axis], keep_dims);
    DenseTensor::from_vec(data, &out_shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64], shape: &[usize]) -> DenseTensor {
        DenseTensor::from_vec(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_sum_all() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let s = reduce(&x, ReduceOp::Sum, &[], false).unwrap();
        assert_eq!(s.shape(), &[] as &[usize]);
        assert_eq!(s.data(), &[10.0]);
    }

    #[test]
    fn test_sum_axis() {
        // columns (1,2), (3,4), (5,6)
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let s0 = reduce(&x, ReduceOp::Sum, &[0], false).unwrap();
        assert_eq!(s0.data(), &[3.0, 7.0, 11.0]);
        let s1 = reduce(&x, ReduceOp::Sum, &[1], true).unwrap();
        assert_eq!(s1.shape(), &[2, 1]);
        assert_eq!(s1.data(), &[9.0, 12.0]);
    }

    #[test]
    fn test_mean_max_min() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        assert_eq!(reduce(&x, ReduceOp::Mean, &[1], false).unwrap().data(), &[3.0, 4.0]);
        assert_eq!(reduce(&x, ReduceOp::Max, &[0], false).unwrap().data(), &[2.0, 4.0, 6.0]);
        assert_eq!(reduce(&x, ReduceOp::Min, &[], false).unwrap().data(), &[1.0]);
    }

    #[test]
    fn test_argmax_ties_first() {
        let x = t(&[3.0, 1.0, 3.0], &[3]);
        let a = arg_reduce(&x, ArgReduceOp::ArgMax, 0, false).unwrap();
        assert_eq!(a.data(), &[0.0]);
        let m = arg_reduce(&x, ArgReduceOp::ArgMin, 0, true).unwrap();
        assert_eq!(m.shape(), &[1]);
        assert_eq!(m.data(), &[1.0]);
    }

    #[test]
    fn test_invalid_axis() {
        let x = t(&[1.0, 2.0], &[2]);
        assert!(matches!(
            reduce(&x, ReduceOp::Sum, &[1], false),
            Err(GraphError::InvalidAxis { .. })
        ));
    }
}
