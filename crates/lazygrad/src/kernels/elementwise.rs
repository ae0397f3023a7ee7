//! Elementwise kernels with right-aligned broadcasting.

use super::{BinaryOp, CompareOp, UnaryOp};
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{
    Shape, broadcast_shapes, broadcast_strides, cartesian_to_linear, linear_to_cartesian_into,
    numel,
};

/// Apply a unary function to each element.
pub fn unary(x: &DenseTensor, op: UnaryOp) -> DenseTensor {
    let data = x.data().iter().map(|&v| op.apply(v)).collect();
    DenseTensor::from_parts(data, x.shape())
}

/// Combine two tensors elementwise after broadcasting them to a common shape.
pub fn binary(a: &DenseTensor, b: &DenseTensor, op: BinaryOp) -> Result<DenseTensor, GraphError> {
    zip_broadcast(a, b, |x, y| op.apply(x, y))
}

/// Compare two tensors elementwise after broadcasting.
pub fn compare(a: &DenseTensor, b: &DenseTensor, op: CompareOp) -> Result<DenseTensor, GraphError> {
    zip_broadcast(a, b, |x, y| op.apply(x, y))
}

/// Combine every element with a constant. With `reversed`, the constant is
/// the left operand (`c - x` instead of `x - c`).
pub fn scalar_op(x: &DenseTensor, c: f64, op: BinaryOp, reversed: bool) -> DenseTensor {
    let data = x
        .data()
        .iter()
        .map(|&v| if reversed { op.apply(c, v) } else { op.apply(v, c) })
        .collect();
    DenseTensor::from_parts(data, x.shape())
}

/// `dst += src` in place; shapes must match exactly.
pub fn add_into(dst: &mut DenseTensor, src: &DenseTensor) -> Result<(), GraphError> {
    if dst.shape() != src.shape() {
        return Err(GraphError::shape_mismatch(
            "add_assign",
            dst.shape(),
            src.shape(),
        ));
    }
    for (d, &s) in dst.data_mut().iter_mut().zip(src.data()) {
        *d += s;
    }
    Ok(())
}

fn zip_broadcast(
    a: &DenseTensor,
    b: &DenseTensor,
    f: impl Fn(f64, f64) -> f64,
) -> Result<DenseTensor, GraphError> {
    if a.shape() == b.shape() {
        let data = a
            .data()
            .iter()
            .zip(b.data())
            .map(|(&x, &y)| f(x, y))
            .collect();
        return DenseTensor::from_vec(data, a.shape());
    }

    let out_shape = broadcast_shapes(a.shape(), b.shape())?;
    let a_strides = broadcast_strides(a.shape(), &out_shape);
    let b_strides = broadcast_strides(b.shape(), &out_shape);

    let total = numel(&out_shape);
    let mut data = Vec::with_capacity(total);
    let mut idx = Shape::new();
    for linear in 0..total {
        linear_to_cartesian_into(linear, &out_shape, &mut idx);
        let x = a.data()[cartesian_to_linear(&idx, &a_strides)];
        let y = b.data()[cartesian_to_linear(&idx, &b_strides)];
        data.push(f(x, y));
    }
    DenseTensor::from_vec(data, &out_shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64], shape: &[usize]) -> DenseTensor {
        DenseTensor::from_vec(data.to_vec(), shape).unwrap()
    }

    #[test]
    fn test_binary_same_shape() {
        let c = binary(&t(&[1.0, 2.0], &[2]), &t(&[3.0, 5.0], &[2]), BinaryOp::Mul).unwrap();
        assert_eq!(c.data(), &[3.0, 10.0]);
    }

    #[test]
    fn test_binary_broadcast_row() {
        // [2,3] column-major: columns (1,2), (3,4), (5,6)
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(&[10.0, 20.0, 30.0], &[3]);
        let c = binary(&a, &b, BinaryOp::Add).unwrap();
        assert_eq!(c.shape(), &[2, 3]);
        assert_eq!(c.data(), &[11.0, 12.0, 23.0, 24.0, 35.0, 36.0]);
    }

    #[test]
    fn test_binary_incompatible() {
        let err = binary(&t(&[1.0, 2.0], &[2]), &t(&[1.0, 2.0, 3.0], &[3]), BinaryOp::Add);
        assert!(matches!(err, Err(GraphError::BroadcastMismatch { .. })));
    }

    #[test]
    fn test_scalar_op_reversed() {
        let x = t(&[1.0, 2.0], &[2]);
        assert_eq!(scalar_op(&x, 10.0, BinaryOp::Sub, false).data(), &[-9.0, -8.0]);
        assert_eq!(scalar_op(&x, 10.0, BinaryOp::Sub, true).data(), &[9.0, 8.0]);
    }

    #[test]
    fn test_compare() {
        let c = compare(&t(&[1.0, 5.0], &[2]), &t(&[3.0], &[1]), CompareOp::Gt).unwrap();
        assert_eq!(c.data(), &[0.0, 1.0]);
    }

    #[test]
    fn test_add_into() {
        let mut d = t(&[1.0, 2.0], &[2]);
        add_into(&mut d, &t(&[0.5, 0.5], &[2])).unwrap();
        assert_eq!(d.data(), &[1.5, 2.5]);
        assert!(add_into(&mut d, &t(&[1.0], &[1])).is_err());
    }
}
