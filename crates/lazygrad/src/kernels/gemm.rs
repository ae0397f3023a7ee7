//! GEMM-family kernels using faer.
//!
//! Host tensors are column-major, like faer matrices, so 2-D tensors are
//! viewed as matrices without copying.

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};

use super::layout::permute;
use crate::dense::DenseTensor;
use crate::error::GraphError;

fn matrix_dims(op: &'static str, t: &DenseTensor) -> Result<(usize, usize), GraphError> {
    match *t.shape() {
        [rows, cols] => Ok((rows, cols)),
        _ => Err(GraphError::RankMismatch {
            op,
            expected: 2,
            actual: t.ndim(),
        }),
    }
}

/// `alpha * op(a) * op(b) + beta * c`, where `op` optionally transposes.
///
/// Without `c` the `beta` term is ignored.
///
/// # Example
///
/// ```
/// use lazygrad::DenseTensor;
/// use lazygrad::kernels::gemm;
///
/// let a = DenseTensor::from_vec(vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap(); // [[1,2],[3,4]]
/// let eye = DenseTensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2]).unwrap();
/// let c = gemm(&a, &eye, None, 2.0, 0.0, false, false).unwrap();
/// assert_eq!(c.data(), &[2.0, 6.0, 4.0, 8.0]);
/// ```
pub fn gemm(
    a: &DenseTensor,
    b: &DenseTensor,
    c: Option<&DenseTensor>,
    alpha: f64,
    beta: f64,
    trans_a: bool,
    trans_b: bool,
) -> Result<DenseTensor, GraphError> {
    let (a_rows, a_cols) = matrix_dims("gemm", a)?;
    let (b_rows, b_cols) = matrix_dims("gemm", b)?;
    let (m, k) = if trans_a { (a_cols, a_rows) } else { (a_rows, a_cols) };
    let (k2, n) = if trans_b { (b_cols, b_rows) } else { (b_rows, b_cols) };
    if k != k2 {
        return Err(GraphError::shape_mismatch("gemm", &[m, k], &[k2, n]));
    }

    let a_mat = MatRef::from_column_major_slice(a.data(), a_rows, a_cols);
    let b_mat = MatRef::from_column_major_slice(b.data(), b_rows, b_cols);
    let a_op = if trans_a { a_mat.transpose() } else { a_mat };
    let b_op = if trans_b { b_mat.transpose() } else { b_mat };

    let (mut out, accum) = match c {
        Some(c) if beta != 0.0 => {
            if c.shape() != [m, n] {
                return Err(GraphError::shape_mismatch("gemm", &[m, n], c.shape()));
            }
            let scaled = c.data().iter().map(|&v| v * beta).collect();
            (DenseTensor::from_vec(scaled, &[m, n])?, Accum::Add)
        }
        _ => (DenseTensor::zeros(&[m, n]), Accum::Replace),
    };

    let out_mat = MatMut::from_column_major_slice_mut(out.data_mut(), m, n);
    matmul(out_mat, accum, a_op, b_op, alpha, Par::Seq);
    Ok(out)
}

/// Batched matrix product of `[batch, m, k]` and `[batch, k, n]`.
pub fn batched_gemm(
    a: &DenseTensor,
    b: &DenseTensor,
    trans_a: bool,
    trans_b: bool,
) -> Result<DenseTensor, GraphError> {
    let (batch, a1, a2) = batch_dims(a)?;
    let (batch_b, b1, b2) = batch_dims(b)?;
    if batch != batch_b {
        return Err(GraphError::shape_mismatch("batched_gemm", a.shape(), b.shape()));
    }
    // Column-major [batch, r, c] interleaves batches; move batch last so each
    // matrix is contiguous.
    let a_last = permute(a, &[1, 2, 0])?;
    let b_last = permute(b, &[1, 2, 0])?;
    let (m, n) = (
        if trans_a { a2 } else { a1 },
        if trans_b { b1 } else { b2 },
    );

    let mut out = Vec::with_capacity(batch * m * n);
    for i in 0..batch {
        let a_i = DenseTensor::from_vec(
            a_last.data()[i * a1 * a2..(i + 1) * a1 * a2].to_vec(),
            &[a1, a2],
        )?;
        let b_i = DenseTensor::from_vec(
            b_last.data()[i * b1 * b2..(i + 1) * b1 * b2].to_vec(),
            &[b1, b2],
        )?;
        let c_i = gemm(&a_i, &b_i, None, 1.0, 0.0, trans_a, trans_b)?;
        out.extend_from_slice(c_i.data());
    }
    let stacked = DenseTensor::from_vec(out, &[m, n, batch])?;
    permute(&stacked, &[2, 0, 1])
}

fn batch_dims(t: &DenseTensor) -> Result<(usize, usize, usize), GraphError> {
    match *t.shape() {
        [b, r, c] => Ok((b, r, c)),
        _ => Err(GraphError::RankMismatch {
            op: "batched_gemm",
            expected: 3,
            actual: t.ndim(),
        }),
    }
}

/// Matrix-vector product `alpha * op(a) * x`.
pub fn gemv(a: &DenseTensor, x: &DenseTensor, alpha: f64, trans_a: bool) -> Result<DenseTensor, GraphError> {
    if x.ndim() != 1 {
        return Err(GraphError::RankMismatch {
            op: "gemv",
            expected: 1,
            actual: x.ndim(),
        });
    }
    let col = x.clone().reshaped(&[x.len(), 1])?;
    let out = gemm(a, &col, None, alpha, 0.0, trans_a, false)?;
    let rows = out.shape()[0];
    out.reshaped(&[rows])
}
