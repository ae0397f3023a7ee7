//! Max pooling over `[batch, channels, height, width]` images.

use super::conv::output_size;
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{cartesian_to_linear, compute_strides};

/// Max pooling without padding. Returns the pooled tensor and, for every
/// output element, the linear input index of the selected maximum.
pub fn max_pool2d(
    x: &DenseTensor,
    kernel: usize,
    stride: usize,
) -> Result<(DenseTensor, DenseTensor), GraphError> {
    let out_shape = max_pool2d_output_shape(x.shape(), kernel, stride)?;
    let [n, c, oh, ow] = out_shape;
    let x_strides = compute_strides(x.shape());
    let out_strides = compute_strides(&out_shape);

    let mut out = DenseTensor::zeros(&out_shape);
    let mut argmax = DenseTensor::zeros(&out_shape);
    for b in 0..n {
        for ch in 0..c {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut best = f64::NEG_INFINITY;
                    let mut best_at = None;
                    for i in 0..kernel {
                        for j in 0..kernel {
                            let at = cartesian_to_linear(
                                &[b, ch, oy * stride + i, ox * stride + j],
                                &x_strides,
                            );
                            let v = x.data()[at];
                            if best_at.is_none() || v > best {
                                best = v;
                                best_at = Some(at);
                            }
                        }
                    }
                    let o = cartesian_to_linear(&[b, ch, oy, ox], &out_strides);
                    out.data_mut()[o] = best;
                    argmax.data_mut()[o] = best_at.unwrap_or(0) as f64;
                }
            }
        }
    }
    Ok((out, argmax))
}

/// Route `grad_output` back to the positions recorded by [`max_pool2d`].
pub fn max_pool2d_backward(
    input_shape: &[usize],
    argmax: &DenseTensor,
    grad_output: &DenseTensor,
) -> Result<DenseTensor, GraphError> {
    if argmax.shape() != grad_output.shape() {
        return Err(GraphError::shape_mismatch(
            "max_pool2d_backward",
            argmax.shape(),
            grad_output.shape(),
        ));
    }
    let mut dx = DenseTensor::zeros(input_shape);
    let len = dx.len();
    for (&at, &g) in argmax.data().iter().zip(grad_output.data()) {
        let at = super::index::to_index(at)?;
        if at >= len {
            return Err(GraphError::IndexOutOfBounds {
                index: at,
                dim_size: len,
            });
        }
        dx.data_mut()[at] += g;
    }
    Ok(dx)
}

/// Output shape of max pooling, validating the input rank and window.
pub(crate) fn max_pool2d_output_shape(
    input: &[usize],
    kernel: usize,
    stride: usize,
) -> Result<[usize; 4], GraphError> {
    let [n, c, h, w] = *input else {
        return Err(GraphError::RankMismatch {
            op: "max_pool2d",
            expected: 4,
            actual: input.len(),
        });
    };
    let invalid = || {
        GraphError::InvalidOperation(format!(
            "max_pool2d window {kernel} with stride {stride} does not fit input {h}x{w}"
        ))
    };
    let oh = output_size(h, kernel, stride, 0).ok_or_else(invalid)?;
    let ow = output_size(w, kernel, stride, 0).ok_or_else(invalid)?;
    Ok([n, c, oh, ow])
}
