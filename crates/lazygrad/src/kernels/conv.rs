//! 2-D convolution via im2col + GEMM.
//!
//! Layout is `[batch, channels, height, width]` for images and
//! `[filters, channels, kh, kw]` for weights.

use super::gemm::gemm;
use crate::dense::DenseTensor;
use crate::error::GraphError;

/// Convolution hyper-parameters (symmetric stride and zero padding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Conv2dParams {
    pub stride: usize,
    pub padding: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: 1,
            padding: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Geometry {
    n: usize,
    c: usize,
    h: usize,
    w: usize,
    f: usize,
    kh: usize,
    kw: usize,
    oh: usize,
    ow: usize,
}

impl Geometry {
    fn rows(&self) -> usize {
        self.c * self.kh * self.kw
    }

    fn positions(&self) -> usize {
        self.oh * self.ow
    }
}

/// Output spatial size of a convolution or pooling window.
pub(crate) fn output_size(input: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = input + 2 * padding;
    if stride == 0 || kernel == 0 || padded < kernel {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

fn geometry(input: &[usize], weight: &[usize], params: Conv2dParams) -> Result<Geometry, GraphError> {
    let [n, c, h, w] = *input else {
        return Err(GraphError::RankMismatch {
            op: "conv2d",
            expected: 4,
            actual: input.len(),
        });
    };
    let [f, wc, kh, kw] = *weight else {
        return Err(GraphError::RankMismatch {
            op: "conv2d",
            expected: 4,
            actual: weight.len(),
        });
    };
    if wc != c {
        return Err(GraphError::shape_mismatch("conv2d", &[f, c, kh, kw], weight));
    }
    let invalid = || {
        GraphError::InvalidOperation(format!(
            "conv2d kernel {kh}x{kw} with stride {} and padding {} does not fit input {h}x{w}",
            params.stride, params.padding
        ))
    };
    let oh = output_size(h, kh, params.stride, params.padding).ok_or_else(invalid)?;
    let ow = output_size(w, kw, params.stride, params.padding).ok_or_else(invalid)?;
    Ok(Geometry {
        n,
        c,
        h,
        w,
        f,
        kh,
        kw,
        oh,
        ow,
    })
}

/// Output shape of a convolution, validating operand shapes.
pub(crate) fn conv2d_output_shape(
    input: &[usize],
    weight: &[usize],
    params: Conv2dParams,
) -> Result<[usize; 4], GraphError> {
    let g = geometry(input, weight, params)?;
    Ok([g.n, g.f, g.oh, g.ow])
}

#[inline]
fn at4(shape: [usize; 4], i0: usize, i1: usize, i2: usize, i3: usize) -> usize {
    i0 + shape[0] * (i1 + shape[1] * (i2 + shape[2] * i3))
}

/// Source pixel of (kernel offset, output position), `None` inside padding.
#[inline]
fn source(out: usize, k: usize, params: Conv2dParams, size: usize) -> Option<usize> {
    (out * params.stride + k)
        .checked_sub(params.padding)
        .filter(|&p| p < size)
}

/// im2col for one image: `[c*kh*kw, oh*ow]` column-major, row `c + C*(i + KH*j)`
/// so it lines up with a column-major `[f, c, kh, kw]` weight viewed as `[f, rows]`.
fn im2col(x: &DenseTensor, g: &Geometry, params: Conv2dParams, n: usize) -> DenseTensor {
    let rows = g.rows();
    let shape = [g.n, g.c, g.h, g.w];
    let mut cols = DenseTensor::zeros(&[rows, g.positions()]);
    for ox in 0..g.ow {
        for oy in 0..g.oh {
            let p = oy + g.oh * ox;
            for j in 0..g.kw {
                let Some(sx) = source(ox, j, params, g.w) else { continue };
                for i in 0..g.kh {
                    let Some(sy) = source(oy, i, params, g.h) else { continue };
                    for ch in 0..g.c {
                        let r = ch + g.c * (i + g.kh * j);
                        cols.data_mut()[r + rows * p] = x.data()[at4(shape, n, ch, sy, sx)];
                    }
                }
            }
        }
    }
    cols
}

/// Inverse scatter of [`im2col`], accumulating into image `n` of `dx`.
fn col2im(cols: &DenseTensor, dx: &mut DenseTensor, g: &Geometry, params: Conv2dParams, n: usize) {
    let rows = g.rows();
    let shape = [g.n, g.c, g.h, g.w];
    for ox in 0..g.ow {
        for oy in 0..g.oh {
            let p = oy + g.oh * ox;
            for j in 0..g.kw {
                let Some(sx) = source(ox, j, params, g.w) else { continue };
                for i in 0..g.kh {
                    let Some(sy) = source(oy, i, params, g.h) else { continue };
                    for ch in 0..g.c {
                        let r = ch + g.c * (i + g.kh * j);
                        dx.data_mut()[at4(shape, n, ch, sy, sx)] += cols.data()[r + rows * p];
                    }
                }
            }
        }
    }
}

/// Slice image `n` of a `[n, f, oh, ow]` tensor as an `[f, oh*ow]` matrix.
fn output_slice(y: &DenseTensor, g: &Geometry, n: usize) -> DenseTensor {
    let shape = [g.n, g.f, g.oh, g.ow];
    let mut m = DenseTensor::zeros(&[g.f, g.positions()]);
    for ox in 0..g.ow {
        for oy in 0..g.oh {
            for f in 0..g.f {
                m.data_mut()[f + g.f * (oy + g.oh * ox)] = y.data()[at4(shape, n, f, oy, ox)];
            }
        }
    }
    m
}

/// Forward convolution, `bias` is `[filters]`.
pub fn conv2d(
    input: &DenseTensor,
    weight: &DenseTensor,
    bias: Option<&DenseTensor>,
    params: Conv2dParams,
) -> Result<DenseTensor, GraphError> {
    let g = geometry(input.shape(), weight.shape(), params)?;
    if let Some(b) = bias {
        if b.shape() != [g.f] {
            return Err(GraphError::shape_mismatch("conv2d", &[g.f], b.shape()));
        }
    }
    let w_mat = weight.clone().reshaped(&[g.f, g.rows()])?;
    let out_shape = [g.n, g.f, g.oh, g.ow];
    let mut out = DenseTensor::zeros(&out_shape);
    for n in 0..g.n {
        let cols = im2col(input, &g, params, n);
        let y = gemm(&w_mat, &cols, None, 1.0, 0.0, false, false)?;
        for ox in 0..g.ow {
            for oy in 0..g.oh {
                for f in 0..g.f {
                    let bias_f = bias.map_or(0.0, |b| b.data()[f]);
                    out.data_mut()[at4(out_shape, n, f, oy, ox)] =
                        y.data()[f + g.f * (oy + g.oh * ox)] + bias_f;
                }
            }
        }
    }
    Ok(out)
}

/// Gradient of the convolution with respect to its input.
pub fn conv2d_grad_input(
    input_shape: &[usize],
    weight: &DenseTensor,
    grad_output: &DenseTensor,
    params: Conv2dParams,
) -> Result<DenseTensor, GraphError> {
    let g = geometry(input_shape, weight.shape(), params)?;
    let w_mat = weight.clone().reshaped(&[g.f, g.rows()])?;
    let mut dx = DenseTensor::zeros(input_shape);
    for n in 0..g.n {
        let dy = output_slice(grad_output, &g, n);
        let dcols = gemm(&w_mat, &dy, None, 1.0, 0.0, true, false)?;
        col2im(&dcols, &mut dx, &g, params, n);
    }
    Ok(dx)
}

/// Gradients of the convolution with respect to weight and bias.
pub fn conv2d_grad_weight(
    input: &DenseTensor,
    weight_shape: &[usize],
    grad_output: &DenseTensor,
    params: Conv2dParams,
) -> Result<(DenseTensor, DenseTensor), GraphError> {
    let g = geometry(input.shape(), weight_shape, params)?;
    let mut dw = DenseTensor::zeros(&[g.f, g.rows()]);
    let mut db = DenseTensor::zeros(&[g.f]);
    for n in 0..g.n {
        let cols = im2col(input, &g, params, n);
        let dy = output_slice(grad_output, &g, n);
        dw = gemm(&dy, &cols, Some(&dw), 1.0, 1.0, false, true)?;
        for p in 0..g.positions() {
            for f in 0..g.f {
                db.data_mut()[f] += dy.data()[f + g.f * p];
            }
        }
    }
    Ok((dw.reshaped(weight_shape)?, db))
}
