//! Batch normalization (training-mode statistics) over the channel axis 1.

use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{Shape, linear_to_cartesian_into};

/// Per-channel statistics saved by the forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormStats {
    pub mean: DenseTensor,
    pub inv_std: DenseTensor,
}

fn channels(op: &'static str, x: &[usize]) -> Result<usize, GraphError> {
    if x.len() < 2 {
        return Err(GraphError::RankMismatch {
            op,
            expected: 2,
            actual: x.len(),
        });
    }
    Ok(x[1])
}

/// Validate operand shapes of a batch normalization.
pub(crate) fn check_batch_norm_shapes(
    x: &[usize],
    gamma: &[usize],
    beta: &[usize],
) -> Result<(), GraphError> {
    let c = channels("batch_norm", x)?;
    for param in [gamma, beta] {
        if param != [c] {
            return Err(GraphError::shape_mismatch("batch_norm", &[c], param));
        }
    }
    Ok(())
}

fn for_each_channel(x: &DenseTensor, mut f: impl FnMut(usize, usize)) {
    let mut idx = Shape::new();
    for linear in 0..x.len() {
        linear_to_cartesian_into(linear, x.shape(), &mut idx);
        f(linear, idx[1]);
    }
}

/// Normalize `x` per channel and apply the affine `gamma`/`beta` transform.
pub fn batch_norm(
    x: &DenseTensor,
    gamma: &DenseTensor,
    beta: &DenseTensor,
    eps: f64,
) -> Result<(DenseTensor, BatchNormStats), GraphError> {
    check_batch_norm_shapes(x.shape(), gamma.shape(), beta.shape())?;
    let c = x.shape()[1];
    let per_channel = x.len() / c.max(1);
    if per_channel == 0 {
        return Err(GraphError::InvalidOperation(
            "batch_norm over an empty batch".to_string(),
        ));
    }
    let m = per_channel as f64;

    let mut mean = vec![0.0; c];
    for_each_channel(x, |i, ch| mean[ch] += x.data()[i]);
    mean.iter_mut().for_each(|v| *v /= m);

    let mut var = vec![0.0; c];
    for_each_channel(x, |i, ch| {
        let d = x.data()[i] - mean[ch];
        var[ch] += d * d;
    });
    let inv_std: Vec<f64> = var.iter().map(|v| 1.0 / (v / m + eps).sqrt()).collect();

    let mut out = DenseTensor::zeros(x.shape());
    for_each_channel(x, |i, ch| {
        let x_hat = (x.data()[i] - mean[ch]) * inv_std[ch];
        out.data_mut()[i] = gamma.data()[ch] * x_hat + beta.data()[ch];
    });

    let stats = BatchNormStats {
        mean: DenseTensor::from_vec(mean, &[c])?,
        inv_std: DenseTensor::from_vec(inv_std, &[c])?,
    };
    Ok((out, stats))
}

/// Gradients `(dx, dgamma, dbeta)` of [`batch_norm`].
pub fn batch_norm_backward(
    x: &DenseTensor,
    gamma: &DenseTensor,
    stats: &BatchNormStats,
    grad_output: &DenseTensor,
) -> Result<(DenseTensor, DenseTensor, DenseTensor), GraphError> {
    if grad_output.shape() != x.shape() {
        return Err(GraphError::shape_mismatch(
            "batch_norm_backward",
            x.shape(),
            grad_output.shape(),
        ));
    }
    let c = channels("batch_norm_backward", x.shape())?;
    let m = (x.len() / c.max(1)) as f64;
    let mean = stats.mean.data();
    let inv_std = stats.inv_std.data();
    let x_hat = |i: usize, ch: usize| (x.data()[i] - mean[ch]) * inv_std[ch];

    let mut dgamma = vec![0.0; c];
    let mut dbeta = vec![0.0; c];
    for_each_channel(x, |i, ch| {
        let dy = grad_output.data()[i];
        dbeta[ch] += dy;
        dgamma[ch] += dy * x_hat(i, ch);
    });

    let mut dx = DenseTensor::zeros(x.shape());
    for_each_channel(x, |i, ch| {
        let dy = grad_output.data()[i];
        let scale = gamma.data()[ch] * inv_std[ch] / m;
        dx.data_mut()[i] = scale * (m * dy - dbeta[ch] - x_hat(i, ch) * dgamma[ch]);
    });

    Ok((
        dx,
        DenseTensor::from_vec(dgamma, &[c])?,
        DenseTensor::from_vec(dbeta, &[c])?,
    ))
}
