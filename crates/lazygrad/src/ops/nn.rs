//! Neural-network operators over `[batch, channels, height, width]` images.

use super::apply;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::{Conv2dParams, check_batch_norm_shapes, conv2d_output_shape, max_pool2d_output_shape};
use crate::shape::{Shape, shape_of};

#[derive(Debug)]
struct Conv2d {
    params: Conv2dParams,
}

impl<B: Backend> Operation<B> for Conv2d {
    fn name(&self) -> &'static str {
        "conv2d"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let out = conv2d_output_shape(&inputs[0], &inputs[1], self.params)?;
        if let Some(bias) = inputs.get(2) {
            if bias.as_slice() != [out[1]] {
                return Err(GraphError::shape_mismatch("conv2d", &[out[1]], bias));
            }
        }
        Ok(Some(shape_of(&out)))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let b = ctx.backend();
        let out = b.conv2d(inputs[0], inputs[1], inputs.get(2).copied(), self.params);
        b.cleanup();
        out
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let has_bias = ctx.num_inputs() == 3;
        let dx = if ctx.needs_grad(0) {
            Some(b.conv2d_grad_input(ctx.input_shape(0), ctx.input(1), grad, self.params)?)
        } else {
            None
        };
        let wants_params = ctx.needs_grad(1) || (has_bias && ctx.needs_grad(2));
        let (dw, db) = if wants_params {
            let (dw, db) = b.conv2d_grad_params(ctx.input(0), ctx.input_shape(1), grad, self.params)?;
            (Some(dw), Some(db))
        } else {
            (None, None)
        };
        b.cleanup();

        let mut grads = vec![dx, dw.filter(|_| ctx.needs_grad(1))];
        if has_bias {
            grads.push(db.filter(|_| ctx.needs_grad(2)));
        }
        Ok(grads)
    }
}

#[derive(Debug)]
struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl<B: Backend> Operation<B> for MaxPool2d {
    fn name(&self) -> &'static str {
        "max_pool2d"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let out = max_pool2d_output_shape(&inputs[0], self.kernel, self.stride)?;
        Ok(Some(shape_of(&out)))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let (out, argmax) = ctx.backend().max_pool2d(inputs[0], self.kernel, self.stride)?;
        ctx.save(argmax)?;
        Ok(out)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let argmax = ctx.saved(0)?;
        let dx = ctx.backend().max_pool2d_backward(ctx.input_shape(0), argmax, grad)?;
        Ok(vec![Some(dx)])
    }
}

/// Training-mode batch normalization over axis 1.
#[derive(Debug)]
struct BatchNorm {
    eps: f64,
}

impl<B: Backend> Operation<B> for BatchNorm {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        check_batch_norm_shapes(&inputs[0], &inputs[1], &inputs[2])?;
        Ok(Some(inputs[0].clone()))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let (out, mean, inv_std) = ctx.backend().batch_norm(inputs[0], inputs[1], inputs[2], self.eps)?;
        ctx.save(mean)?;
        ctx.save(inv_std)?;
        Ok(out)
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let (mean, inv_std) = (ctx.saved(0)?, ctx.saved(1)?);
        let (dx, dgamma, dbeta) = ctx
            .backend()
            .batch_norm_backward(ctx.input(0), ctx.input(1), mean, inv_std, grad)?;
        Ok(vec![Some(dx), Some(dgamma), Some(dbeta)])
    }
}

impl<B: Backend> Tensor<B> {
    /// 2-D convolution of `[n, c, h, w]` images with `[f, c, kh, kw]`
    /// filters and an optional `[f]` bias.
    pub fn conv2d(
        &self,
        weight: &Tensor<B>,
        bias: Option<&Tensor<B>>,
        stride: usize,
        padding: usize,
    ) -> Result<Tensor<B>, GraphError> {
        let op = Conv2d {
            params: Conv2dParams { stride, padding },
        };
        match bias {
            Some(bias) => apply(op, &[self, weight, bias]),
            None => apply(op, &[self, weight]),
        }
    }

    /// Max pooling with a square window and no padding.
    pub fn max_pool2d(&self, kernel: usize, stride: usize) -> Result<Tensor<B>, GraphError> {
        apply(MaxPool2d { kernel, stride }, &[self])
    }

    /// Normalize each channel (axis 1) with batch statistics, then scale by
    /// `gamma` and shift by `beta`, both of shape `[channels]`.
    pub fn batch_norm(&self, gamma: &Tensor<B>, beta: &Tensor<B>, eps: f64) -> Result<Tensor<B>, GraphError> {
        apply(BatchNorm { eps }, &[self, gamma, beta])
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use approx::assert_relative_eq;

    use crate::backend::CpuBackend;
    use crate::error::GraphError;
    use crate::graph::Tensor;

    fn cpu() -> Rc<CpuBackend> {
        Rc::new(CpuBackend::new())
    }

    #[test]
    fn test_conv2d_window_sums_and_gradients() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, (0..9).map(f64::from).collect(), &[1, 1, 3, 3]).unwrap();
        let w = Tensor::variable(&cpu, vec![1.0; 4], &[1, 1, 2, 2]).unwrap();
        let bias = Tensor::variable(&cpu, vec![0.5], &[1]).unwrap();
        let y = x.conv2d(&w, Some(&bias), 1, 0).unwrap();
        assert_eq!(y.shape().unwrap().as_slice(), &[1, 1, 2, 2]);
        assert_relative_eq!(y.to_vec().unwrap()[0], 8.5);

        y.sum_all().unwrap().backward().unwrap();
        assert_eq!(
            x.grad().unwrap().data(),
            &[1.0, 2.0, 1.0, 2.0, 4.0, 2.0, 1.0, 2.0, 1.0]
        );
        assert_eq!(w.grad().unwrap().data(), &[8.0, 12.0, 20.0, 24.0]);
        assert_eq!(bias.grad().unwrap().data(), &[4.0]);
    }

    #[test]
    fn test_conv2d_rejects_bad_bias() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![0.0; 9], &[1, 1, 3, 3]).unwrap();
        let w = Tensor::variable(&cpu, vec![0.0; 8], &[2, 1, 2, 2]).unwrap();
        let bias = Tensor::variable(&cpu, vec![0.0; 3], &[3]).unwrap();
        assert!(matches!(
            x.conv2d(&w, Some(&bias), 1, 0),
            Err(GraphError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_max_pool_routes_gradient_to_maxima() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, (0..16).map(f64::from).collect(), &[1, 1, 4, 4]).unwrap();
        let y = x.max_pool2d(2, 2).unwrap();
        assert_eq!(y.to_vec().unwrap(), vec![5.0, 7.0, 13.0, 15.0]);
        y.sum_all().unwrap().backward().unwrap();
        let g = x.grad().unwrap();
        for (i, &v) in g.data().iter().enumerate() {
            let expected = if [5, 7, 13, 15].contains(&i) { 1.0 } else { 0.0 };
            assert_eq!(v, expected, "position {i}");
        }
    }

    #[test]
    fn test_batch_norm_normalizes_channel() {
        let cpu = cpu();
        let x = Tensor::variable(&cpu, vec![1.0, 3.0], &[2, 1]).unwrap();
        let gamma = Tensor::variable(&cpu, vec![2.0], &[1]).unwrap();
        let beta = Tensor::variable(&cpu, vec![0.5], &[1]).unwrap();
        let y = x.batch_norm(&gamma, &beta, 0.0).unwrap();
        let v = y.to_vec().unwrap();
        assert_relative_eq!(v[0], -1.5);
        assert_relative_eq!(v[1], 2.5);

        y.sum_all().unwrap().backward().unwrap();
        assert_relative_eq!(beta.grad().unwrap().data()[0], 2.0);
        assert_relative_eq!(gamma.grad().unwrap().data()[0], 0.0);
        for &g in x.grad().unwrap().data() {
            assert_relative_eq!(g, 0.0);
        }
    }
}
