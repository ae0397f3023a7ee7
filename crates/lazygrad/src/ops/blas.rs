//! Matrix products.

use super::apply;
use crate::backend::{Backend, BufferHandle};
use crate::error::GraphError;
use crate::graph::{BackwardContext, ForwardContext, Operation, Tensor};
use crate::kernels::BinaryOp;
use crate::shape::{Shape, shape_of};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Product {
    /// `[m, k] x [k, n]`
    Matrix,
    /// `[b, m, k] x [b, k, n]`
    Batched,
    /// `[m, k] x [k]`
    Vector,
}

#[derive(Debug)]
struct MatMul;

impl MatMul {
    fn product(lhs: &[usize], rhs: &[usize]) -> Result<Product, GraphError> {
        match (lhs.len(), rhs.len()) {
            (2, 2) => Ok(Product::Matrix),
            (3, 3) => Ok(Product::Batched),
            (2, 1) => Ok(Product::Vector),
            (2 | 3, r) => Err(GraphError::RankMismatch {
                op: "matmul",
                expected: lhs.len(),
                actual: r,
            }),
            (l, _) => Err(GraphError::RankMismatch {
                op: "matmul",
                expected: 2,
                actual: l,
            }),
        }
    }
}

impl<B: Backend> Operation<B> for MatMul {
    fn name(&self) -> &'static str {
        "matmul"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let (lhs, rhs) = (&inputs[0], &inputs[1]);
        let mismatch = || GraphError::shape_mismatch("matmul", lhs, rhs);
        let shape = match Self::product(lhs, rhs)? {
            Product::Matrix => {
                if lhs[1] != rhs[0] {
                    return Err(mismatch());
                }
                shape_of(&[lhs[0], rhs[1]])
            }
            Product::Batched => {
                if lhs[0] != rhs[0] || lhs[2] != rhs[1] {
                    return Err(mismatch());
                }
                shape_of(&[lhs[0], lhs[1], rhs[2]])
            }
            Product::Vector => {
                if lhs[1] != rhs[0] {
                    return Err(mismatch());
                }
                shape_of(&[lhs[0]])
            }
        };
        Ok(Some(shape))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let b = ctx.backend();
        let (lhs, rhs) = (inputs[0], inputs[1]);
        match Self::product(lhs.shape(), rhs.shape())? {
            Product::Matrix => b.gemm(lhs, rhs, None, 1.0, 0.0, false, false),
            Product::Batched => b.batched_gemm(lhs, rhs, false, false),
            Product::Vector => b.gemv(lhs, rhs, 1.0, false),
        }
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let b = ctx.backend();
        let (lhs, rhs) = (ctx.input(0), ctx.input(1));
        let (gl, gr) = match Self::product(ctx.input_shape(0), ctx.input_shape(1))? {
            Product::Matrix => (
                b.gemm(grad, rhs, None, 1.0, 0.0, false, true)?,
                b.gemm(lhs, grad, None, 1.0, 0.0, true, false)?,
            ),
            Product::Batched => (
                b.batched_gemm(grad, rhs, false, true)?,
                b.batched_gemm(lhs, grad, true, false)?,
            ),
            Product::Vector => {
                // outer product g x^T
                let m = ctx.input_shape(0)[0];
                let k = ctx.input_shape(1)[0];
                let g_col = b.reshape(grad, &[m, 1])?;
                let x_col = b.reshape(rhs, &[k, 1])?;
                (
                    b.gemm(&g_col, &x_col, None, 1.0, 0.0, false, true)?,
                    b.gemv(lhs, grad, 1.0, true)?,
                )
            }
        };
        Ok(vec![
            ctx.needs_grad(0).then_some(gl),
            ctx.needs_grad(1).then_some(gr),
        ])
    }
}

/// `alpha * op(a) * op(b) + beta * c`.
#[derive(Debug)]
struct Gemm {
    alpha: f64,
    beta: f64,
    trans_a: bool,
    trans_b: bool,
}

impl Gemm {
    fn dims(&self, a: &[usize], b: &[usize]) -> Result<(usize, usize), GraphError> {
        for s in [a, b] {
            if s.len() != 2 {
                return Err(GraphError::RankMismatch {
                    op: "gemm",
                    expected: 2,
                    actual: s.len(),
                });
            }
        }
        let (m, k) = if self.trans_a { (a[1], a[0]) } else { (a[0], a[1]) };
        let (k2, n) = if self.trans_b { (b[1], b[0]) } else { (b[0], b[1]) };
        if k != k2 {
            return Err(GraphError::shape_mismatch("gemm", &[m, k], &[k2, n]));
        }
        Ok((m, n))
    }
}

impl<B: Backend> Operation<B> for Gemm {
    fn name(&self) -> &'static str {
        "gemm"
    }

    fn infer_shape(&self, inputs: &[Shape]) -> Result<Option<Shape>, GraphError> {
        let (m, n) = self.dims(&inputs[0], &inputs[1])?;
        if let Some(c) = inputs.get(2) {
            if c.as_slice() != [m, n] {
                return Err(GraphError::shape_mismatch("gemm", &[m, n], c));
            }
        }
        Ok(Some(shape_of(&[m, n])))
    }

    fn forward(&self, ctx: &mut ForwardContext<'_, B>, inputs: &[&B::Buffer]) -> Result<B::Buffer, GraphError> {
        let c = inputs.get(2).copied();
        ctx.backend().gemm(
            inputs[0],
            inputs[1],
            c,
            self.alpha,
            self.beta,
            self.trans_a,
            self.trans_b,
        )
    }

    fn backward(&self, ctx: &BackwardContext<'_, B>, grad: &B::Buffer) -> Result<Vec<Option<B::Buffer>>, GraphError> {
        let bk = ctx.backend();
        let (a, b) = (ctx.input(0), ctx.input(1));
        let (alpha, ta, tb) = (self.alpha, self.trans_a, self.trans_b);

        let ga = if !ctx.needs_grad(0) {
            None
        } else if ta {
            Some(bk.gemm(b, grad, None, alpha, 0.0, tb, true)?)
        } else {
            Some(bk.gemm(grad, b, None, alpha, 0.0, false, !tb)?)
        };
        let gb = if !ctx.needs_grad(1) {
            None
        } else if tb {
            Some(bk.gemm(grad, a, None, alpha, 0.0, true, ta)?)
        } else {
            Some(bk.gemm(a, grad, None, alpha, 0.0, !ta, false)?)
        };
        let mut grads = vec![ga, gb];
        if ctx.num_inputs() == 3 {
            let gc = if ctx.needs_grad(2) {
                Some(bk.scalar_op(BinaryOp::Mul, grad, self.beta, false)?)
            } else {
                None
            };
            grads.push(gc);
        }
        Ok(grads)
    }
}

impl<B: Backend> Tensor<B> {
    /// Matrix product, dispatched on operand ranks: matrix-matrix,
    /// batched matrix-matrix (rank 3, leading batch axis) and matrix-vector.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// // [[1, 2], [3, 4]]
    /// let a = Tensor::variable(&cpu, vec![1.0, 3.0, 2.0, 4.0], &[2, 2]).unwrap();
    /// let x = Tensor::variable(&cpu, vec![1.0, 1.0], &[2]).unwrap();
    /// let y = a.matmul(&x).unwrap();
    /// assert_eq!(y.to_vec().unwrap(), vec![3.0, 7.0]);
    /// ```
    pub fn matmul(&self, other: &Tensor<B>) -> Result<Tensor<B>, GraphError> {
        apply(MatMul, &[self, other])
    }

    /// General matrix product `alpha * op(a) * op(b) + beta * c`, where `op`
    /// transposes when the matching flag is set. Without `c` the `beta`
    /// term is dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn gemm(
        a: &Tensor<B>,
        b: &Tensor<B>,
        c: Option<&Tensor<B>>,
        alpha: f64,
        beta: f64,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Tensor<B>, GraphError> {
        let op = Gemm {
            alpha,
            beta,
            trans_a,
            trans_b,
        };
        match c {
            Some(c) => apply(op, &[a, b, c]),
            None => apply(op, &[a, b]),
        }
    }
}
