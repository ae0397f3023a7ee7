//! Host kernels behind the provided methods of [`Backend`](crate::backend::Backend).
//!
//! Every kernel takes dense host tensors and returns freshly allocated ones;
//! none of them knows about buffers, reference counts or the graph.

mod conv;
mod elementwise;
mod gemm;
mod index;
mod layout;
mod norm;
mod pool;
mod random;
mod reduce;

pub use conv::{Conv2dParams, conv2d, conv2d_grad_input, conv2d_grad_weight};
pub use elementwise::{add_into, binary, compare, scalar_op, unary};
pub use gemm::{batched_gemm, gemm, gemv};
pub use index::{gather, index_add, index_select, scatter_add, to_index};
pub use layout::{broadcast_to, concat, embed, narrow, permute, sum_to};
pub use norm::{BatchNormStats, batch_norm, batch_norm_backward};
pub use pool::{max_pool2d, max_pool2d_backward};
pub use random::{random_normal, random_uniform};
pub use reduce::{arg_reduce, reduce};

pub(crate) use conv::conv2d_output_shape;
pub(crate) use norm::check_batch_norm_shapes;
pub(crate) use pool::max_pool2d_output_shape;

/// Elementwise unary functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Exp,
    Ln,
    Sqrt,
    Abs,
    Relu,
    Sigmoid,
    Tanh,
    Square,
    /// Heaviside step: 1 where x > 0, else 0.
    Step,
    /// Sign: -1, 0 or 1.
    Sign,
    Identity,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Exp => "exp",
            UnaryOp::Ln => "ln",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Abs => "abs",
            UnaryOp::Relu => "relu",
            UnaryOp::Sigmoid => "sigmoid",
            UnaryOp::Tanh => "tanh",
            UnaryOp::Square => "square",
            UnaryOp::Step => "step",
            UnaryOp::Sign => "sign",
            UnaryOp::Identity => "identity",
        }
    }

    #[inline]
    pub fn apply(self, x: f64) -> f64 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Exp => x.exp(),
            UnaryOp::Ln => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Abs => x.abs(),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Square => x * x,
            UnaryOp::Step => {
                if x > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Identity => x,
        }
    }
}

/// Elementwise binary functions (broadcasting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
    Minimum,
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Maximum => "maximum",
            BinaryOp::Minimum => "minimum",
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
            BinaryOp::Maximum => a.max(b),
            BinaryOp::Minimum => a.min(b),
        }
    }
}

/// Elementwise comparisons, producing 1.0 for true and 0.0 for false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl CompareOp {
    pub fn name(self) -> &'static str {
        match self {
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
            CompareOp::Eq => "eq",
        }
    }

    #[inline]
    pub fn apply(self, a: f64, b: f64) -> f64 {
        let hit = match self {
            CompareOp::Gt => a > b,
            CompareOp::Ge => a >= b,
            CompareOp::Lt => a < b,
            CompareOp::Le => a <= b,
            CompareOp::Eq => a == b,
        };
        if hit { 1.0 } else { 0.0 }
    }
}

/// Reductions over a set of axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
            ReduceOp::Max => "max",
            ReduceOp::Min => "min",
        }
    }
}

/// Index-producing reductions along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgReduceOp {
    ArgMax,
    ArgMin,
}

impl ArgReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ArgReduceOp::ArgMax => "argmax",
            ArgReduceOp::ArgMin => "argmin",
        }
    }
}
