//! lazygrad - lazily evaluated reverse-mode automatic differentiation
//!
//! Tensor operations record a computation graph instead of computing. The
//! graph is evaluated on demand, memoized within a session, and
//! differentiated in reverse mode. Arithmetic is delegated to a pluggable
//! numeric backend, and every buffer the engine touches is reference
//! counted, so intermediates are released exactly once whatever the
//! backend's storage strategy.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Graph builder (ops module)
//!     → add, matmul, conv2d, sum, ... on Tensor<B>
//!
//! Level 2: Graph engine (graph module)
//!     → Tensor, Session, forward evaluation, backward propagation
//!
//! Level 3: Numeric backend (backend module)
//!     → CpuBackend (shared host storage)
//!     → ArenaBackend (slot table with explicit frees, models device memory)
//! ```
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use lazygrad::{CpuBackend, Tensor};
//!
//! let cpu = Rc::new(CpuBackend::new());
//! let w = Tensor::variable(&cpu, vec![0.5, -1.0], &[2]).unwrap();
//! let x = Tensor::constant(&cpu, vec![2.0, 3.0], &[2]).unwrap();
//!
//! // nothing is computed yet
//! let loss = w.mul(&x).unwrap().sum_all().unwrap().square().unwrap();
//! assert!(!loss.has_value());
//!
//! loss.backward().unwrap();
//! // loss = (w . x)^2, d/dw = 2 (w . x) x = -4 x
//! assert_eq!(w.grad().unwrap().data(), &[-8.0, -12.0]);
//! ```

pub mod backend;
pub mod config;
pub mod dense;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod kernels;
pub mod ops;
pub mod shape;

pub use backend::{ArenaBackend, Backend, BufferHandle, CpuBackend};
pub use config::GraphConfig;
pub use dense::DenseTensor;
pub use descriptor::{TensorDescriptor, transfer};
pub use error::GraphError;
pub use graph::{Operation, Retained, Session, SessionStats, Tensor};
