//! Lazy computation graph with reverse-mode differentiation.
//!
//! # Overview
//!
//! A [`Tensor`] is a handle on one of three node kinds:
//!
//! - **variable**: a leaf owning a value and a gradient accumulated in place;
//! - **constant**: a leaf without gradient. Operations whose inputs are all
//!   constants are evaluated immediately (see [`crate::config`]);
//! - **function**: a recorded operation. Its output is computed on demand,
//!   memoized for the current session, and released when the session closes
//!   unless the node was the explicit target of [`Tensor::forward`].
//!
//! Every buffer the engine holds is a [`Retained`] reference, so the number
//! of increments against a buffer always matches the number of releases once
//! the owning node or session is gone, whatever the backend's storage
//! strategy.
//!
//! # Example
//!
//! ```
//! use std::rc::Rc;
//! use lazygrad::{CpuBackend, Tensor};
//!
//! let cpu = Rc::new(CpuBackend::new());
//! let x = Tensor::variable(&cpu, vec![1.0, 2.0, 3.0], &[3]).unwrap();
//! let y = Tensor::variable(&cpu, vec![4.0, 5.0, 6.0], &[3]).unwrap();
//! let z = x.sub(&y).unwrap().square().unwrap().sum_all().unwrap();
//!
//! assert_eq!(z.item().unwrap(), 27.0);
//! z.backward().unwrap();
//! assert_eq!(x.grad().unwrap().data(), &[-6.0, -6.0, -6.0]);
//! assert_eq!(y.grad().unwrap().data(), &[6.0, 6.0, 6.0]);
//! ```

mod aggregate;
mod backward;
mod node;
mod operation;
mod retained;
mod session;
mod tensor;

pub use node::{NodeId, Tensor};
pub use operation::{BackwardContext, ForwardContext, Operation};
pub use retained::Retained;
pub use session::{Session, SessionStats};
