//! Numeric backend contract.
//!
//! A backend owns buffer storage and supplies the arithmetic. The graph engine
//! only ever sees opaque [`BufferHandle`]s and talks to the backend through the
//! lifecycle primitives (`increment_ref`, `release`, `open_scope`/`close_scope`)
//! and the numeric methods.
//!
//! # Backends
//!
//! - [`CpuBackend`]: passive strategy. Storage is shared through `Rc` and
//!   reclaimed when the last handle drops; scopes only settle the ledger.
//! - [`ArenaBackend`]: active strategy. Storage lives in a slot table, is freed
//!   as soon as its reference count drops to zero, and scopes force-release
//!   every unreferenced buffer allocated while they were open.
//!
//! Both keep a [`Ledger`] of increments and releases so reference-count
//! conservation can be checked regardless of strategy.
//!
//! # Kernels
//!
//! All numeric methods are provided in terms of [`Backend::read`] and
//! [`Backend::allocate`] and run the host kernels of [`crate::kernels`].
//! A device backend overrides the ones it accelerates.

mod arena;
mod cpu;
mod ledger;
mod registry;
mod scope;

use std::fmt;

use rand::Rng;

use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::kernels::{
    self, ArgReduceOp, BatchNormStats, BinaryOp, CompareOp, Conv2dParams, ReduceOp, UnaryOp,
};
use crate::shape::numel;

pub use arena::{ArenaBackend, ArenaBuffer};
pub use cpu::{CpuBackend, CpuBuffer};
pub use ledger::{Ledger, LedgerStats};
pub use registry::{
    default_backend, lookup_backend, register_backend, registered_backends, set_default_backend,
};
pub use scope::CollectionScope;
pub(crate) use scope::ScopeStack;

/// Identifier of a buffer, unique within one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u64);

impl BufferId {
    /// Raw id value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of an open collection scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(pub(crate) u64);

/// Opaque handle to backend-owned storage.
///
/// Cloning a handle does not take a reference; ownership is expressed only
/// through [`Backend::increment_ref`] / [`Backend::release`].
pub trait BufferHandle: Clone + fmt::Debug + 'static {
    /// Identity of the buffer within its backend.
    fn id(&self) -> BufferId;

    /// Shape of the stored tensor.
    fn shape(&self) -> &[usize];

    /// Number of elements.
    fn len(&self) -> usize {
        numel(self.shape())
    }

    /// Whether the buffer holds no elements.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A numeric backend: storage, lifecycle and arithmetic.
pub trait Backend: fmt::Debug + 'static {
    /// Buffer handle type.
    type Buffer: BufferHandle;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Take ownership of host data as a new buffer with no references.
    ///
    /// Buffers allocated while a scope is open are registered with it.
    fn allocate(&self, tensor: DenseTensor) -> Self::Buffer;

    /// Run `f` on the host view of a buffer.
    fn read<R>(
        &self,
        buffer: &Self::Buffer,
        f: impl FnOnce(&DenseTensor) -> R,
    ) -> Result<R, GraphError>;

    /// Run `f` on the mutable host view of a buffer.
    fn write<R>(
        &self,
        buffer: &Self::Buffer,
        f: impl FnOnce(&mut DenseTensor) -> R,
    ) -> Result<R, GraphError>;

    /// Take one reference to `buffer`.
    fn increment_ref(&self, buffer: &Self::Buffer) -> Result<(), GraphError>;

    /// Drop one reference to `buffer`. Returns whether it became unreferenced.
    ///
    /// # Errors
    ///
    /// `AlreadyReleased` when the buffer holds no reference to drop.
    fn release(&self, buffer: &Self::Buffer) -> Result<bool, GraphError>;

    /// Open a collection scope. Scopes nest and must close in reverse order.
    fn open_scope(&self) -> ScopeId;

    /// Close a scope, returning how many unreferenced buffers it released.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` when the scope is not open, or when a scope opened
    /// after it is still open. In the latter case the scope is removed and
    /// its members released before the error is returned.
    fn close_scope(&self, scope: ScopeId) -> Result<usize, GraphError>;

    /// Reference-count bookkeeping of this backend.
    fn ledger(&self) -> &Ledger;

    /// Release several buffers, reporting per buffer whether it was freed.
    fn release_all(&self, buffers: &[&Self::Buffer]) -> Result<Vec<bool>, GraphError> {
        buffers.iter().map(|b| self.release(b)).collect()
    }

    /// Free per-call scratch storage (convolution workspaces, pools).
    fn cleanup(&self) {}

    // ----- construction -------------------------------------------------

    fn zeros(&self, shape: &[usize]) -> Self::Buffer {
        self.allocate(DenseTensor::zeros(shape))
    }

    fn full(&self, shape: &[usize], value: f64) -> Self::Buffer {
        self.allocate(DenseTensor::full(shape, value))
    }

    fn scalar(&self, value: f64) -> Self::Buffer {
        self.allocate(DenseTensor::scalar(value))
    }

    fn from_vec(&self, data: Vec<f64>, shape: &[usize]) -> Result<Self::Buffer, GraphError> {
        Ok(self.allocate(DenseTensor::from_vec(data, shape)?))
    }

    fn random_uniform<R: Rng>(&self, shape: &[usize], low: f64, high: f64, rng: &mut R) -> Self::Buffer {
        self.allocate(kernels::random_uniform(shape, low, high, rng))
    }

    fn random_normal<R: Rng>(&self, shape: &[usize], mean: f64, std: f64, rng: &mut R) -> Self::Buffer {
        self.allocate(kernels::random_normal(shape, mean, std, rng))
    }

    // ----- host access --------------------------------------------------

    /// Copy of the buffer contents on the host.
    fn to_dense(&self, buffer: &Self::Buffer) -> Result<DenseTensor, GraphError> {
        self.read(buffer, |t| t.clone())
    }

    /// Flat column-major copy of the buffer contents.
    fn to_vec(&self, buffer: &Self::Buffer) -> Result<Vec<f64>, GraphError> {
        self.read(buffer, |t| t.data().to_vec())
    }

    /// NaN containment check.
    fn has_nan(&self, buffer: &Self::Buffer) -> Result<bool, GraphError> {
        self.read(buffer, DenseTensor::has_nan)
    }

    /// `dst += src` in place. Shapes must match.
    fn add_assign(&self, dst: &Self::Buffer, src: &Self::Buffer) -> Result<(), GraphError> {
        let src = self.to_dense(src)?;
        self.write(dst, |d| kernels::add_into(d, &src))?
    }

    // ----- elementwise --------------------------------------------------

    fn unary(&self, op: UnaryOp, x: &Self::Buffer) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| Ok(kernels::unary(x, op)))
    }

    fn binary(&self, op: BinaryOp, a: &Self::Buffer, b: &Self::Buffer) -> Result<Self::Buffer, GraphError> {
        map2(self, a, b, |a, b| kernels::binary(a, b, op))
    }

    fn scalar_op(
        &self,
        op: BinaryOp,
        x: &Self::Buffer,
        c: f64,
        reversed: bool,
    ) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| Ok(kernels::scalar_op(x, c, op, reversed)))
    }

    fn compare(&self, op: CompareOp, a: &Self::Buffer, b: &Self::Buffer) -> Result<Self::Buffer, GraphError> {
        map2(self, a, b, |a, b| kernels::compare(a, b, op))
    }

    // ----- layout -------------------------------------------------------

    fn reshape(&self, x: &Self::Buffer, shape: &[usize]) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| x.clone().reshaped(shape))
    }

    fn permute(&self, x: &Self::Buffer, perm: &[usize]) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::permute(x, perm))
    }

    fn broadcast_to(&self, x: &Self::Buffer, shape: &[usize]) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::broadcast_to(x, shape))
    }

    fn sum_to(&self, x: &Self::Buffer, shape: &[usize]) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::sum_to(x, shape))
    }

    fn narrow(&self, x: &Self::Buffer, axis: usize, start: usize, len: usize) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::narrow(x, axis, start, len))
    }

    fn embed(
        &self,
        base: &Self::Buffer,
        src: &Self::Buffer,
        axis: usize,
        start: usize,
    ) -> Result<Self::Buffer, GraphError> {
        map2(self, base, src, |base, src| kernels::embed(base, src, axis, start))
    }

    fn concat(&self, parts: &[&Self::Buffer], axis: usize) -> Result<Self::Buffer, GraphError> {
        let hosts = parts
            .iter()
            .map(|p| self.to_dense(p))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&DenseTensor> = hosts.iter().collect();
        Ok(self.allocate(kernels::concat(&refs, axis)?))
    }

    // ----- reductions ---------------------------------------------------

    fn reduce(
        &self,
        op: ReduceOp,
        x: &Self::Buffer,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::reduce(x, op, axes, keep_dims))
    }

    fn arg_reduce(
        &self,
        op: ArgReduceOp,
        x: &Self::Buffer,
        axis: usize,
        keep_dims: bool,
    ) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::arg_reduce(x, op, axis, keep_dims))
    }

    // ----- indexing -----------------------------------------------------

    fn index_select(&self, x: &Self::Buffer, axis: usize, indices: &[usize]) -> Result<Self::Buffer, GraphError> {
        map1(self, x, |x| kernels::index_select(x, axis, indices))
    }

    fn index_add(
        &self,
        base: &Self::Buffer,
        axis: usize,
        indices: &[usize],
        src: &Self::Buffer,
    ) -> Result<Self::Buffer, GraphError> {
        map2(self, base, src, |base, src| kernels::index_add(base, axis, indices, src))
    }

    fn gather(&self, x: &Self::Buffer, axis: usize, index: &Self::Buffer) -> Result<Self::Buffer, GraphError> {
        map2(self, x, index, |x, index| kernels::gather(x, axis, index))
    }

    fn scatter_add(
        &self,
        base: &Self::Buffer,
        axis: usize,
        index: &Self::Buffer,
        src: &Self::Buffer,
    ) -> Result<Self::Buffer, GraphError> {
        let index = self.to_dense(index)?;
        map2(self, base, src, |base, src| kernels::scatter_add(base, axis, &index, src))
    }

    // ----- BLAS ---------------------------------------------------------

    /// `alpha * op(a) * op(b) + beta * c`.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        &self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        c: Option<&Self::Buffer>,
        alpha: f64,
        beta: f64,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Self::Buffer, GraphError> {
        let c = c.map(|c| self.to_dense(c)).transpose()?;
        map2(self, a, b, |a, b| {
            kernels::gemm(a, b, c.as_ref(), alpha, beta, trans_a, trans_b)
        })
    }

    fn batched_gemm(
        &self,
        a: &Self::Buffer,
        b: &Self::Buffer,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Self::Buffer, GraphError> {
        map2(self, a, b, |a, b| kernels::batched_gemm(a, b, trans_a, trans_b))
    }

    fn gemv(&self, a: &Self::Buffer, x: &Self::Buffer, alpha: f64, trans_a: bool) -> Result<Self::Buffer, GraphError> {
        map2(self, a, x, |a, x| kernels::gemv(a, x, alpha, trans_a))
    }

    // ----- neural-net operators ----------------------------------------

    fn conv2d(
        &self,
        input: &Self::Buffer,
        weight: &Self::Buffer,
        bias: Option<&Self::Buffer>,
        params: Conv2dParams,
    ) -> Result<Self::Buffer, GraphError> {
        let bias = bias.map(|b| self.to_dense(b)).transpose()?;
        map2(self, input, weight, |x, w| kernels::conv2d(x, w, bias.as_ref(), params))
    }

    fn conv2d_grad_input(
        &self,
        input_shape: &[usize],
        weight: &Self::Buffer,
        grad_output: &Self::Buffer,
        params: Conv2dParams,
    ) -> Result<Self::Buffer, GraphError> {
        map2(self, weight, grad_output, |w, dy| {
            kernels::conv2d_grad_input(input_shape, w, dy, params)
        })
    }

    /// Gradients with respect to weight and bias.
    fn conv2d_grad_params(
        &self,
        input: &Self::Buffer,
        weight_shape: &[usize],
        grad_output: &Self::Buffer,
        params: Conv2dParams,
    ) -> Result<(Self::Buffer, Self::Buffer), GraphError> {
        let (dw, db) = self.read(input, |x| {
            self.read(grad_output, |dy| kernels::conv2d_grad_weight(x, weight_shape, dy, params))
        })???;
        Ok((self.allocate(dw), self.allocate(db)))
    }

    /// Pooled output and the argmax positions used by the backward pass.
    fn max_pool2d(
        &self,
        x: &Self::Buffer,
        kernel: usize,
        stride: usize,
    ) -> Result<(Self::Buffer, Self::Buffer), GraphError> {
        let (out, argmax) = self.read(x, |x| kernels::max_pool2d(x, kernel, stride))??;
        Ok((self.allocate(out), self.allocate(argmax)))
    }

    fn max_pool2d_backward(
        &self,
        input_shape: &[usize],
        argmax: &Self::Buffer,
        grad_output: &Self::Buffer,
    ) -> Result<Self::Buffer, GraphError> {
        map2(self, argmax, grad_output, |argmax, dy| {
            kernels::max_pool2d_backward(input_shape, argmax, dy)
        })
    }

    /// Normalized output plus per-channel mean and inverse standard deviation.
    fn batch_norm(
        &self,
        x: &Self::Buffer,
        gamma: &Self::Buffer,
        beta: &Self::Buffer,
        eps: f64,
    ) -> Result<(Self::Buffer, Self::Buffer, Self::Buffer), GraphError> {
        let beta = self.to_dense(beta)?;
        let (out, stats) = self.read(x, |x| {
            self.read(gamma, |gamma| kernels::batch_norm(x, gamma, &beta, eps))
        })???;
        Ok((
            self.allocate(out),
            self.allocate(stats.mean),
            self.allocate(stats.inv_std),
        ))
    }

    /// Gradients `(dx, dgamma, dbeta)`.
    fn batch_norm_backward(
        &self,
        x: &Self::Buffer,
        gamma: &Self::Buffer,
        mean: &Self::Buffer,
        inv_std: &Self::Buffer,
        grad_output: &Self::Buffer,
    ) -> Result<(Self::Buffer, Self::Buffer, Self::Buffer), GraphError> {
        let stats = BatchNormStats {
            mean: self.to_dense(mean)?,
            inv_std: self.to_dense(inv_std)?,
        };
        let dy = self.to_dense(grad_output)?;
        let (dx, dgamma, dbeta) = self.read(x, |x| {
            self.read(gamma, |gamma| kernels::batch_norm_backward(x, gamma, &stats, &dy))
        })???;
        Ok((self.allocate(dx), self.allocate(dgamma), self.allocate(dbeta)))
    }
}

/// Run a one-input host kernel and allocate its result.
fn map1<B: Backend + ?Sized>(
    backend: &B,
    x: &B::Buffer,
    f: impl FnOnce(&DenseTensor) -> Result<DenseTensor, GraphError>,
) -> Result<B::Buffer, GraphError> {
    let out = backend.read(x, f)??;
    Ok(backend.allocate(out))
}

/// Run a two-input host kernel and allocate its result.
fn map2<B: Backend + ?Sized>(
    backend: &B,
    a: &B::Buffer,
    b: &B::Buffer,
    f: impl FnOnce(&DenseTensor, &DenseTensor) -> Result<DenseTensor, GraphError>,
) -> Result<B::Buffer, GraphError> {
    let out = backend.read(a, |a| backend.read(b, |b| f(a, b)))???;
    Ok(backend.allocate(out))
}
