//! Host backend with passive (garbage-collected) storage.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use super::{Backend, BufferHandle, BufferId, Ledger, ScopeId, ScopeStack};
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::Shape;

/// Buffer of a [`CpuBackend`]: shared host storage.
#[derive(Debug, Clone)]
pub struct CpuBuffer {
    id: BufferId,
    shape: Shape,
    data: Rc<RefCell<DenseTensor>>,
}

impl BufferHandle for CpuBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Passive host backend.
///
/// Storage is reclaimed when the last handle is dropped, so releases only
/// update the ledger. Closing a scope marks its still unreferenced members
/// freed in the ledger without touching their storage. A buffer whose count
/// reached zero stays readable for as long as some handle survives.
///
/// # Example
///
/// ```
/// use lazygrad::backend::{Backend, CpuBackend};
///
/// let cpu = CpuBackend::new();
/// let a = cpu.from_vec(vec![1.0, 2.0], &[2]).unwrap();
/// let b = cpu.scalar_op(lazygrad::kernels::BinaryOp::Mul, &a, 3.0, false).unwrap();
/// assert_eq!(cpu.to_vec(&b).unwrap(), vec![3.0, 6.0]);
/// ```
#[derive(Debug, Default)]
pub struct CpuBackend {
    ledger: Ledger,
    scopes: ScopeStack,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for CpuBackend {
    type Buffer = CpuBuffer;

    fn name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, tensor: DenseTensor) -> CpuBuffer {
        let id = self.ledger.record_allocation();
        self.scopes.record(id);
        CpuBuffer {
            id,
            shape: Shape::from_slice(tensor.shape()),
            data: Rc::new(RefCell::new(tensor)),
        }
    }

    fn read<R>(&self, buffer: &CpuBuffer, f: impl FnOnce(&DenseTensor) -> R) -> Result<R, GraphError> {
        Ok(f(&buffer.data.borrow()))
    }

    fn write<R>(
        &self,
        buffer: &CpuBuffer,
        f: impl FnOnce(&mut DenseTensor) -> R,
    ) -> Result<R, GraphError> {
        let mut data = buffer.data.try_borrow_mut().map_err(|_| {
            GraphError::InvalidOperation(format!("buffer {} is borrowed", buffer.id))
        })?;
        Ok(f(&mut data))
    }

    fn increment_ref(&self, buffer: &CpuBuffer) -> Result<(), GraphError> {
        self.ledger.record_increment(buffer.id)
    }

    fn release(&self, buffer: &CpuBuffer) -> Result<bool, GraphError> {
        let unreferenced = self.ledger.record_release(buffer.id)?;
        if unreferenced {
            self.ledger.record_free(buffer.id);
            trace!(buffer = %buffer.id, "cpu buffer unreferenced");
        }
        Ok(unreferenced)
    }

    fn open_scope(&self) -> ScopeId {
        self.scopes.open()
    }

    fn close_scope(&self, scope: ScopeId) -> Result<usize, GraphError> {
        let closed = self.scopes.close(scope)?;
        let unreferenced = self.ledger.unreferenced(&closed.members);
        for &id in &unreferenced {
            self.ledger.record_free(id);
        }
        if closed.out_of_order {
            warn!(scope = scope.0, freed = unreferenced.len(), "cpu scope closed out of order");
        } else {
            debug!(scope = scope.0, freed = unreferenced.len(), "cpu scope closed");
        }
        closed.check_order(scope)?;
        Ok(unreferenced.len())
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }
}
