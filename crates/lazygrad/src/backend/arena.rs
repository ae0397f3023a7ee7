//! Host backend with active (explicitly freed) storage.

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::{debug, trace, warn};

use super::{Backend, BufferHandle, BufferId, Ledger, ScopeId, ScopeStack};
use crate::dense::DenseTensor;
use crate::error::GraphError;
use crate::shape::{Shape, numel};

/// Maximum number of recycled vectors kept for reuse.
const POOL_CAPACITY: usize = 32;

/// Buffer of an [`ArenaBackend`]: a key into its slot table.
#[derive(Debug, Clone)]
pub struct ArenaBuffer {
    id: BufferId,
    shape: Shape,
}

impl BufferHandle for ArenaBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}

/// Active host backend modelling device memory.
///
/// Storage is freed the moment its reference count drops to zero, and any
/// buffer allocated inside a scope that is still unreferenced when the scope
/// closes is freed then. Touching freed storage is an error, which makes
/// lifecycle bugs visible instead of silently working.
///
/// Freed vectors are recycled through a small pool drained by
/// [`Backend::cleanup`].
#[derive(Debug, Default)]
pub struct ArenaBackend {
    ledger: Ledger,
    slots: RefCell<HashMap<BufferId, DenseTensor>>,
    scopes: ScopeStack,
    pool: RefCell<Vec<Vec<f64>>>,
}

impl ArenaBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers currently holding storage.
    pub fn live_buffers(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Number of vectors waiting in the reuse pool.
    pub fn pooled(&self) -> usize {
        self.pool.borrow().len()
    }

    /// Number of collection scopes currently open.
    pub fn open_scopes(&self) -> usize {
        self.scopes.depth()
    }

    /// Whether `buffer` still holds storage.
    pub fn is_live(&self, buffer: &ArenaBuffer) -> bool {
        self.slots.borrow().contains_key(&buffer.id)
    }

    fn free(&self, id: BufferId) -> bool {
        let Some(tensor) = self.slots.borrow_mut().remove(&id) else {
            return false;
        };
        self.ledger.record_free(id);
        let mut pool = self.pool.borrow_mut();
        if pool.len() < POOL_CAPACITY {
            pool.push(tensor.into_vec());
        }
        trace!(buffer = %id, "arena buffer freed");
        true
    }

    fn take_pooled(&self, len: usize) -> Option<Vec<f64>> {
        let mut pool = self.pool.borrow_mut();
        let at = pool.iter().position(|v| v.capacity() >= len)?;
        Some(pool.swap_remove(at))
    }
}

impl Backend for ArenaBackend {
    type Buffer = ArenaBuffer;

    fn name(&self) -> &str {
        "arena"
    }

    fn allocate(&self, tensor: DenseTensor) -> ArenaBuffer {
        let id = self.ledger.record_allocation();
        let shape = Shape::from_slice(tensor.shape());
        self.slots.borrow_mut().insert(id, tensor);
        self.scopes.record(id);
        ArenaBuffer { id, shape }
    }

    fn read<R>(&self, buffer: &ArenaBuffer, f: impl FnOnce(&DenseTensor) -> R) -> Result<R, GraphError> {
        let slots = self.slots.borrow();
        let tensor = slots
            .get(&buffer.id)
            .ok_or(GraphError::BufferReleased { id: buffer.id.get() })?;
        Ok(f(tensor))
    }

    fn write<R>(
        &self,
        buffer: &ArenaBuffer,
        f: impl FnOnce(&mut DenseTensor) -> R,
    ) -> Result<R, GraphError> {
        let mut slots = self.slots.borrow_mut();
        let tensor = slots
            .get_mut(&buffer.id)
            .ok_or(GraphError::BufferReleased { id: buffer.id.get() })?;
        Ok(f(tensor))
    }

    fn increment_ref(&self, buffer: &ArenaBuffer) -> Result<(), GraphError> {
        self.ledger.record_increment(buffer.id)
    }

    fn release(&self, buffer: &ArenaBuffer) -> Result<bool, GraphError> {
        let unreferenced = self.ledger.record_release(buffer.id)?;
        if unreferenced {
            self.free(buffer.id);
        }
        Ok(unreferenced)
    }

    fn open_scope(&self) -> ScopeId {
        self.scopes.open()
    }

    fn close_scope(&self, scope: ScopeId) -> Result<usize, GraphError> {
        let closed = self.scopes.close(scope)?;
        let freed = self
            .ledger
            .unreferenced(&closed.members)
            .into_iter()
            .filter(|&id| self.free(id))
            .count();
        if closed.out_of_order {
            warn!(scope = scope.0, freed, "arena scope closed out of order");
        } else {
            debug!(scope = scope.0, freed, "arena scope closed");
        }
        closed.check_order(scope)?;
        Ok(freed)
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn cleanup(&self) {
        let drained = self.pool.borrow_mut().drain(..).count();
        trace!(drained, "arena pool drained");
    }

    fn full(&self, shape: &[usize], value: f64) -> ArenaBuffer {
        let len = numel(shape);
        match self.take_pooled(len) {
            Some(mut data) => {
                data.clear();
                data.resize(len, value);
                self.allocate(DenseTensor::from_parts(data, shape))
            }
            None => self.allocate(DenseTensor::full(shape, value)),
        }
    }

    fn zeros(&self, shape: &[usize]) -> ArenaBuffer {
        self.full(shape, 0.0)
    }
}
