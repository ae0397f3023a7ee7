//! Owned buffer references.

use std::fmt;
use std::rc::Rc;

use tracing::warn;

use crate::backend::{Backend, BufferHandle};
use crate::error::GraphError;

/// One reference to a backend buffer.
///
/// Taking a `Retained` increments the buffer's reference count; releasing or
/// dropping it decrements the count exactly once. The engine holds every
/// buffer it owns (node outputs, gradients, saved values, accumulators)
/// through this type.
pub struct Retained<B: Backend> {
    backend: Rc<B>,
    buffer: B::Buffer,
    armed: bool,
}

impl<B: Backend> Retained<B> {
    /// Take a reference to `buffer`.
    pub fn new(backend: &Rc<B>, buffer: B::Buffer) -> Result<Self, GraphError> {
        backend.increment_ref(&buffer)?;
        Ok(Self {
            backend: Rc::clone(backend),
            buffer,
            armed: true,
        })
    }

    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    pub fn shape(&self) -> &[usize] {
        self.buffer.shape()
    }

    /// Take a second reference to the same buffer.
    pub fn share(&self) -> Result<Self, GraphError> {
        Self::new(&self.backend, self.buffer.clone())
    }

    /// Release the reference now, reporting whether the buffer was freed.
    pub fn release(mut self) -> Result<bool, GraphError> {
        self.armed = false;
        self.backend.release(&self.buffer)
    }
}

impl<B: Backend> Drop for Retained<B> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = self.backend.release(&self.buffer) {
                warn!(buffer = %self.buffer.id(), %err, "release on drop failed");
            }
        }
    }
}

impl<B: Backend> fmt::Debug for Retained<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retained")
            .field("buffer", &self.buffer.id())
            .field("shape", &self.buffer.shape())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArenaBackend, CpuBackend};

    #[test]
    fn test_drop_releases_once() {
        let cpu = Rc::new(CpuBackend::new());
        let buf = cpu.zeros(&[2]);
        let r = Retained::new(&cpu, buf.clone()).unwrap();
        let s = r.share().unwrap();
        assert_eq!(cpu.ledger().refs(buf.id()), Some(2));
        drop(r);
        assert_eq!(cpu.ledger().history(buf.id()), Some((2, 1)));
        assert!(s.release().unwrap());
        assert!(cpu.ledger().is_freed(buf.id()));
        assert_eq!(cpu.ledger().history(buf.id()), None);
    }

    #[test]
    fn test_arena_storage_lives_while_retained() {
        let arena = Rc::new(ArenaBackend::new());
        let r = Retained::new(&arena, arena.full(&[3], 1.0)).unwrap();
        assert_eq!(arena.live_buffers(), 1);
        drop(r);
        assert_eq!(arena.live_buffers(), 0);
    }
}
