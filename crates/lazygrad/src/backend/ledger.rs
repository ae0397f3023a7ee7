//! Reference-count bookkeeping shared by all backends.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use super::BufferId;
use crate::error::GraphError;

#[derive(Debug, Default, Clone, Copy)]
struct Entry {
    refs: usize,
    increments: usize,
    releases: usize,
}

/// Aggregate counters of a [`Ledger`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LedgerStats {
    pub allocations: usize,
    pub increments: usize,
    pub releases: usize,
    pub frees: usize,
    /// Buffers allocated and not yet freed.
    pub live: usize,
}

/// Per-buffer record of reference increments and releases.
///
/// Every increment is eventually matched by exactly one release; a buffer
/// whose count reaches zero is freed. Releasing a buffer that holds no
/// reference is an error rather than a silent underflow.
///
/// Only buffers that are not yet freed keep an entry, so the ledger stays
/// as large as the set of live buffers. Freed buffers survive in the
/// aggregate [`LedgerStats`].
#[derive(Debug, Default)]
pub struct Ledger {
    next_id: Cell<u64>,
    entries: RefCell<HashMap<BufferId, Entry>>,
    stats: Cell<LedgerStats>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, f: impl FnOnce(&mut LedgerStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    /// Register a fresh buffer and return its id.
    pub fn record_allocation(&self) -> BufferId {
        let id = BufferId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().insert(id, Entry::default());
        self.bump(|s| {
            s.allocations += 1;
            s.live += 1;
        });
        id
    }

    /// Count one reference taken on `id`.
    ///
    /// # Errors
    ///
    /// `BufferReleased` when `id` was freed or never allocated here.
    pub fn record_increment(&self, id: BufferId) -> Result<(), GraphError> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries
            .get_mut(&id)
            .ok_or(GraphError::BufferReleased { id: id.0 })?;
        entry.refs += 1;
        entry.increments += 1;
        drop(entries);
        self.bump(|s| s.increments += 1);
        Ok(())
    }

    /// Count one reference dropped on `id`. Returns whether the count hit zero.
    pub fn record_release(&self, id: BufferId) -> Result<bool, GraphError> {
        let mut entries = self.entries.borrow_mut();
        let entry = entries
            .get_mut(&id)
            .ok_or(GraphError::AlreadyReleased { id: id.0 })?;
        if entry.refs == 0 {
            return Err(GraphError::AlreadyReleased { id: id.0 });
        }
        entry.refs -= 1;
        entry.releases += 1;
        let unreferenced = entry.refs == 0;
        drop(entries);
        self.bump(|s| s.releases += 1);
        Ok(unreferenced)
    }

    /// Mark `id` as freed and drop its entry. Freeing twice is a no-op.
    pub fn record_free(&self, id: BufferId) {
        if self.entries.borrow_mut().remove(&id).is_some() {
            self.bump(|s| {
                s.frees += 1;
                s.live -= 1;
            });
        }
    }

    /// Current reference count, `None` for freed or unknown ids.
    pub fn refs(&self, id: BufferId) -> Option<usize> {
        self.entries.borrow().get(&id).map(|e| e.refs)
    }

    /// `(increments, releases)` recorded for a buffer not yet freed.
    pub fn history(&self, id: BufferId) -> Option<(usize, usize)> {
        self.entries
            .borrow()
            .get(&id)
            .map(|e| (e.increments, e.releases))
    }

    /// Whether `id` was allocated here and has been freed since.
    pub fn is_freed(&self, id: BufferId) -> bool {
        id.0 < self.next_id.get() && !self.entries.borrow().contains_key(&id)
    }

    /// Number of buffers with an entry, i.e. allocated and not yet freed.
    pub fn tracked(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn stats(&self) -> LedgerStats {
        self.stats.get()
    }

    /// Buffers still holding references, with their counts, sorted by id.
    pub fn unbalanced(&self) -> Vec<(BufferId, usize)> {
        let mut out: Vec<_> = self
            .entries
            .borrow()
            .iter()
            .filter(|(_, e)| e.refs > 0)
            .map(|(id, e)| (*id, e.refs))
            .collect();
        out.sort();
        out
    }

    /// Allocated buffers whose count is zero. Candidates for a scope close.
    pub(crate) fn unreferenced<'a>(&self, ids: impl IntoIterator<Item = &'a BufferId>) -> Vec<BufferId> {
        let entries = self.entries.borrow();
        ids.into_iter()
            .filter(|id| entries.get(id).is_some_and(|e| e.refs == 0))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_release_balance() {
        let ledger = Ledger::new();
        let id = ledger.record_allocation();
        ledger.record_increment(id).unwrap();
        ledger.record_increment(id).unwrap();
        assert!(!ledger.record_release(id).unwrap());
        assert_eq!(ledger.unbalanced(), vec![(id, 1)]);
        assert!(ledger.record_release(id).unwrap());
        assert!(ledger.unbalanced().is_empty());
        assert_eq!(ledger.history(id), Some((2, 2)));
    }

    #[test]
    fn test_release_without_reference_errors() {
        let ledger = Ledger::new();
        let id = ledger.record_allocation();
        assert_eq!(
            ledger.record_release(id),
            Err(GraphError::AlreadyReleased { id: id.get() })
        );
    }

    #[test]
    fn test_freed_buffer_rejects_increment() {
        let ledger = Ledger::new();
        let id = ledger.record_allocation();
        ledger.record_free(id);
        ledger.record_free(id);
        assert!(ledger.record_increment(id).is_err());
        let stats = ledger.stats();
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.live, 0);
        assert_eq!(ledger.refs(id), None);
        assert!(ledger.is_freed(id));
        assert!(!ledger.is_freed(BufferId(id.get() + 1)));
    }

    #[test]
    fn test_entries_dropped_on_free() {
        let ledger = Ledger::new();
        for _ in 0..100 {
            let id = ledger.record_allocation();
            ledger.record_increment(id).unwrap();
            if ledger.record_release(id).unwrap() {
                ledger.record_free(id);
            }
        }
        let kept = ledger.record_allocation();
        let idle = ledger.record_allocation();
        ledger.record_increment(kept).unwrap();
        assert_eq!(ledger.tracked(), 2);
        assert_eq!(ledger.stats().live, 2);
        assert_eq!(ledger.unreferenced(&[kept, idle]), vec![idle]);
    }
}
