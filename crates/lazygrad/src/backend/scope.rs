//! Collection scopes: the per-backend stack of open scopes and the RAII
//! guard the graph engine opens them through.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::warn;

use super::{Backend, BufferId, ScopeId};
use crate::error::GraphError;

#[derive(Debug)]
struct OpenScope {
    id: ScopeId,
    members: Vec<BufferId>,
}

/// Buffers allocated while a scope was open, handed back when it closes.
#[derive(Debug)]
pub(crate) struct ClosedScope {
    pub(crate) members: Vec<BufferId>,
    /// Another scope opened later was still open.
    pub(crate) out_of_order: bool,
}

impl ClosedScope {
    /// The misuse error for an out-of-order close, once the caller has
    /// released the members.
    pub(crate) fn check_order(&self, scope: ScopeId) -> Result<(), GraphError> {
        if self.out_of_order {
            return Err(GraphError::InvalidOperation(format!(
                "scope {} closed out of order",
                scope.0
            )));
        }
        Ok(())
    }
}

/// Stack of open scopes, each recording the buffers allocated inside it.
///
/// New allocations join the innermost scope. Closing a scope that is not
/// innermost still removes it, so a misordered close never leaves a scope
/// collecting members forever.
#[derive(Debug, Default)]
pub(crate) struct ScopeStack {
    open: RefCell<Vec<OpenScope>>,
    next: Cell<u64>,
}

impl ScopeStack {
    pub(crate) fn open(&self) -> ScopeId {
        let id = ScopeId(self.next.get());
        self.next.set(id.0 + 1);
        self.open.borrow_mut().push(OpenScope {
            id,
            members: Vec::new(),
        });
        id
    }

    pub(crate) fn record(&self, buffer: BufferId) {
        if let Some(scope) = self.open.borrow_mut().last_mut() {
            scope.members.push(buffer);
        }
    }

    pub(crate) fn close(&self, scope: ScopeId) -> Result<ClosedScope, GraphError> {
        let mut open = self.open.borrow_mut();
        let at = open
            .iter()
            .rposition(|s| s.id == scope)
            .ok_or_else(|| GraphError::InvalidOperation(format!("scope {} is not open", scope.0)))?;
        let out_of_order = at + 1 != open.len();
        let members = open.remove(at).members;
        Ok(ClosedScope { members, out_of_order })
    }

    pub(crate) fn depth(&self) -> usize {
        self.open.borrow().len()
    }
}

/// Open collection scope, closed on drop.
///
/// Dropping the guard ignores close errors after logging them; call
/// [`CollectionScope::close`] to observe them.
#[derive(Debug)]
pub struct CollectionScope<B: Backend> {
    backend: Rc<B>,
    id: Option<ScopeId>,
}

impl<B: Backend> CollectionScope<B> {
    pub fn open(backend: &Rc<B>) -> Self {
        let id = backend.open_scope();
        Self {
            backend: Rc::clone(backend),
            id: Some(id),
        }
    }

    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    /// Close now, returning how many buffers the backend released.
    pub fn close(mut self) -> Result<usize, GraphError> {
        match self.id.take() {
            Some(id) => self.backend.close_scope(id),
            None => Ok(0),
        }
    }
}

impl<B: Backend> Drop for CollectionScope<B> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            if let Err(err) = self.backend.close_scope(id) {
                warn!(backend = self.backend.name(), %err, "failed to close collection scope");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocations_join_innermost_scope() {
        let stack = ScopeStack::default();
        let outer = stack.open();
        stack.record(BufferId(0));
        let inner = stack.open();
        stack.record(BufferId(1));
        stack.record(BufferId(2));

        let closed = stack.close(inner).unwrap();
        assert_eq!(closed.members, vec![BufferId(1), BufferId(2)]);
        assert!(closed.check_order(inner).is_ok());
        assert_eq!(stack.close(outer).unwrap().members, vec![BufferId(0)]);
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_misordered_close_removes_the_scope() {
        let stack = ScopeStack::default();
        let outer = stack.open();
        let inner = stack.open();
        let closed = stack.close(outer).unwrap();
        assert!(closed.out_of_order);
        assert!(matches!(
            closed.check_order(outer),
            Err(GraphError::InvalidOperation(_))
        ));
        assert_eq!(stack.depth(), 1);

        stack.record(BufferId(7));
        assert_eq!(stack.close(inner).unwrap().members, vec![BufferId(7)]);
        assert!(stack.close(outer).is_err());
        assert_eq!(stack.depth(), 0);
    }
}
