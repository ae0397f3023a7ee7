//! Scoped collection sessions and the forward evaluator.

use std::cell::RefCell;
use std::collections::HashSet;
use std::mem;
use std::rc::Rc;

use tracing::{Span, debug, debug_span, trace, warn};

use super::node::{Function, NodeId, NodeKind, Tensor};
use super::operation::ForwardContext;
use super::retained::Retained;
use crate::backend::{Backend, BufferHandle, CollectionScope};
use crate::config::config;
use crate::error::GraphError;
use crate::shape::shape_of;

/// What closing a session released.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Memoized node outputs dropped from the deferred queue.
    pub released_outputs: usize,
    /// Unreferenced buffers the backend scope released.
    pub scope_freed: usize,
}

/// Bounds the lifetime of buffers created during one traversal.
///
/// A session opens a backend collection scope and keeps a queue of nodes
/// whose outputs may be freed once the traversal is over. Closing the session
/// (explicitly or on drop, including error paths) drops those outputs unless
/// the node was the target of [`Tensor::forward`], then closes the scope.
///
/// Evaluating the same node twice in one session computes it once:
///
/// ```
/// use std::rc::Rc;
/// use lazygrad::backend::BufferHandle;
/// use lazygrad::{CpuBackend, Session, Tensor};
///
/// let cpu = Rc::new(CpuBackend::new());
/// let x = Tensor::variable(&cpu, vec![1.0, 2.0], &[2]).unwrap();
/// let y = x.exp().unwrap();
///
/// let session = Session::new(&cpu);
/// let first = session.forward(&y).unwrap();
/// let second = session.forward(&y).unwrap();
/// assert_eq!(first.id(), second.id());
/// session.close().unwrap();
/// assert!(!y.has_value());
/// ```
pub struct Session<B: Backend> {
    backend: Rc<B>,
    scope: Option<CollectionScope<B>>,
    deferred: RefCell<Vec<Tensor<B>>>,
    prepared: RefCell<HashSet<NodeId>>,
    span: Span,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: &Rc<B>) -> Self {
        let span = debug_span!("session", backend = backend.name());
        Self {
            backend: Rc::clone(backend),
            scope: Some(CollectionScope::open(backend)),
            deferred: RefCell::new(Vec::new()),
            prepared: RefCell::new(HashSet::new()),
            span,
        }
    }

    pub fn backend(&self) -> &Rc<B> {
        &self.backend
    }

    /// Evaluate `tensor` within this session.
    ///
    /// The returned handle stays valid until the session closes; the output
    /// of an operation node is dropped at close unless the node is kept.
    pub fn forward(&self, tensor: &Tensor<B>) -> Result<B::Buffer, GraphError> {
        if !Rc::ptr_eq(&self.backend, tensor.backend()) {
            return Err(GraphError::BackendMismatch { op: "forward" });
        }
        let _enter = self.span.enter();
        let buffer = self.evaluate(tensor, false)?;
        self.defer(tensor);
        Ok(buffer)
    }

    /// Evaluate `tensor` so that every node a backward pass from it will
    /// visit holds its output and saved buffers.
    pub(crate) fn prepare(&self, tensor: &Tensor<B>) -> Result<B::Buffer, GraphError> {
        let _enter = self.span.enter();
        let buffer = self.evaluate(tensor, true)?;
        self.defer(tensor);
        Ok(buffer)
    }

    /// Queue `tensor`'s output for release at session close.
    pub(crate) fn defer(&self, tensor: &Tensor<B>) {
        if matches!(tensor.node.kind, NodeKind::Function(_)) {
            self.deferred.borrow_mut().push(tensor.clone());
        }
    }

    /// Memoized evaluation in post order over an explicit stack.
    ///
    /// With `prepare`, nodes requiring gradients are also recomputed when
    /// their saved buffers were consumed, and their inputs are materialized
    /// even when the node's own output is memoized.
    pub(crate) fn evaluate(&self, tensor: &Tensor<B>, prepare: bool) -> Result<B::Buffer, GraphError> {
        let mut stack = vec![Frame {
            tensor: tensor.clone(),
            prepare,
            expanded: false,
        }];
        while let Some(frame) = stack.pop() {
            let NodeKind::Function(func) = &frame.tensor.node.kind else {
                continue;
            };
            let prepare = frame.prepare && func.requires_grad;
            if frame.expanded {
                self.materialize(&frame.tensor, func, prepare)?;
                continue;
            }
            if self.is_evaluated(&frame.tensor, func, prepare)? {
                continue;
            }
            stack.push(Frame {
                tensor: frame.tensor.clone(),
                prepare: frame.prepare,
                expanded: true,
            });
            // Reversed so the first input is evaluated first.
            for input in func.inputs.iter().rev() {
                if matches!(input.node.kind, NodeKind::Function(_)) {
                    stack.push(Frame {
                        tensor: input.clone(),
                        prepare,
                        expanded: false,
                    });
                }
            }
        }
        tensor.current_buffer()
    }

    fn is_evaluated(&self, tensor: &Tensor<B>, func: &Function<B>, prepare: bool) -> Result<bool, GraphError> {
        let state = func.state.borrow();
        if state.released {
            return Err(tensor.released_error());
        }
        let done = !prepare || self.prepared.borrow().contains(&tensor.node.id);
        Ok(done && state.has_value())
    }

    /// Produce the node's output once every input holds a value.
    fn materialize(&self, tensor: &Tensor<B>, func: &Function<B>, prepare: bool) -> Result<(), GraphError> {
        let ready = {
            let state = func.state.borrow();
            if prepare {
                state.ready_for_backward()
            } else {
                state.has_value()
            }
        };
        if !ready {
            let inputs = func
                .inputs
                .iter()
                .map(Tensor::current_buffer)
                .collect::<Result<Vec<_>, _>>()?;
            self.compute(tensor, func, &inputs)?;
        }
        if prepare {
            self.prepared.borrow_mut().insert(tensor.node.id);
        }
        Ok(())
    }

    fn compute(
        &self,
        tensor: &Tensor<B>,
        func: &Function<B>,
        inputs: &[B::Buffer],
    ) -> Result<(), GraphError> {
        let node = &tensor.node;
        let name = func.op.name();
        func.state.borrow_mut().clear_output();

        let refs: Vec<&B::Buffer> = inputs.iter().collect();
        let mut ctx = ForwardContext::new(&node.backend);
        let output = func.op.forward(&mut ctx, &refs)?;
        let output = Retained::new(&node.backend, output)?;
        check_output(tensor, name, output.buffer())?;
        trace!(node = %node.id, op = name, buffer = %output.buffer().id(), "materialized");

        {
            let mut state = func.state.borrow_mut();
            state.output = Some(output);
            state.saved = ctx.into_saved();
            state.saved_consumed = false;
        }
        // Queued as soon as it exists: if a consumer further up fails, the
        // output is still dropped at close.
        self.defer(tensor);
        for input in &func.inputs {
            if let NodeKind::Function(f) = &input.node.kind {
                if !f.state.borrow().keep_output {
                    self.defer(input);
                }
            }
        }
        Ok(())
    }

    /// Close the session, reporting what was released.
    pub fn close(mut self) -> Result<SessionStats, GraphError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<SessionStats, GraphError> {
        let _enter = self.span.enter();
        let deferred = mem::take(&mut *self.deferred.borrow_mut());
        let mut seen = HashSet::new();
        let mut stats = SessionStats::default();
        for tensor in deferred {
            if !seen.insert(tensor.node.id) {
                continue;
            }
            if let NodeKind::Function(func) = &tensor.node.kind {
                let mut state = func.state.borrow_mut();
                if !state.keep_output && state.clear_output() {
                    stats.released_outputs += 1;
                }
            }
        }
        self.prepared.borrow_mut().clear();
        if let Some(scope) = self.scope.take() {
            stats.scope_freed = scope.close()?;
        }
        debug!(
            released_outputs = stats.released_outputs,
            scope_freed = stats.scope_freed,
            "session closed"
        );
        Ok(stats)
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.scope.is_some() {
            if let Err(err) = self.finish() {
                warn!(%err, "failed to close session");
            }
        }
    }
}

struct Frame<B: Backend> {
    tensor: Tensor<B>,
    /// Preparation requested by the consumer that pushed this frame.
    prepare: bool,
    /// Inputs were already pushed; the node is next to materialize.
    expanded: bool,
}

/// Check a freshly computed output against the node's shape and, when
/// enabled, for NaN. Records the shape of lazily shaped nodes.
pub(crate) fn check_output<B: Backend>(
    tensor: &Tensor<B>,
    op: &'static str,
    output: &B::Buffer,
) -> Result<(), GraphError> {
    let node = &tensor.node;
    match node.shape.get() {
        Some(expected) if expected.as_slice() != output.shape() => {
            return Err(GraphError::shape_mismatch(op, expected, output.shape()));
        }
        Some(_) => {}
        None => {
            let _ = node.shape.set(shape_of(output.shape()));
        }
    }
    if config().check_nan && node.backend.has_nan(output)? {
        return Err(GraphError::NanDetected { op });
    }
    Ok(())
}
