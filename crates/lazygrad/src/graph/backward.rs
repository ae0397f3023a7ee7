//! Reverse-mode propagation.
//!
//! A backward call runs in its own [`Session`]:
//!
//! 1. the root is evaluated so every node on a gradient path holds its
//!    output and saved buffers;
//! 2. counting state is reset on every reachable node, then a registration
//!    pass counts the distinct consumers of each operation node;
//! 3. gradients propagate from the root. A node with several consumers
//!    accumulates contributions and only runs its backward step once all of
//!    them have delivered;
//! 4. outputs of nodes not kept by [`Tensor::forward`] are released and the
//!    session closes, on success and error alike.

use std::collections::HashSet;

use tracing::{debug, debug_span, trace};

use super::node::{Function, NodeKind, Tensor};
use super::operation::BackwardContext;
use super::retained::Retained;
use super::session::Session;
use crate::backend::{Backend, BufferHandle};
use crate::error::GraphError;
use crate::kernels::BinaryOp;
use crate::shape::{Shape, is_unit};

impl<B: Backend> Tensor<B> {
    /// Backpropagate from a unit-shaped node, seeding its gradient with one.
    ///
    /// Gradients accumulate into every variable the node depends on.
    /// Calling this on a node that does not require gradients does nothing.
    ///
    /// # Errors
    ///
    /// `NonScalarBackward` when the node holds more than one element; use
    /// [`Tensor::backward_with`] to supply a gradient instead.
    ///
    /// # Example
    ///
    /// ```
    /// use std::rc::Rc;
    /// use lazygrad::{CpuBackend, Tensor};
    ///
    /// let cpu = Rc::new(CpuBackend::new());
    /// let a = Tensor::variable(&cpu, vec![2.0], &[]).unwrap();
    /// let b = a.mul_scalar(3.0).unwrap();
    /// let c = a.mul_scalar(5.0).unwrap();
    /// let d = b.add(&c).unwrap();
    /// d.backward().unwrap();
    /// assert_eq!(a.grad().unwrap().data(), &[8.0]);
    /// ```
    pub fn backward(&self) -> Result<(), GraphError> {
        let shape = self.shape()?;
        if !is_unit(&shape) {
            return Err(GraphError::NonScalarBackward {
                shape: shape.to_vec(),
            });
        }
        self.run_backward(None)
    }

    /// Backpropagate with an explicit output gradient of this node's shape.
    ///
    /// The gradient is copied; the caller keeps ownership of `grad`.
    pub fn backward_with(&self, grad: &B::Buffer) -> Result<(), GraphError> {
        let shape = self.shape()?;
        if grad.shape() != shape.as_slice() {
            return Err(GraphError::shape_mismatch("backward", &shape, grad.shape()));
        }
        self.run_backward(Some(grad))
    }

    fn run_backward(&self, seed: Option<&B::Buffer>) -> Result<(), GraphError> {
        let span = debug_span!("backward", root = %self.id());
        let _enter = span.enter();
        let session = Session::new(self.backend());
        let result = self.backward_in(&session, seed);
        let released = release_unused(self);
        let closed = session.close();
        debug!(released, "backward finished");
        result?;
        closed.map(|_| ())
    }

    fn backward_in(&self, session: &Session<B>, seed: Option<&B::Buffer>) -> Result<(), GraphError> {
        let backend = self.backend();
        session.prepare(self)?;
        let shape = self.shape()?;
        let seed = match seed {
            Some(grad) => backend.allocate(backend.to_dense(grad)?),
            None => backend.full(&shape, 1.0),
        };
        let seed = Retained::new(backend, seed)?;

        match &self.node.kind {
            NodeKind::Function(func) if func.requires_grad => {
                reset_reachable(self);
                register(self);
            }
            NodeKind::Variable(_) => {}
            _ => return Ok(()),
        }
        flow(self, seed)
    }
}

/// Drive gradients from `root` with an explicit work list, so graph depth
/// never turns into call depth.
fn flow<B: Backend>(root: &Tensor<B>, seed: Retained<B>) -> Result<(), GraphError> {
    let mut work = vec![(root.clone(), Some(seed))];
    while let Some((tensor, grad)) = work.pop() {
        deliver(&tensor, grad, &mut work)?;
    }
    Ok(())
}

/// Operation nodes reachable from `root` through inputs, each visited once.
fn walk_functions<B: Backend>(root: &Tensor<B>, only_grad: bool, mut f: impl FnMut(&Tensor<B>, &Function<B>)) {
    let mut visited = HashSet::new();
    let mut stack = vec![root.clone()];
    while let Some(tensor) = stack.pop() {
        let NodeKind::Function(func) = &tensor.node.kind else {
            continue;
        };
        if (only_grad && !func.requires_grad) || !visited.insert(tensor.id()) {
            continue;
        }
        f(&tensor, func);
        stack.extend(func.inputs.iter().cloned());
    }
}

/// Fresh counting state for one backward call.
fn reset_reachable<B: Backend>(root: &Tensor<B>) {
    walk_functions(root, true, |_, func| func.state.borrow_mut().reset_backward());
}

/// Count, for every reachable operation node, its distinct direct consumers.
fn register<B: Backend>(root: &Tensor<B>) {
    walk_functions(root, true, |_, func| {
        let mut seen = HashSet::new();
        for input in &func.inputs {
            if !seen.insert(input.id()) {
                continue;
            }
            if let NodeKind::Function(f) = &input.node.kind {
                if f.requires_grad {
                    f.state.borrow_mut().consumer_count += 1;
                }
            }
        }
    });
}

/// Drop outputs of nodes not kept past the session, and any leftover
/// accumulators. Returns how many outputs were dropped.
pub(crate) fn release_unused<B: Backend>(root: &Tensor<B>) -> usize {
    let mut released = 0;
    walk_functions(root, false, |_, func| {
        let mut state = func.state.borrow_mut();
        state.pending = None;
        if !state.keep_output && state.clear_output() {
            released += 1;
        }
    });
    released
}

/// Hand one consumer's gradient contribution to `input`. Operation nodes
/// that become ready push their own inputs onto `work`.
fn deliver<B: Backend>(
    input: &Tensor<B>,
    grad: Option<Retained<B>>,
    work: &mut Vec<(Tensor<B>, Option<Retained<B>>)>,
) -> Result<(), GraphError> {
    match &input.node.kind {
        NodeKind::Variable(leaf) => {
            let Some(grad) = grad else {
                return Ok(());
            };
            let leaf = leaf.borrow();
            let target = leaf.grad.as_ref().ok_or_else(|| input.released_error())?;
            input.backend().add_assign(target.buffer(), grad.buffer())?;
            trace!(node = %input.id(), "gradient accumulated into variable");
            Ok(())
        }
        NodeKind::Constant(_) => Ok(()),
        NodeKind::Function(func) if func.requires_grad => propagate(input, func, grad, work),
        NodeKind::Function(_) => Ok(()),
    }
}

/// `a + b` into a new retained buffer.
fn sum<B: Backend>(a: Retained<B>, b: Retained<B>) -> Result<Retained<B>, GraphError> {
    let backend = a.backend();
    let total = backend.binary(BinaryOp::Add, a.buffer(), b.buffer())?;
    Retained::new(backend, total)
}

fn propagate<B: Backend>(
    tensor: &Tensor<B>,
    func: &Function<B>,
    grad: Option<Retained<B>>,
    work: &mut Vec<(Tensor<B>, Option<Retained<B>>)>,
) -> Result<(), GraphError> {
    let backend = tensor.backend();
    let grad = {
        let mut state = func.state.borrow_mut();
        if state.released {
            return Err(tensor.released_error());
        }
        if state.backward_completed {
            return Ok(());
        }
        if state.consumer_count > 1 {
            state.delivered += 1;
            let merged = match (state.pending.take(), grad) {
                (Some(pending), Some(grad)) => Some(sum(pending, grad)?),
                (pending, grad) => pending.or(grad),
            };
            if state.delivered < state.consumer_count {
                trace!(
                    node = %tensor.id(),
                    delivered = state.delivered,
                    consumers = state.consumer_count,
                    "gradient pending"
                );
                state.pending = merged;
                return Ok(());
            }
            merged
        } else {
            grad
        }
    };

    let Some(grad) = grad else {
        // Nothing flowed in; inputs still count this node as delivered.
        complete(func);
        let inputs = unique_inputs(func);
        work.extend(inputs.into_iter().rev().map(|input| (input, None)));
        return Ok(());
    };

    let inputs = func
        .inputs
        .iter()
        .map(Tensor::current_buffer)
        .collect::<Result<Vec<_>, _>>()?;
    let input_shapes = func
        .inputs
        .iter()
        .map(Tensor::shape)
        .collect::<Result<Vec<Shape>, _>>()?;
    let needs_grad: Vec<bool> = func.inputs.iter().map(Tensor::requires_grad).collect();
    let (output, saved) = {
        let state = func.state.borrow();
        let output = state
            .output
            .as_ref()
            .map(|o| o.buffer().clone())
            .ok_or_else(|| tensor.released_error())?;
        let saved: Vec<B::Buffer> = state.saved.iter().map(|s| s.buffer().clone()).collect();
        (output, saved)
    };

    let ctx = BackwardContext {
        backend,
        inputs: &inputs,
        input_shapes: &input_shapes,
        needs_grad: &needs_grad,
        output: &output,
        saved: &saved,
    };
    let raw = func.op.backward(&ctx, grad.buffer())?;
    let mut grads = raw
        .into_iter()
        .map(|g| g.map(|b| Retained::new(backend, b)).transpose())
        .collect::<Result<Vec<_>, _>>()?;
    if grads.len() != func.inputs.len() {
        return Err(GraphError::InvalidOperation(format!(
            "{} produced {} gradients for {} inputs",
            func.op.name(),
            grads.len(),
            func.inputs.len()
        )));
    }
    trace!(node = %tensor.id(), op = func.op.name(), "backward step");
    complete(func);
    drop(grad);

    // An input used in several slots receives the sum of their gradients.
    let mut handled = HashSet::new();
    let mut ready = Vec::new();
    for (i, input) in func.inputs.iter().enumerate() {
        if !handled.insert(input.id()) || !needs_grad[i] {
            continue;
        }
        let mut total: Option<Retained<B>> = None;
        for j in i..func.inputs.len() {
            if !func.inputs[j].same_node(input) {
                continue;
            }
            if let Some(g) = grads[j].take() {
                total = Some(match total {
                    Some(t) => sum(t, g)?,
                    None => g,
                });
            }
        }
        if let Some(t) = &total {
            if t.shape() != input_shapes[i].as_slice() {
                return Err(GraphError::shape_mismatch(
                    func.op.name(),
                    &input_shapes[i],
                    t.shape(),
                ));
            }
        }
        ready.push((input.clone(), total));
    }
    work.extend(ready.into_iter().rev());
    Ok(())
}

/// Mark the backward step done and drop the buffers it consumed.
fn complete<B: Backend>(func: &Function<B>) {
    let mut state = func.state.borrow_mut();
    state.backward_completed = true;
    state.pending = None;
    state.saved.clear();
    state.saved_consumed = true;
}

fn unique_inputs<B: Backend>(func: &Function<B>) -> Vec<Tensor<B>> {
    let mut seen = HashSet::new();
    func.inputs
        .iter()
        .filter(|t| t.requires_grad() && seen.insert(t.id()))
        .cloned()
        .collect()
}
