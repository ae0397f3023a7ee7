//! Graph nodes and the user-facing tensor handle.

use std::cell::{Cell, OnceCell, RefCell};
use std::fmt;
use std::mem;
use std::rc::Rc;

use super::operation::Operation;
use super::retained::Retained;
use crate::backend::Backend;
use crate::error::GraphError;
use crate::shape::Shape;

/// Unique identifier for a node in the computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        thread_local! {
            static NEXT_NODE: Cell<u64> = const { Cell::new(0) };
        }
        NEXT_NODE.with(|n| {
            let id = n.get();
            n.set(id + 1);
            NodeId(id)
        })
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

pub(crate) struct Node<B: Backend> {
    pub(crate) id: NodeId,
    pub(crate) backend: Rc<B>,
    /// Known at construction for leaves and inferable operations, otherwise
    /// filled by the first forward step.
    pub(crate) shape: OnceCell<Shape>,
    pub(crate) kind: NodeKind<B>,
}

pub(crate) enum NodeKind<B: Backend> {
    /// Leaf accumulating a gradient.
    Variable(RefCell<LeafState<B>>),
    /// Leaf without gradient. The value is `None` once released.
    Constant(RefCell<Option<Retained<B>>>),
    Function(Function<B>),
}

pub(crate) struct LeafState<B: Backend> {
    pub(crate) value: Option<Retained<B>>,
    pub(crate) grad: Option<Retained<B>>,
}

pub(crate) struct Function<B: Backend> {
    pub(crate) op: Box<dyn Operation<B>>,
    pub(crate) inputs: Vec<Tensor<B>>,
    pub(crate) requires_grad: bool,
    pub(crate) state: RefCell<FunctionState<B>>,
}

impl<B: Backend> Drop for Function<B> {
    // Unlinks long chains one node at a time instead of recursing through
    // nested `Rc` drops.
    fn drop(&mut self) {
        let mut stack = mem::take(&mut self.inputs);
        while let Some(tensor) = stack.pop() {
            if let Some(mut node) = Rc::into_inner(tensor.node) {
                if let NodeKind::Function(func) = &mut node.kind {
                    stack.append(&mut func.inputs);
                }
            }
        }
    }
}

/// Mutable state of an operation node.
pub(crate) struct FunctionState<B: Backend> {
    pub(crate) output: Option<Retained<B>>,
    pub(crate) saved: Vec<Retained<B>>,
    /// Saved buffers were consumed by a completed backward step.
    pub(crate) saved_consumed: bool,
    pub(crate) consumer_count: usize,
    pub(crate) delivered: usize,
    pub(crate) backward_completed: bool,
    pub(crate) pending: Option<Retained<B>>,
    pub(crate) keep_output: bool,
    pub(crate) released: bool,
}

impl<B: Backend> FunctionState<B> {
    fn new() -> Self {
        Self {
            output: None,
            saved: Vec::new(),
            saved_consumed: false,
            consumer_count: 0,
            delivered: 0,
            backward_completed: false,
            pending: None,
            keep_output: false,
            released: false,
        }
    }

    pub(crate) fn has_value(&self) -> bool {
        self.output.is_some()
    }

    /// Output and saved buffers are both present.
    pub(crate) fn ready_for_backward(&self) -> bool {
        self.output.is_some() && !self.saved_consumed
    }

    /// Drop the memoized output and saved buffers. Returns whether an output
    /// was held.
    pub(crate) fn clear_output(&mut self) -> bool {
        self.saved.clear();
        self.saved_consumed = false;
        self.output.take().is_some()
    }

    pub(crate) fn reset_backward(&mut self) {
        self.consumer_count = 0;
        self.delivered = 0;
        self.backward_completed = false;
        self.pending = None;
    }
}

/// Handle to a node of the computation graph.
///
/// Cloning is cheap and yields another handle to the same node. Operations
/// build new nodes lazily; nothing is computed until a value, a gradient or
/// a shape that cannot be inferred is requested.
pub struct Tensor<B: Backend> {
    pub(crate) node: Rc<Node<B>>,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Self {
            node: Rc::clone(&self.node),
        }
    }
}

impl<B: Backend> fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.node.kind {
            NodeKind::Variable(_) => "variable",
            NodeKind::Constant(_) => "constant",
            NodeKind::Function(func) => func.op.name(),
        };
        f.debug_struct("Tensor")
            .field("id", &self.node.id)
            .field("kind", &kind)
            .field("shape", &self.node.shape.get())
            .finish()
    }
}

impl<B: Backend> Tensor<B> {
    pub(crate) fn from_node(backend: &Rc<B>, shape: Option<Shape>, kind: NodeKind<B>) -> Self {
        let cell = OnceCell::new();
        if let Some(shape) = shape {
            let _ = cell.set(shape);
        }
        Self {
            node: Rc::new(Node {
                id: NodeId::next(),
                backend: Rc::clone(backend),
                shape: cell,
                kind,
            }),
        }
    }

    /// New leaf owning a reference to `value`.
    pub(crate) fn leaf(value: Retained<B>, requires_grad: bool) -> Result<Self, GraphError> {
        let backend = Rc::clone(value.backend());
        let shape = Shape::from_slice(value.shape());
        let kind = if requires_grad {
            let grad = Retained::new(&backend, backend.zeros(&shape))?;
            NodeKind::Variable(RefCell::new(LeafState {
                value: Some(value),
                grad: Some(grad),
            }))
        } else {
            NodeKind::Constant(RefCell::new(Some(value)))
        };
        Ok(Self::from_node(&backend, Some(shape), kind))
    }

    pub(crate) fn function(
        backend: &Rc<B>,
        op: Box<dyn Operation<B>>,
        inputs: Vec<Tensor<B>>,
        requires_grad: bool,
        shape: Option<Shape>,
    ) -> Self {
        Self::from_node(
            backend,
            shape,
            NodeKind::Function(Function {
                op,
                inputs,
                requires_grad,
                state: RefCell::new(FunctionState::new()),
            }),
        )
    }

    pub fn id(&self) -> NodeId {
        self.node.id
    }

    /// Backend owning this node's buffers.
    pub fn backend(&self) -> &Rc<B> {
        &self.node.backend
    }

    /// Whether gradients flow into this node.
    pub fn requires_grad(&self) -> bool {
        match &self.node.kind {
            NodeKind::Variable(_) => true,
            NodeKind::Constant(_) => false,
            NodeKind::Function(func) => func.requires_grad,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self.node.kind, NodeKind::Function(_))
    }

    pub fn is_variable(&self) -> bool {
        matches!(self.node.kind, NodeKind::Variable(_))
    }

    pub fn is_constant(&self) -> bool {
        matches!(self.node.kind, NodeKind::Constant(_))
    }

    /// Whether the node was disposed with [`Tensor::release`].
    pub fn is_released(&self) -> bool {
        match &self.node.kind {
            NodeKind::Variable(leaf) => leaf.borrow().value.is_none(),
            NodeKind::Constant(value) => value.borrow().is_none(),
            NodeKind::Function(func) => func.state.borrow().released,
        }
    }

    /// Whether an operation node currently holds a memoized output.
    /// Leaves always have a value until released.
    pub fn has_value(&self) -> bool {
        match &self.node.kind {
            NodeKind::Function(func) => func.state.borrow().has_value(),
            _ => !self.is_released(),
        }
    }

    /// Whether two handles refer to the same node.
    pub fn same_node(&self, other: &Tensor<B>) -> bool {
        Rc::ptr_eq(&self.node, &other.node)
    }

    /// Inputs of an operation node; empty for leaves.
    pub fn inputs(&self) -> &[Tensor<B>] {
        match &self.node.kind {
            NodeKind::Function(func) => &func.inputs,
            _ => &[],
        }
    }

    /// Name of the recorded operation, `None` for leaves.
    pub fn op_name(&self) -> Option<&'static str> {
        match &self.node.kind {
            NodeKind::Function(func) => Some(func.op.name()),
            _ => None,
        }
    }

    pub(crate) fn released_error(&self) -> GraphError {
        GraphError::NodeReleased {
            id: self.node.id.index(),
        }
    }

    /// Value buffer of a leaf, or the memoized output of an operation.
    pub(crate) fn current_buffer(&self) -> Result<B::Buffer, GraphError> {
        let buffer = match &self.node.kind {
            NodeKind::Variable(leaf) => leaf.borrow().value.as_ref().map(|v| v.buffer().clone()),
            NodeKind::Constant(value) => value.borrow().as_ref().map(|v| v.buffer().clone()),
            NodeKind::Function(func) => {
                let state = func.state.borrow();
                if state.released {
                    None
                } else {
                    return state
                        .output
                        .as_ref()
                        .map(|o| o.buffer().clone())
                        .ok_or_else(|| {
                            GraphError::InvalidOperation(format!(
                                "{} has not been evaluated",
                                self.node.id
                            ))
                        });
                }
            }
        };
        buffer.ok_or_else(|| self.released_error())
    }

    /// Retain a second reference to a leaf's value buffer.
    pub(crate) fn share_leaf_value(&self) -> Result<Option<Retained<B>>, GraphError> {
        let shared = match &self.node.kind {
            NodeKind::Variable(leaf) => leaf.borrow().value.as_ref().map(Retained::share),
            NodeKind::Constant(value) => value.borrow().as_ref().map(Retained::share),
            NodeKind::Function(_) => return Ok(None),
        };
        match shared {
            Some(r) => r.map(Some),
            None => Err(self.released_error()),
        }
    }
}
