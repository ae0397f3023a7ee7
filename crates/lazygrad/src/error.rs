//! Error types for lazygrad.

use thiserror::Error;

/// Errors that can occur while building, evaluating or differentiating a graph.
///
/// Shape and contract violations are raised while a node is constructed or
/// first evaluated. Lifecycle misuse signals a programming error in the caller
/// (or a bug in the engine) and is never swallowed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GraphError {
    /// Shape mismatch between two operands or between data and shape.
    #[error("shape mismatch in {op}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Shapes cannot be broadcast together.
    #[error("shapes {lhs:?} and {rhs:?} are not broadcast-compatible")]
    BroadcastMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// Operation requires a specific rank.
    #[error("{op} expects a tensor of rank {expected}, got rank {actual}")]
    RankMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Axis is out of range for the tensor rank.
    #[error("axis {axis} is out of range for a tensor of rank {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },

    /// Invalid permutation.
    #[error("invalid permutation {perm:?} for tensor with {ndim} dimensions")]
    InvalidPermutation { perm: Vec<usize>, ndim: usize },

    /// Index out of bounds.
    #[error("index out of bounds: index {index} is out of range for dimension {dim_size}")]
    IndexOutOfBounds { index: usize, dim_size: usize },

    /// Wrong number of indices provided.
    #[error("wrong number of indices: expected {expected}, got {actual}")]
    WrongNumberOfIndices { expected: usize, actual: usize },

    /// An index tensor holds a value that is not a non-negative integer.
    #[error("index value {value} is not a non-negative integer")]
    InvalidIndex { value: f64 },

    /// Concatenation of an empty list of tensors.
    #[error("cannot concatenate an empty list of tensors")]
    EmptyConcat,

    /// Releasing a buffer that holds no reference owned by the caller.
    #[error("buffer {id} released more often than it was retained")]
    AlreadyReleased { id: u64 },

    /// Touching the storage of a buffer the backend already freed.
    #[error("buffer {id} has already been freed")]
    BufferReleased { id: u64 },

    /// Using a node after it was explicitly released.
    #[error("node {id} has been released")]
    NodeReleased { id: u64 },

    /// Reading the gradient of a node that does not accumulate one.
    #[error("node {id} does not accumulate a gradient")]
    NoGradient { id: u64 },

    /// `backward()` without an explicit gradient on a non-scalar node.
    #[error("backward() requires a scalar root or an explicit gradient, got shape {shape:?}")]
    NonScalarBackward { shape: Vec<usize> },

    /// Operands of one graph live on different backends.
    #[error("operands of {op} belong to different backends")]
    BackendMismatch { op: &'static str },

    /// No backend registered under this key.
    #[error("no backend registered under key {key:?}")]
    UnknownBackend { key: String },

    /// A forward kernel produced NaN values.
    #[error("NaN detected in the output of {op}")]
    NanDetected { op: &'static str },

    /// Any other invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl GraphError {
    /// Shorthand for a [`GraphError::ShapeMismatch`].
    pub(crate) fn shape_mismatch(op: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        GraphError::ShapeMismatch {
            op,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Whether the error is a lifecycle misuse rather than a contract violation.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            GraphError::AlreadyReleased { .. }
                | GraphError::BufferReleased { .. }
                | GraphError::NodeReleased { .. }
                | GraphError::NoGradient { .. }
                | GraphError::NonScalarBackward { .. }
                | GraphError::BackendMismatch { .. }
        )
    }
}
