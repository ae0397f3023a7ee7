//! Dense host tensor used as the storage format of the built-in backends.

use crate::error::GraphError;
use crate::shape::{Shape, cartesian_to_linear, compute_strides, numel, shape_of};

/// Dense `f64` tensor in column-major order.
///
/// This is the host representation the provided kernels operate on. The graph
/// engine never touches it directly; it only sees backend buffer handles.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    data: Vec<f64>,
    shape: Shape,
}

impl DenseTensor {
    /// Create a zero-initialized tensor.
    ///
    /// # Examples
    ///
    /// ```
    /// use lazygrad::DenseTensor;
    ///
    /// let t = DenseTensor::zeros(&[2, 3, 4]);
    /// assert_eq!(t.shape(), &[2, 3, 4]);
    /// assert_eq!(t.len(), 24);
    /// ```
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64) -> Self {
        Self {
            data: vec![value; numel(shape)],
            shape: shape_of(shape),
        }
    }

    /// Create a rank-0 tensor.
    pub fn scalar(value: f64) -> Self {
        Self {
            data: vec![value],
            shape: Shape::new(),
        }
    }

    /// Create tensor from data (column-major) and shape.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::ShapeMismatch` if the data length doesn't match the shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use lazygrad::DenseTensor;
    ///
    /// let t = DenseTensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.get(&[1, 0]), Some(2.0)); // column-major
    /// assert_eq!(t.get(&[0, 1]), Some(3.0));
    /// ```
    pub fn from_vec(data: Vec<f64>, shape: &[usize]) -> Result<Self, GraphError> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(GraphError::ShapeMismatch {
                op: "from_vec",
                expected: vec![expected],
                actual: vec![data.len()],
            });
        }
        Ok(Self {
            data,
            shape: shape_of(shape),
        })
    }

    /// Build from data whose length is known to match `shape`.
    pub(crate) fn from_parts(data: Vec<f64>, shape: &[usize]) -> Self {
        debug_assert_eq!(data.len(), numel(shape));
        Self {
            data,
            shape: shape_of(shape),
        }
    }

    /// Get the shape.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get the rank.
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the tensor holds no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Column-major strides.
    pub fn strides(&self) -> Shape {
        compute_strides(&self.shape)
    }

    /// Underlying data.
    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Underlying data, mutable.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consume and return the data vector.
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Element at cartesian indices, `None` when out of bounds.
    pub fn get(&self, indices: &[usize]) -> Option<f64> {
        if indices.len() != self.ndim() {
            return None;
        }
        if indices.iter().zip(self.shape.iter()).any(|(&i, &d)| i >= d) {
            return None;
        }
        let linear = cartesian_to_linear(indices, &self.strides());
        self.data.get(linear).copied()
    }

    /// Set element at cartesian indices.
    ///
    /// # Errors
    ///
    /// Returns error if indices are out of bounds or of the wrong count.
    pub fn set(&mut self, indices: &[usize], value: f64) -> Result<(), GraphError> {
        if indices.len() != self.ndim() {
            return Err(GraphError::WrongNumberOfIndices {
                expected: self.ndim(),
                actual: indices.len(),
            });
        }
        for (&idx, &dim) in indices.iter().zip(self.shape.iter()) {
            if idx >= dim {
                return Err(GraphError::IndexOutOfBounds {
                    index: idx,
                    dim_size: dim,
                });
            }
        }
        let linear = cartesian_to_linear(indices, &self.strides());
        self.data[linear] = value;
        Ok(())
    }

    /// Same data under a new shape with the same element count.
    pub fn reshaped(mut self, shape: &[usize]) -> Result<Self, GraphError> {
        if numel(shape) != self.len() {
            return Err(GraphError::shape_mismatch("reshape", &self.shape, shape));
        }
        self.shape = shape_of(shape);
        Ok(self)
    }

    /// Whether any element is NaN.
    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|x| x.is_nan())
    }
}
