//! Shape algebra and stride computation.
//!
//! Host storage is column-major (Fortran) order. Broadcasting aligns shapes
//! from the right, independent of the storage order.

use smallvec::SmallVec;

use crate::error::GraphError;

/// Tensor shape. Most tensors in practice have rank four or less.
pub type Shape = SmallVec<[usize; 4]>;

/// Build a [`Shape`] from a slice.
pub fn shape_of(dims: &[usize]) -> Shape {
    Shape::from_slice(dims)
}

/// Number of elements described by a shape. Rank-0 shapes hold one element.
pub fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Whether a shape describes a single scalar (`[]`, `[1]`, `[1, 1]`, ...).
pub fn is_unit(shape: &[usize]) -> bool {
    numel(shape) == 1
}

/// Compute column-major strides from shape.
///
/// For shape [d0, d1, d2, ...], returns strides [1, d0, d0*d1, ...].
///
/// # Examples
///
/// ```
/// use lazygrad::shape::compute_strides;
///
/// assert_eq!(compute_strides(&[3, 4, 5]).as_slice(), &[1, 3, 12]);
/// assert_eq!(compute_strides(&[5]).as_slice(), &[1]);
/// assert!(compute_strides(&[]).is_empty());
/// ```
pub fn compute_strides(shape: &[usize]) -> Shape {
    let mut strides = Shape::with_capacity(shape.len());
    let mut stride = 1;
    for &dim in shape {
        strides.push(stride);
        stride *= dim;
    }
    strides
}

/// Convert cartesian indices to a linear index.
#[inline]
pub fn cartesian_to_linear(indices: &[usize], strides: &[usize]) -> usize {
    indices
        .iter()
        .zip(strides.iter())
        .map(|(&idx, &stride)| idx * stride)
        .sum()
}

/// Convert a linear index to cartesian indices, writing into `out`.
#[inline]
pub fn linear_to_cartesian_into(mut linear: usize, shape: &[usize], out: &mut Shape) {
    out.clear();
    for &dim in shape {
        out.push(linear % dim);
        linear /= dim;
    }
}

/// Convert a linear index to cartesian indices.
pub fn linear_to_cartesian(linear: usize, shape: &[usize]) -> Shape {
    let mut out = Shape::new();
    linear_to_cartesian_into(linear, shape, &mut out);
    out
}

/// Result shape of broadcasting `lhs` against `rhs`.
///
/// # Examples
///
/// ```
/// use lazygrad::shape::broadcast_shapes;
///
/// let s = broadcast_shapes(&[2, 3], &[3]).unwrap();
/// assert_eq!(s.as_slice(), &[2, 3]);
/// assert!(broadcast_shapes(&[2, 3], &[2]).is_err());
/// ```
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Shape, GraphError> {
    let ndim = lhs.len().max(rhs.len());
    let mut out = Shape::from_elem(1, ndim);
    for i in 0..ndim {
        let l = dim_from_right(lhs, ndim, i);
        let r = dim_from_right(rhs, ndim, i);
        out[i] = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => {
                return Err(GraphError::BroadcastMismatch {
                    lhs: lhs.to_vec(),
                    rhs: rhs.to_vec(),
                });
            }
        };
    }
    Ok(out)
}

/// Whether `from` can be broadcast to exactly `to`.
pub fn can_broadcast_to(from: &[usize], to: &[usize]) -> bool {
    if from.len() > to.len() {
        return false;
    }
    let offset = to.len() - from.len();
    from.iter()
        .enumerate()
        .all(|(i, &d)| d == 1 || d == to[i + offset])
}

/// Strides that read `shape` as if it were broadcast to `target`
/// (zero stride on broadcast dimensions).
pub fn broadcast_strides(shape: &[usize], target: &[usize]) -> Shape {
    let own = compute_strides(shape);
    let offset = target.len() - shape.len();
    let mut strides = Shape::from_elem(0, target.len());
    for (i, &d) in shape.iter().enumerate() {
        if d != 1 {
            strides[i + offset] = own[i];
        }
    }
    strides
}

fn dim_from_right(shape: &[usize], ndim: usize, i: usize) -> usize {
    let offset = ndim - shape.len();
    if i < offset { 1 } else { shape[i - offset] }
}

/// Validate an axis against a rank.
pub fn check_axis(axis: usize, ndim: usize) -> Result<usize, GraphError> {
    if axis >= ndim {
        return Err(GraphError::InvalidAxis { axis, ndim });
    }
    Ok(axis)
}

/// Validate a set of reduction axes, returning them sorted and deduplicated.
/// An empty set means "all axes".
pub fn normalize_axes(axes: &[usize], ndim: usize) -> Result<Shape, GraphError> {
    if axes.is_empty() {
        return Ok((0..ndim).collect());
    }
    let mut out = Shape::new();
    for &axis in axes {
        check_axis(axis, ndim)?;
        if !out.contains(&axis) {
            out.push(axis);
        }
    }
    out.sort_unstable();
    Ok(out)
}

/// Shape after reducing `axes`, either dropping them or keeping size-1 dims.
pub fn reduced_shape(shape: &[usize], axes: &[usize], keep_dims: bool) -> Shape {
    shape
        .iter()
        .enumerate()
        .filter_map(|(i, &d)| {
            if axes.contains(&i) {
                keep_dims.then_some(1)
            } else {
                Some(d)
            }
        })
        .collect()
}

/// Validate that `perm` is a permutation of `0..ndim`.
pub fn validate_permutation(perm: &[usize], ndim: usize) -> Result<(), GraphError> {
    let invalid = || GraphError::InvalidPermutation {
        perm: perm.to_vec(),
        ndim,
    };
    if perm.len() != ndim {
        return Err(invalid());
    }
    let mut seen = vec![false; ndim];
    for &p in perm {
        if p >= ndim || seen[p] {
            return Err(invalid());
        }
        seen[p] = true;
    }
    Ok(())
}

/// Inverse of a permutation.
pub fn invert_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inv = vec![0; perm.len()];
    for (i, &p) in perm.iter().enumerate() {
        inv[p] = i;
    }
    inv
}
