//! Shape and dtype inference shared by the functional layer.
//!
//! Everything here runs before an instruction is executed or recorded, so shape and dtype
//! errors are identical in eager and compiled execution.

use crate::backend::spec::{DType, Shape};
use crate::error::{DtypeError, ShapeError};

/// Numpy-style broadcast of two shapes, or `None` when they are incompatible.
pub fn get_broadcast_shape(lhs: &Shape, rhs: &Shape) -> Option<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = vec![0usize; rank];
    for (offset, slot) in dims.iter_mut().rev().enumerate() {
        let a = dim_from_right(lhs, offset);
        let b = dim_from_right(rhs, offset);
        *slot = match (a, b) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(Shape::new(dims))
}

fn dim_from_right(shape: &Shape, offset: usize) -> usize {
    let dims = shape.dims();
    if offset < dims.len() {
        dims[dims.len() - 1 - offset]
    } else {
        1
    }
}

pub(crate) fn broadcast_shapes(
    operation: &'static str,
    lhs: &Shape,
    rhs: &Shape,
) -> Result<Shape, ShapeError> {
    get_broadcast_shape(lhs, rhs).ok_or_else(|| ShapeError::Broadcast {
        operation,
        lhs: lhs.clone(),
        rhs: rhs.clone(),
    })
}

/// Checks that `from` can be broadcast to exactly `to`.
pub(crate) fn check_broadcast_to(
    operation: &'static str,
    from: &Shape,
    to: &Shape,
) -> Result<(), ShapeError> {
    match get_broadcast_shape(from, to) {
        Some(shape) if &shape == to => Ok(()),
        _ => Err(ShapeError::Broadcast {
            operation,
            lhs: from.clone(),
            rhs: to.clone(),
        }),
    }
}

/// Result dtype of an arithmetic op. Bool never participates in arithmetic.
pub(crate) fn promote(operation: &'static str, lhs: DType, rhs: DType) -> Result<DType, DtypeError> {
    for dtype in [lhs, rhs] {
        if dtype == DType::Bool {
            return Err(DtypeError::Unsupported { operation, dtype });
        }
    }
    Ok(match (lhs, rhs) {
        (a, b) if a == b => a,
        (DType::F64, _) | (_, DType::F64) => DType::F64,
        (DType::F32, _) | (_, DType::F32) => DType::F32,
        _ => DType::I64,
    })
}

/// Promotion that also accepts a pair of bools (comparisons, select).
pub(crate) fn promote_or_bool(
    operation: &'static str,
    lhs: DType,
    rhs: DType,
) -> Result<DType, DtypeError> {
    if lhs == DType::Bool && rhs == DType::Bool {
        return Ok(DType::Bool);
    }
    if lhs == DType::Bool || rhs == DType::Bool {
        return Err(DtypeError::Mismatch { operation, lhs, rhs });
    }
    promote(operation, lhs, rhs)
}

pub(crate) fn normalize_axis(
    operation: &'static str,
    axis: isize,
    rank: usize,
) -> Result<usize, ShapeError> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(ShapeError::InvalidAxis {
            operation,
            axis,
            rank,
        });
    }
    Ok(resolved as usize)
}

/// Sorted, unique, non-negative axes. An empty list means every axis.
pub(crate) fn normalize_axes(
    operation: &'static str,
    axes: &[isize],
    rank: usize,
) -> Result<Vec<usize>, ShapeError> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    let mut resolved = Vec::with_capacity(axes.len());
    for &axis in axes {
        let axis = normalize_axis(operation, axis, rank)?;
        if resolved.contains(&axis) {
            return Err(ShapeError::DuplicateAxis { operation, axis });
        }
        resolved.push(axis);
    }
    resolved.sort_unstable();
    Ok(resolved)
}

/// Shape after reducing `axes` out of `dims`.
pub(crate) fn reduced_shape(dims: &[usize], axes: &[usize], keepdims: bool) -> Shape {
    let mut out = Vec::with_capacity(dims.len());
    for (axis, &dim) in dims.iter().enumerate() {
        if axes.contains(&axis) {
            if keepdims {
                out.push(1);
            }
        } else {
            out.push(dim);
        }
    }
    Shape::new(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcasts_right_aligned() {
        let shape = get_broadcast_shape(&Shape::new([2, 3]), &Shape::new([3])).unwrap();
        assert_eq!(shape.dims(), &[2, 3]);
        let shape = get_broadcast_shape(&Shape::new([4, 1, 5]), &Shape::new([3, 1])).unwrap();
        assert_eq!(shape.dims(), &[4, 3, 5]);
        let shape = get_broadcast_shape(&Shape::scalar(), &Shape::new([2])).unwrap();
        assert_eq!(shape.dims(), &[2]);
    }

    #[test]
    fn incompatible_shapes_fail() {
        assert!(get_broadcast_shape(&Shape::new([2, 3]), &Shape::new([2])).is_none());
        let err = broadcast_shapes("add", &Shape::new([3]), &Shape::new([4])).unwrap_err();
        assert!(matches!(err, ShapeError::Broadcast { operation: "add", .. }));
    }

    #[test]
    fn broadcast_to_requires_exact_target() {
        check_broadcast_to("broadcast_to", &Shape::new([1, 3]), &Shape::new([2, 3])).unwrap();
        assert!(check_broadcast_to("broadcast_to", &Shape::new([2, 3]), &Shape::new([3])).is_err());
    }

    #[test]
    fn promotion_table() {
        assert_eq!(promote("add", DType::I32, DType::I64).unwrap(), DType::I64);
        assert_eq!(promote("add", DType::F32, DType::F64).unwrap(), DType::F64);
        assert_eq!(promote("add", DType::I64, DType::F32).unwrap(), DType::F32);
        assert_eq!(promote("add", DType::I32, DType::I32).unwrap(), DType::I32);
        assert!(promote("add", DType::Bool, DType::F32).is_err());
        assert_eq!(
            promote_or_bool("equal", DType::Bool, DType::Bool).unwrap(),
            DType::Bool
        );
        assert!(promote_or_bool("equal", DType::Bool, DType::I32).is_err());
    }

    #[test]
    fn axes_are_normalized() {
        assert_eq!(normalize_axes("sum", &[-1, 0], 3).unwrap(), vec![0, 2]);
        assert_eq!(normalize_axes("sum", &[], 2).unwrap(), vec![0, 1]);
        assert!(matches!(
            normalize_axes("sum", &[3], 3),
            Err(ShapeError::InvalidAxis { axis: 3, rank: 3, .. })
        ));
        assert!(matches!(
            normalize_axes("sum", &[1, -2], 3),
            Err(ShapeError::DuplicateAxis { axis: 1, .. })
        ));
        assert_eq!(reduced_shape(&[2, 3, 4], &[1], true).dims(), &[2, 1, 4]);
        assert_eq!(reduced_shape(&[2, 3, 4], &[0, 2], false).dims(), &[3]);
    }
}
