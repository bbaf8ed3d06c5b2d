//! Shape manipulation, casting and gradient stopping.

use crate::backend::spec::{
    BroadcastToSpec, CastSpec, ConcatSpec, DType, Operation, ReshapeSpec, Shape, SliceSpec,
    TensorSpec, TransposeSpec,
};
use crate::error::{Result, ShapeError};
use crate::tensor::Tensor;

use super::infer::{check_broadcast_to, normalize_axes, normalize_axis, promote_or_bool};

impl Tensor {
    /// Converts to `dtype`; a no-op when the dtype already matches.
    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        if self.dtype() == dtype {
            return Ok(self.clone());
        }
        let spec = TensorSpec::new(dtype, self.shape().clone());
        self.runtime()
            .apply(Operation::Cast(CastSpec { dtype }), &[self], spec)
    }

    /// Broadcasts to exactly `shape`; a no-op when the shape already matches.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        if self.shape() == &shape {
            return Ok(self.clone());
        }
        check_broadcast_to("broadcast_to", self.shape(), &shape)?;
        let spec = TensorSpec::new(self.dtype(), shape.clone());
        self.runtime().apply(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape,
            }),
            &[self],
            spec,
        )
    }

    /// Reshapes to `dims`, where at most one entry may be `-1`.
    pub fn reshape(&self, dims: &[isize]) -> Result<Tensor> {
        let shape = resolve_reshape(self.shape(), dims)?;
        self.reshape_to(shape)
    }

    pub(crate) fn reshape_to(&self, shape: Shape) -> Result<Tensor> {
        if shape.element_count() != self.element_count() {
            return Err(ShapeError::incompatible(
                "reshape",
                format!("cannot reshape {} into {}", self.shape(), shape),
            )
            .into());
        }
        if self.shape() == &shape {
            return Ok(self.clone());
        }
        let spec = TensorSpec::new(self.dtype(), shape.clone());
        self.runtime().apply(
            Operation::Reshape(ReshapeSpec { new_shape: shape }),
            &[self],
            spec,
        )
    }

    /// Removes size-1 axes; all of them when `axes` is empty.
    pub fn squeeze(&self, axes: &[isize]) -> Result<Tensor> {
        let dims = self.dims();
        let targets: Vec<usize> = if axes.is_empty() {
            (0..dims.len()).filter(|&axis| dims[axis] == 1).collect()
        } else {
            normalize_axes("squeeze", axes, dims.len())?
        };
        for &axis in &targets {
            if dims[axis] != 1 {
                return Err(ShapeError::incompatible(
                    "squeeze",
                    format!("axis {axis} of shape {} has size {}", self.shape(), dims[axis]),
                )
                .into());
            }
        }
        let kept: Vec<usize> = dims
            .iter()
            .enumerate()
            .filter(|(axis, _)| !targets.contains(axis))
            .map(|(_, &dim)| dim)
            .collect();
        self.reshape_to(Shape::new(kept))
    }

    /// Inserts a size-1 axis at `axis` (counted in the output rank).
    pub fn expand_dims(&self, axis: isize) -> Result<Tensor> {
        let axis = normalize_axis("expand_dims", axis, self.rank() + 1)?;
        let mut dims = self.dims().to_vec();
        dims.insert(axis, 1);
        self.reshape_to(Shape::new(dims))
    }

    /// Permutes axes; reverses them when `perm` is `None`.
    pub fn transpose(&self, perm: Option<&[usize]>) -> Result<Tensor> {
        let rank = self.rank();
        let perm: Vec<usize> = match perm {
            Some(perm) => perm.to_vec(),
            None => (0..rank).rev().collect(),
        };
        let mut seen = vec![false; rank];
        if perm.len() != rank {
            return Err(ShapeError::incompatible(
                "transpose",
                format!("permutation {perm:?} does not match rank {rank}"),
            )
            .into());
        }
        for &axis in &perm {
            if axis >= rank || seen[axis] {
                return Err(ShapeError::incompatible(
                    "transpose",
                    format!("{perm:?} is not a permutation of 0..{rank}"),
                )
                .into());
            }
            seen[axis] = true;
        }
        let dims: Vec<usize> = perm.iter().map(|&axis| self.dims()[axis]).collect();
        let spec = TensorSpec::new(self.dtype(), dims);
        self.runtime()
            .apply(Operation::Transpose(TransposeSpec { perm }), &[self], spec)
    }

    /// Static slice of `sizes` elements starting at `starts` on every axis.
    pub fn slice(&self, starts: &[usize], sizes: &[usize]) -> Result<Tensor> {
        let dims = self.dims();
        if starts.len() != dims.len() || sizes.len() != dims.len() {
            return Err(ShapeError::incompatible(
                "slice",
                format!("expected {} starts and sizes", dims.len()),
            )
            .into());
        }
        for axis in 0..dims.len() {
            if starts[axis] + sizes[axis] > dims[axis] {
                return Err(ShapeError::incompatible(
                    "slice",
                    format!(
                        "axis {axis}: range {}..{} exceeds dimension {}",
                        starts[axis],
                        starts[axis] + sizes[axis],
                        dims[axis]
                    ),
                )
                .into());
            }
        }
        let spec = TensorSpec::new(self.dtype(), sizes.to_vec());
        self.runtime().apply(
            Operation::Slice(SliceSpec {
                starts: starts.to_vec(),
                sizes: sizes.to_vec(),
            }),
            &[self],
            spec,
        )
    }

    /// Identity whose result receives no gradient.
    pub fn stop_gradient(&self) -> Result<Tensor> {
        let spec = self.spec().clone();
        self.runtime().apply(Operation::StopGradient, &[self], spec)
    }
}

fn resolve_reshape(current: &Shape, dims: &[isize]) -> Result<Shape> {
    let mut inferred = None;
    let mut known = 1usize;
    for (idx, &dim) in dims.iter().enumerate() {
        match dim {
            -1 if inferred.is_none() => inferred = Some(idx),
            d if d >= 0 => known *= d as usize,
            _ => {
                return Err(ShapeError::incompatible(
                    "reshape",
                    format!("invalid target dims {dims:?}"),
                )
                .into())
            }
        }
    }
    let total = current.element_count();
    let mut resolved: Vec<usize> = dims.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(idx) = inferred {
        if known == 0 || total % known != 0 {
            return Err(ShapeError::incompatible(
                "reshape",
                format!("cannot reshape {current} into {dims:?}"),
            )
            .into());
        }
        resolved[idx] = total / known;
    }
    Ok(Shape::new(resolved))
}

/// Joins tensors along `axis`, promoting dtypes.
pub fn concat(tensors: &[Tensor], axis: isize) -> Result<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| ShapeError::incompatible("concat", "expected at least one tensor"))?;
    let rank = first.rank();
    let axis = normalize_axis("concat", axis, rank)?;
    let mut dtype = first.dtype();
    let mut out_dims = first.dims().to_vec();
    out_dims[axis] = 0;
    for tensor in tensors {
        if tensor.rank() != rank {
            return Err(ShapeError::incompatible(
                "concat",
                format!("rank {} differs from {rank}", tensor.rank()),
            )
            .into());
        }
        for (idx, (&dim, &expected)) in tensor.dims().iter().zip(first.dims()).enumerate() {
            if idx != axis && dim != expected {
                return Err(ShapeError::incompatible(
                    "concat",
                    format!("shapes {} and {} differ off axis {axis}", tensor.shape(), first.shape()),
                )
                .into());
            }
        }
        out_dims[axis] += tensor.dims()[axis];
        dtype = promote_or_bool("concat", dtype, tensor.dtype())?;
    }
    let cast = tensors
        .iter()
        .map(|tensor| tensor.cast(dtype))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Tensor> = cast.iter().collect();
    first.runtime().apply(
        Operation::Concat(ConcatSpec { axis }),
        &refs,
        TensorSpec::new(dtype, out_dims),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reshape_infers_single_wildcard() {
        let shape = resolve_reshape(&Shape::new([2, 3, 4]), &[4, -1]).unwrap();
        assert_eq!(shape.dims(), &[4, 6]);
        assert!(resolve_reshape(&Shape::new([2, 3]), &[-1, -1]).is_err());
        assert!(resolve_reshape(&Shape::new([2, 3]), &[4, -1]).is_err());
    }
}
