//! Reductions.

use crate::backend::spec::{DType, Operation, ReduceKind, ReduceSpec, TensorSpec};
use crate::error::{DtypeError, Result};
use crate::tensor::Tensor;

use super::infer::{normalize_axes, reduced_shape};

impl Tensor {
    fn reduce(&self, kind: ReduceKind, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let label = Operation::Reduce(ReduceSpec {
            kind,
            axes: Vec::new(),
            keepdims,
        })
        .label();
        let logical = matches!(kind, ReduceKind::All | ReduceKind::Any);
        let input = if logical {
            if self.dtype() == DType::Bool {
                self.clone()
            } else {
                self.not_equal(&self.scalar_like(0.0)?)?
            }
        } else if self.dtype() == DType::Bool {
            return Err(DtypeError::Unsupported {
                operation: label,
                dtype: DType::Bool,
            }
            .into());
        } else {
            self.clone()
        };
        let axes = normalize_axes(label, axes, input.rank())?;
        let shape = reduced_shape(input.dims(), &axes, keepdims);
        let spec = TensorSpec::new(input.dtype(), shape);
        self.runtime().apply(
            Operation::Reduce(ReduceSpec {
                kind,
                axes,
                keepdims,
            }),
            &[&input],
            spec,
        )
    }

    /// Sum over `axes` (negative axes count from the end; empty means all axes).
    pub fn reduce_sum(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::Sum, axes, keepdims)
    }

    pub fn reduce_prod(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::Prod, axes, keepdims)
    }

    pub fn reduce_max(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::Max, axes, keepdims)
    }

    pub fn reduce_min(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::Min, axes, keepdims)
    }

    /// Arithmetic mean; integer inputs are averaged in `float64`.
    pub fn reduce_mean(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        let input = if self.dtype().is_integer() {
            self.cast(DType::F64)?
        } else {
            self.clone()
        };
        let resolved = normalize_axes("reduce_mean", axes, input.rank())?;
        let count: usize = resolved.iter().map(|&axis| input.dims()[axis]).product();
        let sum = input.reduce_sum(axes, keepdims)?;
        sum.div(&sum.scalar_like(count as f64)?)
    }

    pub fn reduce_all(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::All, axes, keepdims)
    }

    pub fn reduce_any(&self, axes: &[isize], keepdims: bool) -> Result<Tensor> {
        self.reduce(ReduceKind::Any, axes, keepdims)
    }

    /// Whether every element is true (non-zero). Needs a concrete value.
    pub fn is_all(&self) -> Result<bool> {
        self.handle("is_all")?;
        Ok(self.reduce_all(&[], false)?.item()? != 0.0)
    }

    /// Whether any element is true (non-zero). Needs a concrete value.
    pub fn is_any(&self) -> Result<bool> {
        self.handle("is_any")?;
        Ok(self.reduce_any(&[], false)?.item()? != 0.0)
    }
}
