use crate::backend::spec::{Operation, TensorSpec};
use crate::error::{Result, ShapeError};
use crate::tensor::Tensor;

use super::infer::promote;

impl Tensor {
    /// Matrix product of rank-2 `(m, k) x (k, n)` or batched rank-3
    /// `(b, m, k) x (b, k, n)` operands.
    pub fn matmul(&self, other: &Tensor) -> Result<Tensor> {
        let dtype = promote("matmul", self.dtype(), other.dtype())?;
        let lhs = self.dims();
        let rhs = other.dims();
        let out_dims = match (lhs, rhs) {
            ([m, k], [k2, n]) if k == k2 => vec![*m, *n],
            ([b, m, k], [b2, k2, n]) if b == b2 && k == k2 => vec![*b, *m, *n],
            _ => {
                return Err(ShapeError::incompatible(
                    "matmul",
                    format!(
                        "cannot multiply {} by {}",
                        self.shape(),
                        other.shape()
                    ),
                )
                .into())
            }
        };
        let lhs = self.cast(dtype)?;
        let rhs = other.cast(dtype)?;
        self.runtime().apply(
            Operation::Matmul,
            &[&lhs, &rhs],
            TensorSpec::new(dtype, out_dims),
        )
    }
}

/// Free-function form of [`Tensor::matmul`].
pub fn matmul(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    lhs.matmul(rhs)
}
