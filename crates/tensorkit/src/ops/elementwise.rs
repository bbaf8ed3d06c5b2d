//! Elementwise arithmetic, comparison and logical operators.

use crate::backend::spec::{
    BinaryOp, ComparisonOp, DType, LogicalOp, Operation, TensorSpec, UnaryOp,
};
use crate::error::{DtypeError, Result};
use crate::tensor::Tensor;

use super::infer::{broadcast_shapes, promote, promote_or_bool};

fn unary_label(op: UnaryOp) -> &'static str {
    Operation::Unary(op).label()
}

fn binary_label(op: BinaryOp) -> &'static str {
    Operation::Binary(op).label()
}

impl Tensor {
    fn unary(&self, op: UnaryOp) -> Result<Tensor> {
        let label = unary_label(op);
        if self.dtype() == DType::Bool {
            return Err(DtypeError::Unsupported {
                operation: label,
                dtype: DType::Bool,
            }
            .into());
        }
        let transcendental = !matches!(
            op,
            UnaryOp::Neg | UnaryOp::Abs | UnaryOp::Sign | UnaryOp::Square
        );
        let input = if transcendental && self.dtype().is_integer() {
            self.cast(DType::F64)?
        } else {
            self.clone()
        };
        let spec = input.spec().clone();
        self.runtime().apply(Operation::Unary(op), &[&input], spec)
    }

    pub fn neg(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Neg)
    }

    pub fn abs(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Abs)
    }

    pub fn sign(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Sign)
    }

    pub fn exp(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Log)
    }

    pub fn log1p(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Log1p)
    }

    pub fn sin(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Sin)
    }

    pub fn cos(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Cos)
    }

    pub fn tanh(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Tanh)
    }

    pub fn sqrt(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn square(&self) -> Result<Tensor> {
        self.unary(UnaryOp::Square)
    }

    /// Casts and broadcasts both operands to a common spec.
    fn align(
        &self,
        other: &Tensor,
        label: &'static str,
        dtype: DType,
    ) -> Result<(Tensor, Tensor, TensorSpec)> {
        let shape = broadcast_shapes(label, self.shape(), other.shape())?;
        let lhs = self.cast(dtype)?.broadcast_to(shape.clone())?;
        let rhs = other.cast(dtype)?.broadcast_to(shape.clone())?;
        Ok((lhs, rhs, TensorSpec::new(dtype, shape)))
    }

    fn binary(&self, other: &Tensor, op: BinaryOp) -> Result<Tensor> {
        let label = binary_label(op);
        broadcast_shapes(label, self.shape(), other.shape())?;
        let mut dtype = promote(label, self.dtype(), other.dtype())?;
        if op == BinaryOp::Div && dtype.is_integer() {
            dtype = DType::F64;
        }
        let (lhs, rhs, spec) = self.align(other, label, dtype)?;
        self.runtime()
            .apply(Operation::Binary(op), &[&lhs, &rhs], spec)
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Add)
    }

    pub fn sub(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Sub)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Mul)
    }

    /// True division; integer operands are computed in `float64`.
    pub fn div(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Div)
    }

    /// Division rounded toward negative infinity.
    pub fn floordiv(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::FloorDiv)
    }

    /// Remainder with the sign of the divisor.
    pub fn modulo(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Mod)
    }

    /// Remainder with the sign of the dividend.
    pub fn fmod(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::FMod)
    }

    pub fn pow(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Pow)
    }

    pub fn maximum(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Maximum)
    }

    pub fn minimum(&self, other: &Tensor) -> Result<Tensor> {
        self.binary(other, BinaryOp::Minimum)
    }

    /// Rank-0 concrete tensor of this tensor's dtype.
    pub fn scalar_like(&self, value: f64) -> Result<Tensor> {
        self.runtime()
            .full(TensorSpec::new(self.dtype(), crate::backend::spec::Shape::scalar()), value)
    }

    pub fn add_scalar(&self, value: f64) -> Result<Tensor> {
        self.add(&self.scalar_like(value)?)
    }

    pub fn mul_scalar(&self, value: f64) -> Result<Tensor> {
        self.mul(&self.scalar_like(value)?)
    }

    fn compare(&self, other: &Tensor, op: ComparisonOp) -> Result<Tensor> {
        let label = Operation::Compare(op).label();
        broadcast_shapes(label, self.shape(), other.shape())?;
        let dtype = promote_or_bool(label, self.dtype(), other.dtype())?;
        if dtype == DType::Bool && !matches!(op, ComparisonOp::Equal | ComparisonOp::NotEqual) {
            return Err(DtypeError::Unsupported {
                operation: label,
                dtype,
            }
            .into());
        }
        let (lhs, rhs, spec) = self.align(other, label, dtype)?;
        let output = TensorSpec::new(DType::Bool, spec.shape);
        self.runtime()
            .apply(Operation::Compare(op), &[&lhs, &rhs], output)
    }

    pub fn less(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::Less)
    }

    pub fn less_equal(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::LessEqual)
    }

    pub fn equal(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::Equal)
    }

    pub fn not_equal(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::NotEqual)
    }

    pub fn greater(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::Greater)
    }

    pub fn greater_equal(&self, other: &Tensor) -> Result<Tensor> {
        self.compare(other, ComparisonOp::GreaterEqual)
    }

    fn logical(&self, other: &Tensor, op: LogicalOp) -> Result<Tensor> {
        let label = Operation::Logical(op).label();
        broadcast_shapes(label, self.shape(), other.shape())?;
        for dtype in [self.dtype(), other.dtype()] {
            if dtype != DType::Bool {
                return Err(DtypeError::Unsupported {
                    operation: label,
                    dtype,
                }
                .into());
            }
        }
        let (lhs, rhs, spec) = self.align(other, label, DType::Bool)?;
        self.runtime()
            .apply(Operation::Logical(op), &[&lhs, &rhs], spec)
    }

    pub fn logical_and(&self, other: &Tensor) -> Result<Tensor> {
        self.logical(other, LogicalOp::And)
    }

    pub fn logical_or(&self, other: &Tensor) -> Result<Tensor> {
        self.logical(other, LogicalOp::Or)
    }

    pub fn logical_xor(&self, other: &Tensor) -> Result<Tensor> {
        self.logical(other, LogicalOp::Xor)
    }

    pub fn logical_not(&self) -> Result<Tensor> {
        if self.dtype() != DType::Bool {
            return Err(DtypeError::Unsupported {
                operation: "logical_not",
                dtype: self.dtype(),
            }
            .into());
        }
        let spec = self.spec().clone();
        self.runtime().apply(Operation::Not, &[self], spec)
    }
}

/// Elementwise `condition ? on_true : on_false` with broadcasting.
pub fn where_(condition: &Tensor, on_true: &Tensor, on_false: &Tensor) -> Result<Tensor> {
    if condition.dtype() != DType::Bool {
        return Err(DtypeError::Unsupported {
            operation: "select",
            dtype: condition.dtype(),
        }
        .into());
    }
    let values_shape = broadcast_shapes("select", on_true.shape(), on_false.shape())?;
    let shape = broadcast_shapes("select", condition.shape(), &values_shape)?;
    let dtype = promote_or_bool("select", on_true.dtype(), on_false.dtype())?;
    let condition = condition.broadcast_to(shape.clone())?;
    let on_true = on_true.cast(dtype)?.broadcast_to(shape.clone())?;
    let on_false = on_false.cast(dtype)?.broadcast_to(shape.clone())?;
    condition.runtime().apply(
        Operation::Select,
        &[&condition, &on_true, &on_false],
        TensorSpec::new(dtype, shape),
    )
}
