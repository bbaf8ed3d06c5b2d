//! Host-backed tensor used for literals, inputs and read-back.

use std::sync::Arc;

use rand::Rng;

use super::element::Element;
use crate::backend::spec::{DType, Shape, TensorLiteral, TensorSpec};
use crate::error::{DtypeError, Result, ShapeError};

/// Dense host tensor stored as little-endian bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    spec: TensorSpec,
    data: Arc<[u8]>,
}

impl HostTensor {
    /// Constructs a tensor from typed values, validating the length against the shape.
    pub fn from_vec<E: Element>(shape: impl Into<Shape>, values: Vec<E>) -> Result<Self> {
        let shape = shape.into();
        let expected = shape.element_count();
        if values.len() != expected {
            return Err(ShapeError::ElementCount {
                shape,
                expected,
                actual: values.len(),
            }
            .into());
        }
        let mut bytes = Vec::with_capacity(values.len() * E::DTYPE.size_in_bytes());
        for value in values {
            value.write_le(&mut bytes);
        }
        Ok(HostTensor {
            spec: TensorSpec::new(E::DTYPE, shape),
            data: Arc::from(bytes),
        })
    }

    pub fn scalar<E: Element>(value: E) -> Self {
        let mut bytes = Vec::with_capacity(E::DTYPE.size_in_bytes());
        value.write_le(&mut bytes);
        HostTensor {
            spec: TensorSpec::new(E::DTYPE, Shape::scalar()),
            data: Arc::from(bytes),
        }
    }

    /// Tensor of `spec` with every element set to `value`, converted to the dtype.
    pub fn full(spec: TensorSpec, value: f64) -> Self {
        Self::from_literal(TensorLiteral::filled(spec, value))
    }

    pub fn zeros(spec: TensorSpec) -> Self {
        Self::full(spec, 0.0)
    }

    pub fn ones(spec: TensorSpec) -> Self {
        Self::full(spec, 1.0)
    }

    /// Samples `N(0, std^2)` values with the Box-Muller transform.
    pub fn randn(shape: impl Into<Shape>, dtype: DType, std: f64, rng: &mut impl Rng) -> Self {
        let shape = shape.into();
        let len = shape.element_count();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Self::from_f64_values(TensorSpec::new(dtype, shape), &values)
    }

    fn from_f64_values(spec: TensorSpec, values: &[f64]) -> Self {
        let mut bytes = Vec::with_capacity(spec.byte_len());
        for &value in values {
            match spec.dtype {
                DType::F32 => (value as f32).write_le(&mut bytes),
                DType::F64 => value.write_le(&mut bytes),
                DType::I32 => (value as i32).write_le(&mut bytes),
                DType::I64 => (value as i64).write_le(&mut bytes),
                DType::Bool => (value != 0.0).write_le(&mut bytes),
            }
        }
        HostTensor {
            spec,
            data: Arc::from(bytes),
        }
    }

    pub fn from_literal(literal: TensorLiteral) -> Self {
        HostTensor {
            spec: literal.spec,
            data: literal.bytes,
        }
    }

    pub fn to_literal(&self) -> TensorLiteral {
        TensorLiteral::new(self.spec.clone(), Arc::clone(&self.data))
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn len(&self) -> usize {
        self.spec.element_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed copy of the payload; fails when `E` does not match the stored dtype.
    pub fn to_vec<E: Element>(&self) -> Result<Vec<E>> {
        if E::DTYPE != self.spec.dtype {
            return Err(DtypeError::Mismatch {
                operation: "to_vec",
                lhs: self.spec.dtype,
                rhs: E::DTYPE,
            }
            .into());
        }
        let width = E::DTYPE.size_in_bytes();
        Ok(self.data.chunks_exact(width).map(E::read_le).collect())
    }

    /// Payload widened to `f64`, whatever the dtype.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        let width = self.spec.dtype.size_in_bytes();
        self.data
            .chunks_exact(width)
            .map(|chunk| match self.spec.dtype {
                DType::F32 => f32::read_le(chunk).to_f64(),
                DType::F64 => f64::read_le(chunk),
                DType::I32 => i32::read_le(chunk).to_f64(),
                DType::I64 => i64::read_le(chunk).to_f64(),
                DType::Bool => bool::read_le(chunk).to_f64(),
            })
            .collect()
    }

    /// Number of NaN or infinite elements. Always zero for integer and bool tensors.
    pub fn count_non_finite(&self) -> usize {
        count_non_finite(&self.spec, &self.data)
    }
}

pub(crate) fn count_non_finite(spec: &TensorSpec, bytes: &[u8]) -> usize {
    match spec.dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .filter(|chunk| !f32::read_le(chunk).is_finite())
            .count(),
        DType::F64 => bytes
            .chunks_exact(8)
            .filter(|chunk| !f64::read_le(chunk).is_finite())
            .count(),
        DType::I32 | DType::I64 | DType::Bool => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn from_vec_checks_element_count() {
        let err = HostTensor::from_vec([2, 2], vec![1.0f32, 2.0, 3.0]).unwrap_err();
        assert!(matches!(
            err,
            crate::TensorKitError::Shape(ShapeError::ElementCount {
                expected: 4,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn typed_round_trip_and_dtype_check() {
        let host = HostTensor::from_vec([3], vec![1i64, -2, 3]).unwrap();
        assert_eq!(host.dtype(), DType::I64);
        assert_eq!(host.to_vec::<i64>().unwrap(), vec![1, -2, 3]);
        assert!(host.to_vec::<i32>().is_err());
        assert_eq!(host.to_f64_vec(), vec![1.0, -2.0, 3.0]);
    }

    #[test]
    fn counts_non_finite_values() {
        let host =
            HostTensor::from_vec([4], vec![1.0f32, f32::NAN, f32::INFINITY, -0.5]).unwrap();
        assert_eq!(host.count_non_finite(), 2);
        let ints = HostTensor::from_vec([2], vec![i32::MAX, i32::MIN]).unwrap();
        assert_eq!(ints.count_non_finite(), 0);
    }

    #[test]
    fn randn_is_seeded() {
        let a = HostTensor::randn([5], DType::F32, 1.0, &mut StdRng::seed_from_u64(7));
        let b = HostTensor::randn([5], DType::F32, 1.0, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
    }
}
