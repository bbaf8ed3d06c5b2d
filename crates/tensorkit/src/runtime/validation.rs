//! NaN/Inf scanning of operation outputs.

use crate::backend::registry::{BackendHandle, ErasedBackend};
use crate::backend::spec::{TensorLiteral, TensorSpec};
use crate::error::{NumericValidationError, Result};
use crate::tensor::host::count_non_finite;

/// Checks every produced float tensor for non-finite values when enabled.
///
/// Values are never masked or corrected; a failing check only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validator {
    enabled: bool,
}

impl Validator {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn check(
        &self,
        backend: &dyn ErasedBackend,
        operation: &str,
        spec: &TensorSpec,
        handle: &BackendHandle,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if !spec.dtype.is_float() {
            return Ok(());
        }
        let literal = backend.to_literal(handle)?;
        self.check_literal(operation, &literal)
    }

    pub fn check_literal(&self, operation: &str, literal: &TensorLiteral) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let invalid = count_non_finite(&literal.spec, &literal.bytes);
        if invalid == 0 {
            return Ok(());
        }
        Err(NumericValidationError {
            operation: operation.to_string(),
            shape: literal.spec.shape.clone(),
            dtype: literal.spec.dtype,
            invalid,
            total: literal.spec.element_count(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::HostTensor;
    use crate::TensorKitError;

    #[test]
    fn disabled_validator_accepts_anything() {
        let host = HostTensor::from_vec([2], vec![f32::NAN, 1.0]).unwrap();
        Validator::new(false)
            .check_literal("exp", &host.to_literal())
            .unwrap();
    }

    #[test]
    fn reports_operation_shape_and_fraction() {
        let host = HostTensor::from_vec([2, 2], vec![1.0f64, f64::INFINITY, 2.0, 3.0]).unwrap();
        let err = Validator::new(true)
            .check_literal("add", &host.to_literal())
            .unwrap_err();
        let TensorKitError::NumericValidation(err) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(err.operation, "add");
        assert_eq!(err.shape.dims(), &[2, 2]);
        assert_eq!(err.invalid, 1);
        assert_eq!(err.total, 4);
        assert!((err.fraction() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn integer_tensors_never_fail() {
        let host = HostTensor::from_vec([2], vec![i32::MAX, 0]).unwrap();
        Validator::new(true)
            .check_literal("mul", &host.to_literal())
            .unwrap();
    }
}
