//! Seeded random generators.
//!
//! Generators take no tensor inputs; inside a compiled region they are recorded into the
//! active trace so replays draw the same values as the eager run.

use crate::backend::spec::{DType, Operation, RngSpec, Shape, TensorSpec};
use crate::error::{DtypeError, Result};
use crate::runtime::Runtime;
use crate::tensor::Tensor;

impl Runtime {
    fn float_spec(
        &self,
        operation: &'static str,
        shape: Shape,
        dtype: Option<DType>,
    ) -> Result<TensorSpec> {
        let dtype = dtype.unwrap_or_else(|| self.float_x());
        if !dtype.is_float() {
            return Err(DtypeError::Unsupported { operation, dtype }.into());
        }
        Ok(TensorSpec::new(dtype, shape))
    }

    /// Uniform samples in `[0, 1)`; `dtype` defaults to the configured float dtype.
    pub fn rand(&self, shape: impl Into<Shape>, dtype: Option<DType>, seed: u64) -> Result<Tensor> {
        let spec = self.float_spec("rng_uniform", shape.into(), dtype)?;
        self.apply(
            Operation::RngUniform(RngSpec {
                spec: spec.clone(),
                seed,
            }),
            &[],
            spec,
        )
    }

    /// Standard normal samples; `dtype` defaults to the configured float dtype.
    pub fn randn(&self, shape: impl Into<Shape>, dtype: Option<DType>, seed: u64) -> Result<Tensor> {
        let spec = self.float_spec("rng_normal", shape.into(), dtype)?;
        self.apply(
            Operation::RngNormal(RngSpec {
                spec: spec.clone(),
                seed,
            }),
            &[],
            spec,
        )
    }

    /// Uniform samples in `[low, high)`.
    pub fn uniform(
        &self,
        shape: impl Into<Shape>,
        low: f64,
        high: f64,
        dtype: Option<DType>,
        seed: u64,
    ) -> Result<Tensor> {
        let unit = self.rand(shape, dtype, seed)?;
        unit.mul_scalar(high - low)?.add_scalar(low)
    }
}
