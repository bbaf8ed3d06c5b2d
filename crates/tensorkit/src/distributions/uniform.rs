use crate::backend::spec::{DType, Shape, TensorSpec};
use crate::error::{ConfigurationError, DtypeError, Result, ShapeError};
use crate::ops::{get_broadcast_shape, where_};
use crate::runtime::Runtime;
use crate::tensor::Tensor;

use super::LOG_ZERO_VALUE;

/// Uniform distribution `U[low, high)`.
///
/// Without bounds the distribution is `U[0, 1)`. Samples have shape
/// `[n_samples] + shape + broadcast(low, high)`.
#[derive(Debug, Clone)]
pub struct Uniform {
    runtime: Runtime,
    dtype: DType,
    shape: Vec<usize>,
    bounds: Option<(Tensor, Tensor)>,
    log_zero: f64,
    reparameterized: bool,
}

impl Uniform {
    /// `U[0, 1)` in the runtime's default float dtype.
    pub fn standard(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            dtype: runtime.float_x(),
            shape: Vec::new(),
            bounds: None,
            log_zero: LOG_ZERO_VALUE,
            reparameterized: true,
        }
    }

    /// Scalar bounds. `low < high` is always checked.
    pub fn from_floats(runtime: &Runtime, low: f64, high: f64) -> Result<Self> {
        if !(low < high) {
            return Err(ConfigurationError::InvalidArgument {
                argument: "low",
                detail: format!("`low` < `high` does not hold: low = {low}, high = {high}"),
            }
            .into());
        }
        let spec = TensorSpec::new(runtime.float_x(), Shape::scalar());
        let low = runtime.full(spec.clone(), low)?;
        let high = runtime.full(spec, high)?;
        Ok(Self::with_bounds(runtime, low, high))
    }

    /// Tensor bounds, broadcast against each other.
    ///
    /// With validation enabled, `low < high` is enforced through `log(high - low)`, which is
    /// finite exactly where the bounds are ordered. The validator rejects a non-finite result
    /// as soon as it is produced: immediately for concrete bounds, during replay for traced
    /// ones.
    pub fn new(low: &Tensor, high: &Tensor) -> Result<Self> {
        let runtime = low.runtime().clone();
        if !low.dtype().is_float() {
            return Err(DtypeError::Unsupported {
                operation: "uniform",
                dtype: low.dtype(),
            }
            .into());
        }
        if low.dtype() != high.dtype() {
            return Err(DtypeError::Mismatch {
                operation: "uniform",
                lhs: low.dtype(),
                rhs: high.dtype(),
            }
            .into());
        }
        if get_broadcast_shape(low.shape(), high.shape()).is_none() {
            return Err(ShapeError::Broadcast {
                operation: "uniform",
                lhs: low.shape().clone(),
                rhs: high.shape().clone(),
            }
            .into());
        }
        if runtime.validator().is_enabled() {
            bounds_guard(low, high)?;
        }
        Ok(Self::with_bounds(&runtime, low.clone(), high.clone()))
    }

    fn with_bounds(runtime: &Runtime, low: Tensor, high: Tensor) -> Self {
        Self {
            runtime: runtime.clone(),
            dtype: low.dtype(),
            shape: Vec::new(),
            bounds: Some((low, high)),
            log_zero: LOG_ZERO_VALUE,
            reparameterized: true,
        }
    }

    /// Prepends `shape` to every sample's value shape.
    pub fn with_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn with_log_zero(mut self, log_zero: f64) -> Self {
        self.log_zero = log_zero;
        self
    }

    /// Non-reparameterized samples are wrapped in `stop_gradient`.
    pub fn with_reparameterized(mut self, reparameterized: bool) -> Self {
        self.reparameterized = reparameterized;
        self
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn low(&self) -> Option<&Tensor> {
        self.bounds.as_ref().map(|(low, _)| low)
    }

    pub fn high(&self) -> Option<&Tensor> {
        self.bounds.as_ref().map(|(_, high)| high)
    }

    pub fn log_zero(&self) -> f64 {
        self.log_zero
    }

    pub fn value_shape(&self) -> Shape {
        let mut dims = self.shape.clone();
        if let Some((low, high)) = &self.bounds {
            if let Some(shape) = get_broadcast_shape(low.shape(), high.shape()) {
                dims.extend_from_slice(shape.dims());
            }
        }
        Shape::new(dims)
    }

    /// Draws samples with an explicit seed; `n_samples` adds a leading axis.
    pub fn sample(&self, n_samples: Option<usize>, seed: u64) -> Result<Tensor> {
        let mut dims = Vec::new();
        dims.extend(n_samples);
        dims.extend_from_slice(self.value_shape().dims());
        let mut samples = self.runtime.rand(dims, Some(self.dtype), seed)?;
        if let Some((low, high)) = &self.bounds {
            let scale = high.sub(low)?;
            samples = samples.mul(&scale)?.add(low)?;
        }
        if !self.reparameterized {
            samples = samples.stop_gradient()?;
        }
        Ok(samples)
    }

    /// Log density of `given`; values outside `[low, high]` get `log_zero`.
    pub fn log_prob(&self, given: &Tensor) -> Result<Tensor> {
        let scalar = TensorSpec::new(self.dtype, Shape::scalar());
        let (low, high, log_pdf) = match &self.bounds {
            Some((low, high)) => (low.clone(), high.clone(), high.sub(low)?.log()?.neg()?),
            None => (
                self.runtime.zeros(scalar.clone())?,
                self.runtime.ones(scalar.clone())?,
                self.runtime.zeros(scalar.clone())?,
            ),
        };
        let inside = low.less_equal(given)?.logical_and(&given.less_equal(&high)?)?;
        let log_zero = self.runtime.full(scalar, self.log_zero)?;
        where_(&inside, &log_pdf, &log_zero)?.broadcast_to(given.shape().clone())
    }
}

/// `log(high - low)`: `-inf` for equal bounds, NaN for reversed ones.
fn bounds_guard(low: &Tensor, high: &Tensor) -> Result<Tensor> {
    high.sub(low)?.log()
}
