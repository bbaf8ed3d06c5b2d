//! Error taxonomy shared by every public entry point.
//!
//! Each failure class has its own type so callers can match on the class they care about,
//! while [`TensorKitError`] unifies them for `?` propagation.

use thiserror::Error;

use crate::backend::spec::{BackendError, DType, Shape};
use crate::env::JitPolicy;
use crate::runtime::ExecutionMode;

/// Invalid or unknown configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("unknown backend '{name}' (available: {})", .available.join(", "))]
    UnknownBackend {
        name: String,
        available: Vec<String>,
    },
    #[error("invalid value '{value}' for {variable}: expected {expected}")]
    InvalidValue {
        variable: String,
        value: String,
        expected: &'static str,
    },
    #[error("invalid argument `{argument}`: {detail}")]
    InvalidArgument {
        argument: &'static str,
        detail: String,
    },
}

/// Incompatible shapes or axes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{operation}: shapes {lhs} and {rhs} are not broadcast-compatible")]
    Broadcast {
        operation: &'static str,
        lhs: Shape,
        rhs: Shape,
    },
    #[error("{operation}: axis {axis} is out of range for rank {rank}")]
    InvalidAxis {
        operation: &'static str,
        axis: isize,
        rank: usize,
    },
    #[error("{operation}: axis {axis} appears more than once")]
    DuplicateAxis { operation: &'static str, axis: usize },
    #[error("expected {expected} elements for shape {shape}, got {actual}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        actual: usize,
    },
    #[error("{operation}: {detail}")]
    Incompatible {
        operation: &'static str,
        detail: String,
    },
}

impl ShapeError {
    pub(crate) fn incompatible(operation: &'static str, detail: impl Into<String>) -> Self {
        ShapeError::Incompatible {
            operation,
            detail: detail.into(),
        }
    }
}

/// Unsupported or mismatched element types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DtypeError {
    #[error("{operation} does not support dtype {dtype}")]
    Unsupported {
        operation: &'static str,
        dtype: DType,
    },
    #[error("{operation}: incompatible dtypes {lhs} and {rhs}")]
    Mismatch {
        operation: &'static str,
        lhs: DType,
        rhs: DType,
    },
}

/// Failures while tracing or replaying a compiled region.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    #[error("{operation} needs a concrete value, which is unavailable while tracing")]
    ConcretizationRequired { operation: &'static str },
    #[error("tensor belongs to a trace that is not active here")]
    ForeignTrace,
    #[error("region '{region}' was redefined; its cached traces were discarded")]
    SourceChanged { region: String },
    #[error("{operation} is not differentiable")]
    NotDifferentiable { operation: &'static str },
    #[error("region '{region}': {detail}")]
    InvalidRegion { region: String, detail: String },
}

/// Rejected execution mode changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModeTransitionError {
    #[error("cannot switch from {from} to {to} while {in_flight} compiled region call(s) are in flight")]
    RegionInFlight {
        from: ExecutionMode,
        to: ExecutionMode,
        in_flight: usize,
    },
    #[error("execution mode is pinned by jit policy {policy}; cannot switch to {requested}")]
    Pinned {
        policy: JitPolicy,
        requested: ExecutionMode,
    },
}

/// A produced tensor contained NaN or infinite values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} produced {invalid} non-finite value(s) out of {total} in a {dtype}{shape} tensor")]
pub struct NumericValidationError {
    pub operation: String,
    pub shape: Shape,
    pub dtype: DType,
    pub invalid: usize,
    pub total: usize,
}

impl NumericValidationError {
    /// Share of elements that were NaN or infinite.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.invalid as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TensorKitError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Dtype(#[from] DtypeError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    ModeTransition(#[from] ModeTransitionError),
    #[error(transparent)]
    NumericValidation(#[from] NumericValidationError),
}

/// Coarse error class, used when comparing outcomes across configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Shape,
    Dtype,
    Backend,
    Trace,
    ModeTransition,
    NumericValidation,
}

impl TensorKitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TensorKitError::Configuration(_) => ErrorKind::Configuration,
            TensorKitError::Shape(_) => ErrorKind::Shape,
            TensorKitError::Dtype(_) => ErrorKind::Dtype,
            TensorKitError::Backend(_) => ErrorKind::Backend,
            TensorKitError::Trace(_) => ErrorKind::Trace,
            TensorKitError::ModeTransition(_) => ErrorKind::ModeTransition,
            TensorKitError::NumericValidation(_) => ErrorKind::NumericValidation,
        }
    }
}

pub type Result<T> = std::result::Result<T, TensorKitError>;
