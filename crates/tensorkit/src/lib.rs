pub mod backend;
pub mod distributions;
pub mod env;
pub mod error;
pub mod jit;
pub mod logging;
pub mod ops;
pub mod runtime;
pub mod tensor;

pub use backend::spec::PortableBackend;
pub use env::{JitPolicy, RuntimeConfig};
pub use error::{
    ConfigurationError, DtypeError, ErrorKind, ModeTransitionError, NumericValidationError,
    Result, ShapeError, TensorKitError, TraceError,
};
pub use jit::{jit, CompiledRegion};
pub use runtime::{ExecutionMode, Runtime};
pub use tensor::{DType, HostTensor, Shape, Tensor, TensorSpec};
