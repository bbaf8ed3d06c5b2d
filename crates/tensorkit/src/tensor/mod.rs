//! Tensor types: host copies and runtime-bound tensors.
//!
//! [`HostTensor`] owns plain bytes on the host. [`Tensor`] is bound to a
//! [`Runtime`](crate::runtime::Runtime) and is either backed by a backend handle or stands for
//! a value inside an active trace.

mod device;
pub mod element;
pub mod host;

pub use crate::backend::spec::{DType, Shape, TensorSpec};
pub use device::Tensor;
pub(crate) use device::TensorValue;
pub use element::Element;
pub use host::HostTensor;
