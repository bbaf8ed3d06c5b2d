//! Functional operator layer.
//!
//! Operators are methods on [`Tensor`](crate::tensor::Tensor) plus a few free functions. Each
//! one infers its output spec, inserts explicit casts and broadcasts, and hands a primitive
//! to the runtime dispatcher.

mod dispatch;
pub mod elementwise;
pub mod infer;
pub mod linalg;
pub mod random;
pub mod reduce;
pub mod shape;

pub use elementwise::where_;
pub use infer::get_broadcast_shape;
pub use linalg::matmul;
pub use shape::concat;
