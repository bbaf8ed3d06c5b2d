//! Backend adapter: the portable operation contract and the registry of engines.

pub mod hashing;
pub mod registry;
pub mod spec;

pub use registry::{BackendHandle, ErasedBackend};
pub use spec::PortableBackend;
