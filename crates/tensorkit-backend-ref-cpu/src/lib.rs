pub mod cpu;

pub use cpu::{
    matmul_dims, CpuKernelInterceptor, CpuPortableBackend, CpuTensor, GenericCpuBackend,
    NoopInterceptor, TensorData,
};

/// Register the reference CPU backend under the name `"cpu"`.
///
/// This function is called automatically via a static initializer, but can also
/// be called manually to ensure the backend is registered.
pub fn register_cpu_backend() {
    tensorkit::backend::registry::register_portable_backend("cpu", CpuPortableBackend::new);
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_CPU_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_cpu_backend();
    }
    register
};
