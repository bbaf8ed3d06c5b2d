//! Runtime backend registry for selecting a numerical engine by name.
//!
//! Backend crates register a constructor under one or more names; the runtime resolves the
//! configured name once at startup and talks to the result through [`ErasedBackend`], so no
//! concrete backend type leaks into the core.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::spec::{
    BackendError, BackendResult, Instruction, PortableBackend, Program, TensorInit, TensorLiteral,
};

/// Type-erased backend handle that can be downcast to concrete backend tensor types.
pub type BackendHandle = Arc<dyn Any + Send + Sync>;

/// Factory function that creates a new backend instance.
pub type BackendConstructor = Box<dyn Fn() -> Arc<dyn ErasedBackend> + Send + Sync>;

/// Object-safe view of a [`PortableBackend`] working on erased handles.
pub trait ErasedBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    fn materialize(&self, init: TensorInit) -> BackendResult<BackendHandle>;

    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral>;

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[BackendHandle],
    ) -> BackendResult<BackendHandle>;

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>>;
}

/// Wrapper that implements ErasedBackend for any concrete PortableBackend.
struct BackendWrapper<B: PortableBackend> {
    inner: Arc<B>,
}

impl<B: PortableBackend + 'static> BackendWrapper<B> {
    fn downcast<'h>(&self, handle: &'h BackendHandle) -> BackendResult<&'h B::TensorHandle> {
        handle.downcast_ref::<B::TensorHandle>().ok_or_else(|| {
            BackendError::execution(format!(
                "handle type mismatch for backend {}",
                self.inner.backend_name()
            ))
        })
    }

    fn downcast_all(&self, handles: &[BackendHandle]) -> BackendResult<Vec<B::TensorHandle>> {
        handles
            .iter()
            .map(|handle| self.downcast(handle).cloned())
            .collect()
    }
}

impl<B: PortableBackend + 'static> ErasedBackend for BackendWrapper<B> {
    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<BackendHandle> {
        let handle = self.inner.materialize(init)?;
        Ok(Arc::new(handle) as BackendHandle)
    }

    fn to_literal(&self, handle: &BackendHandle) -> BackendResult<TensorLiteral> {
        let typed = self.downcast(handle)?;
        self.inner.to_literal(typed)
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[BackendHandle],
    ) -> BackendResult<BackendHandle> {
        let typed_inputs = self.downcast_all(inputs)?;
        let output = self.inner.execute_instruction(instruction, &typed_inputs)?;
        Ok(Arc::new(output) as BackendHandle)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[BackendHandle],
    ) -> BackendResult<Vec<BackendHandle>> {
        let typed_inputs = self.downcast_all(entry_inputs)?;
        let outputs = self.inner.run_program(program, &typed_inputs)?;
        Ok(outputs
            .into_iter()
            .map(|h| Arc::new(h) as BackendHandle)
            .collect())
    }
}

/// Erases a concrete backend so it can be stored in a runtime.
pub fn erase_backend<B: PortableBackend + 'static>(backend: B) -> Arc<dyn ErasedBackend> {
    Arc::new(BackendWrapper {
        inner: Arc::new(backend),
    })
}

/// Global backend registry mapping backend names to constructors.
struct BackendRegistry {
    backends: RwLock<BTreeMap<String, BackendConstructor>>,
}

impl BackendRegistry {
    fn new() -> Self {
        Self {
            backends: RwLock::new(BTreeMap::new()),
        }
    }

    fn register(&self, name: String, constructor: BackendConstructor) {
        self.backends.write().insert(name, constructor);
    }

    fn create(&self, name: &str) -> Option<Arc<dyn ErasedBackend>> {
        let registry = self.backends.read();
        let constructor = registry.get(name)?;
        Some(constructor())
    }

    fn list_backends(&self) -> Vec<String> {
        self.backends.read().keys().cloned().collect()
    }
}

static GLOBAL_REGISTRY: OnceLock<BackendRegistry> = OnceLock::new();

fn global_registry() -> &'static BackendRegistry {
    GLOBAL_REGISTRY.get_or_init(BackendRegistry::new)
}

/// Register a backend by name with a constructor function.
///
/// The constructor runs each time a runtime requests the backend. Registering the same name
/// twice replaces the previous constructor.
pub fn register_backend<F>(name: impl Into<String>, constructor: F)
where
    F: Fn() -> Arc<dyn ErasedBackend> + Send + Sync + 'static,
{
    global_registry().register(name.into(), Box::new(constructor));
}

/// Register a concrete PortableBackend implementation.
pub fn register_portable_backend<B, F>(name: impl Into<String>, constructor: F)
where
    B: PortableBackend + 'static,
    F: Fn() -> B + Send + Sync + 'static,
{
    register_backend(name, move || erase_backend(constructor()));
}

/// Create a backend instance by name, or `None` when nothing is registered under it.
pub fn create_backend(name: &str) -> Option<Arc<dyn ErasedBackend>> {
    global_registry().create(name)
}

/// Registered backend names in sorted order.
pub fn list_backends() -> Vec<String> {
    global_registry().list_backends()
}
