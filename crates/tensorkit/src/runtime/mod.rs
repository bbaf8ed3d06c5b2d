//! Runtime: the explicit owner of configuration, backend, mode controller and trace cache.
//!
//! Every tensor is bound to the runtime that created it. A runtime is cheap to clone and
//! immutable apart from the execution mode default and the trace cache; constructing a fresh
//! runtime is the way to start from a clean state.

pub mod mode;
pub mod validation;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use mode::{ExecutionMode, ExecutionModeController, RegionGuard};
pub use validation::Validator;

use crate::backend::registry::{self, BackendHandle, ErasedBackend};
use crate::backend::spec::{DType, Shape, TensorInit, TensorLiteral, TensorSpec};
use crate::env::RuntimeConfig;
use crate::error::{ConfigurationError, Result};
use crate::jit::{TraceCache, TraceSink, TraceStats};
use crate::tensor::{Element, HostTensor, Tensor};

static RUNTIME_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    id: u64,
    config: RuntimeConfig,
    backend: Arc<dyn ErasedBackend>,
    validator: Validator,
    controller: ExecutionModeController,
    cache: TraceCache,
}

impl Runtime {
    /// Builds a runtime for `config`, resolving the backend by name in the registry.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let backend = registry::create_backend(&config.backend).ok_or_else(|| {
            ConfigurationError::UnknownBackend {
                name: config.backend.clone(),
                available: registry::list_backends(),
            }
        })?;
        Ok(Self::with_backend(config, backend))
    }

    /// Builds a runtime from the `TENSORKIT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(RuntimeConfig::from_env()?)
    }

    /// Builds a runtime around an already constructed backend; `config.backend` is kept as
    /// a label only.
    pub fn with_backend(config: RuntimeConfig, backend: Arc<dyn ErasedBackend>) -> Self {
        let id = RUNTIME_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            runtime = id,
            backend = backend.backend_name(),
            jit = %config.jit,
            validate = config.validate_tensors,
            float_x = %config.float_x,
            "runtime created"
        );
        Runtime {
            inner: Arc::new(RuntimeInner {
                id,
                validator: Validator::new(config.validate_tensors),
                controller: ExecutionModeController::new(config.jit),
                cache: TraceCache::new(),
                config,
                backend,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn backend(&self) -> &Arc<dyn ErasedBackend> {
        &self.inner.backend
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.backend_name()
    }

    pub fn validator(&self) -> Validator {
        self.inner.validator
    }

    pub fn controller(&self) -> &ExecutionModeController {
        &self.inner.controller
    }

    /// Current default execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.inner.controller.mode()
    }

    /// Changes the default execution mode; see [`ExecutionModeController::transition`].
    pub fn transition(&self, to: ExecutionMode) -> Result<()> {
        Ok(self.inner.controller.transition(to)?)
    }

    pub fn float_x(&self) -> DType {
        self.inner.config.float_x
    }

    pub fn trace_cache(&self) -> &TraceCache {
        &self.inner.cache
    }

    pub fn trace_stats(&self) -> TraceStats {
        self.inner.cache.stats()
    }

    pub fn set_trace_sink(&self, sink: Option<Arc<dyn TraceSink>>) {
        self.inner.cache.set_sink(sink);
    }

    pub fn same_runtime(&self, other: &Runtime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Copies a host tensor into backend memory.
    pub fn from_host(&self, host: &HostTensor) -> Result<Tensor> {
        self.from_literal(host.to_literal())
    }

    pub(crate) fn from_literal(&self, literal: TensorLiteral) -> Result<Tensor> {
        let spec = literal.spec.clone();
        let handle = self.inner.backend.materialize(TensorInit::Literal(literal))?;
        Ok(Tensor::ready(self.clone(), spec, handle))
    }

    pub fn tensor<E: Element>(&self, shape: impl Into<Shape>, values: Vec<E>) -> Result<Tensor> {
        self.from_host(&HostTensor::from_vec(shape, values)?)
    }

    pub fn scalar<E: Element>(&self, value: E) -> Result<Tensor> {
        self.from_host(&HostTensor::scalar(value))
    }

    /// Tensor of the default float dtype built from `f64` values.
    pub fn floats(&self, shape: impl Into<Shape>, values: Vec<f64>) -> Result<Tensor> {
        let host = HostTensor::from_vec(shape, values)?;
        match self.float_x() {
            DType::F64 => self.from_host(&host),
            _ => {
                let narrowed = host.to_vec::<f64>()?.into_iter().map(|v| v as f32).collect();
                self.tensor(host.shape().clone(), narrowed)
            }
        }
    }

    pub fn full(&self, spec: TensorSpec, value: f64) -> Result<Tensor> {
        self.from_literal(TensorLiteral::filled(spec, value))
    }

    pub fn zeros(&self, spec: TensorSpec) -> Result<Tensor> {
        self.full(spec, 0.0)
    }

    pub fn ones(&self, spec: TensorSpec) -> Result<Tensor> {
        self.full(spec, 1.0)
    }

    pub(crate) fn read_literal(&self, handle: &BackendHandle) -> Result<TensorLiteral> {
        Ok(self.inner.backend.to_literal(handle)?)
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("backend", &self.backend_name())
            .field("config", &self.inner.config)
            .field("mode", &self.mode())
            .finish()
    }
}
