//! Runtime-bound tensor.

use std::fmt;
use std::sync::Arc;

use super::{Element, HostTensor};
use crate::backend::registry::BackendHandle;
use crate::backend::spec::{DType, Shape, TensorSpec, ValueId};
use crate::error::{DtypeError, Result, ShapeError, TraceError};
use crate::jit::tracer::TraceGraph;
use crate::runtime::Runtime;

/// Tensor bound to a runtime.
///
/// The tensor spec is fixed at creation. Clones share the underlying value; in-place operations
/// replace the value held by one tensor without touching its clones.
#[derive(Clone)]
pub struct Tensor {
    runtime: Runtime,
    spec: TensorSpec,
    value: TensorValue,
}

#[derive(Clone)]
pub(crate) enum TensorValue {
    Ready(BackendHandle),
    Traced { graph: Arc<TraceGraph>, id: ValueId },
}

impl Tensor {
    pub(crate) fn ready(runtime: Runtime, spec: TensorSpec, handle: BackendHandle) -> Self {
        Tensor {
            runtime,
            spec,
            value: TensorValue::Ready(handle),
        }
    }

    pub(crate) fn traced(
        runtime: Runtime,
        spec: TensorSpec,
        graph: Arc<TraceGraph>,
        id: ValueId,
    ) -> Self {
        Tensor {
            runtime,
            spec,
            value: TensorValue::Traced { graph, id },
        }
    }

    pub(crate) fn value(&self) -> &TensorValue {
        &self.value
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn dtype(&self) -> DType {
        self.spec.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.spec.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.spec.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.spec.shape.rank()
    }

    pub fn element_count(&self) -> usize {
        self.spec.element_count()
    }

    /// Whether this tensor is a placeholder inside a trace.
    pub fn is_traced(&self) -> bool {
        matches!(self.value, TensorValue::Traced { .. })
    }

    /// Backend handle of a concrete tensor; traced tensors have none.
    pub(crate) fn handle(&self, operation: &'static str) -> Result<&BackendHandle> {
        match &self.value {
            TensorValue::Ready(handle) => Ok(handle),
            TensorValue::Traced { .. } => {
                Err(TraceError::ConcretizationRequired { operation }.into())
            }
        }
    }

    /// Copies the tensor back to the host.
    pub fn to_host(&self) -> Result<HostTensor> {
        let handle = self.handle("to_host")?;
        let literal = self.runtime.read_literal(handle)?;
        Ok(HostTensor::from_literal(literal))
    }

    pub fn to_vec<E: Element>(&self) -> Result<Vec<E>> {
        self.to_host()?.to_vec()
    }

    /// Value of a single-element tensor, widened to `f64`.
    pub fn item(&self) -> Result<f64> {
        self.handle("item")?;
        if self.element_count() != 1 {
            return Err(ShapeError::incompatible(
                "item",
                format!("expected a single element, got shape {}", self.shape()),
            )
            .into());
        }
        Ok(self.to_host()?.to_f64_vec()[0])
    }

    /// Replaces this tensor's value with `value`, which must have the same spec.
    pub fn assign_(&mut self, value: &Tensor) -> Result<()> {
        self.replace_with("assign_", value.clone())
    }

    pub fn add_(&mut self, other: &Tensor) -> Result<()> {
        let result = self.add(other)?;
        self.replace_with("add_", result)
    }

    pub fn sub_(&mut self, other: &Tensor) -> Result<()> {
        let result = self.sub(other)?;
        self.replace_with("sub_", result)
    }

    pub fn mul_(&mut self, other: &Tensor) -> Result<()> {
        let result = self.mul(other)?;
        self.replace_with("mul_", result)
    }

    pub fn div_(&mut self, other: &Tensor) -> Result<()> {
        let result = self.div(other)?;
        self.replace_with("div_", result)
    }

    fn replace_with(&mut self, operation: &'static str, result: Tensor) -> Result<()> {
        if !self.runtime.same_runtime(&result.runtime) {
            return Err(crate::backend::spec::BackendError::execution(format!(
                "{operation}: tensor belongs to a different runtime"
            ))
            .into());
        }
        if result.shape() != self.shape() {
            return Err(ShapeError::incompatible(
                operation,
                format!(
                    "result shape {} differs from target shape {}",
                    result.shape(),
                    self.shape()
                ),
            )
            .into());
        }
        if result.dtype() != self.dtype() {
            return Err(DtypeError::Mismatch {
                operation,
                lhs: self.dtype(),
                rhs: result.dtype(),
            }
            .into());
        }
        self.value = result.value;
        Ok(())
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Tensor");
        debug.field("spec", &self.spec.to_string());
        match &self.value {
            TensorValue::Ready(_) => debug.field("value", &"ready"),
            TensorValue::Traced { graph, id } => {
                debug.field("trace", &graph.id()).field("value", id)
            }
        };
        debug.finish()
    }
}
