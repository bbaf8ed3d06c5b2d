//! Single entry point through which every primitive reaches a backend or a trace.

use std::sync::Arc;

use crate::backend::spec::{BackendError, Instruction, Operand, Operation, TensorSpec, ValueId};
use crate::error::{Result, TraceError};
use crate::jit::tracer::{self, TraceGraph};
use crate::runtime::Runtime;
use crate::tensor::{Tensor, TensorValue};

impl Runtime {
    /// Applies a primitive whose output spec has already been inferred.
    ///
    /// When any input is traced (or, for generators without inputs, when a trace is active on
    /// this thread) the primitive is recorded and concrete inputs become literal operands.
    /// Otherwise it executes immediately and the output is validated.
    pub(crate) fn apply(
        &self,
        op: Operation,
        inputs: &[&Tensor],
        output: TensorSpec,
    ) -> Result<Tensor> {
        for input in inputs {
            if !input.runtime().same_runtime(self) {
                return Err(BackendError::execution(format!(
                    "{}: tensor belongs to a different runtime",
                    op.label()
                ))
                .into());
            }
        }

        match self.recording_trace(inputs)? {
            Some(graph) => self.record(graph, op, inputs, output),
            None => self.execute(op, inputs, output),
        }
    }

    fn recording_trace(&self, inputs: &[&Tensor]) -> Result<Option<Arc<TraceGraph>>> {
        let mut found: Option<Arc<TraceGraph>> = None;
        for input in inputs {
            if let TensorValue::Traced { graph, .. } = input.value() {
                match &found {
                    Some(existing) if existing.id() != graph.id() => {
                        return Err(TraceError::ForeignTrace.into())
                    }
                    Some(_) => {}
                    None => found = Some(Arc::clone(graph)),
                }
            }
        }
        if let Some(graph) = &found {
            if !graph.is_open() {
                return Err(TraceError::ForeignTrace.into());
            }
        }
        if found.is_none() && inputs.is_empty() {
            found = tracer::active_trace(self.id());
        }
        Ok(found)
    }

    fn record(
        &self,
        graph: Arc<TraceGraph>,
        op: Operation,
        inputs: &[&Tensor],
        output: TensorSpec,
    ) -> Result<Tensor> {
        let mut operands = Vec::with_capacity(inputs.len());
        for input in inputs {
            let operand = match input.value() {
                TensorValue::Traced { id, .. } => Operand::Value(*id),
                TensorValue::Ready(handle) => Operand::Literal(self.read_literal(handle)?),
            };
            operands.push(operand);
        }
        let id = graph.record(op, operands, output.clone())?;
        Ok(Tensor::traced(self.clone(), output, graph, id))
    }

    fn execute(&self, op: Operation, inputs: &[&Tensor], output: TensorSpec) -> Result<Tensor> {
        let mut handles = Vec::with_capacity(inputs.len());
        for input in inputs {
            handles.push(Arc::clone(input.handle(op.label())?));
        }
        let label = op.label();
        let instruction = Instruction {
            id: ValueId(inputs.len() as u32),
            operands: (0..inputs.len() as u32)
                .map(|idx| Operand::Value(ValueId(idx)))
                .collect(),
            op,
            output,
        };
        tracing::trace!(op = label, output = %instruction.output, "eager dispatch");
        let handle = self
            .backend()
            .execute_instruction(&instruction, &handles)?;
        self.validator()
            .check(self.backend().as_ref(), label, &instruction.output, &handle)?;
        Ok(Tensor::ready(self.clone(), instruction.output, handle))
    }
}
