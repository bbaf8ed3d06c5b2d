//! Compiled regions: tracing, caching and replay.
//!
//! A compiled call traces the region body once per input signature into a [`Program`],
//! caches it, and replays it on every later call with the same signature. Nothing here
//! ever falls back to eager execution: a body that needs concrete values while tracing
//! fails with a [`TraceError`].

pub mod autodiff;
pub mod cache;
pub mod region;
pub(crate) mod tracer;

use std::collections::HashMap;
use std::sync::Arc;

pub use cache::{Trace, TraceCache, TraceKey, TraceKind, TraceSink, TraceStats};
pub use region::{jit, CompiledRegion};

use crate::backend::registry::BackendHandle;
use crate::backend::spec::{
    BackendError, Function, Operand, Operation, Program, TensorSpec, ValueId,
};
use crate::error::{Result, TensorKitError, TraceError};
use crate::runtime::{ExecutionMode, Runtime};
use crate::tensor::{Tensor, TensorValue};
use tracer::TraceGraph;

impl Runtime {
    /// Calls `region`, choosing the mode through the controller.
    pub fn call(&self, region: &CompiledRegion, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        self.call_region(region, inputs, None)
    }

    /// Calls `region` with a per-call mode override. A forced JIT policy still wins.
    pub fn call_with_mode(
        &self,
        region: &CompiledRegion,
        inputs: &[Tensor],
        mode: ExecutionMode,
    ) -> Result<Vec<Tensor>> {
        self.call_region(region, inputs, Some(mode))
    }

    fn call_region(
        &self,
        region: &CompiledRegion,
        inputs: &[Tensor],
        call_override: Option<ExecutionMode>,
    ) -> Result<Vec<Tensor>> {
        self.check_inputs(region.name(), inputs)?;

        if self.inside_trace(inputs) {
            let _guard = self.controller().enter_region();
            tracing::trace!(region = region.name(), "inlining region into enclosing trace");
            return region.invoke(inputs);
        }

        let mode = self
            .controller()
            .resolve(call_override, region.annotation());
        let _guard = self.controller().enter_region();
        match mode {
            ExecutionMode::Eager => region.invoke(inputs),
            ExecutionMode::Compiled => {
                let signature: Vec<TensorSpec> =
                    inputs.iter().map(|input| input.spec().clone()).collect();
                let key = TraceKey::new(region, TraceKind::Forward, signature.clone());
                let trace = self.trace_cache().get_or_trace(key, || {
                    let function = self.trace_function(region, &signature)?;
                    Ok(Program::new(region.name()).with_functions(vec![function]))
                })?;
                self.replay(&trace.program, inputs)
            }
        }
    }

    pub(crate) fn check_inputs(&self, region: &str, inputs: &[Tensor]) -> Result<()> {
        for input in inputs {
            if !input.runtime().same_runtime(self) {
                return Err(BackendError::execution(format!(
                    "region '{region}': input tensor belongs to a different runtime"
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Whether a call happens while an enclosing trace of this runtime is recording.
    pub(crate) fn inside_trace(&self, inputs: &[Tensor]) -> bool {
        inputs.iter().any(Tensor::is_traced) || tracer::active_trace(self.id()).is_some()
    }

    /// Runs `region` on placeholder tensors and returns the recorded function.
    pub(crate) fn trace_function(
        &self,
        region: &CompiledRegion,
        signature: &[TensorSpec],
    ) -> Result<Function> {
        let graph = TraceGraph::new(self.id());
        let parameters: Vec<Tensor> = signature
            .iter()
            .map(|spec| {
                let id = graph.add_parameter(spec.clone());
                Tensor::traced(self.clone(), spec.clone(), Arc::clone(&graph), id)
            })
            .collect();

        let outputs = {
            let _scope = tracer::push_active_trace(Arc::clone(&graph));
            region.invoke(&parameters)
        };
        match self.collect_results(&graph, outputs) {
            Ok(results) => Ok(graph.finish(region.name(), results)),
            Err(err) => {
                graph.abandon();
                tracing::debug!(region = region.name(), error = %err, "trace failed");
                Err(err)
            }
        }
    }

    fn collect_results(
        &self,
        graph: &Arc<TraceGraph>,
        outputs: Result<Vec<Tensor>>,
    ) -> Result<Vec<(ValueId, TensorSpec)>> {
        let outputs = outputs?;
        let mut results = Vec::with_capacity(outputs.len());
        for output in &outputs {
            if !output.runtime().same_runtime(self) {
                return Err(TraceError::ForeignTrace.into());
            }
            let spec = output.spec().clone();
            let id = match output.value() {
                TensorValue::Traced { graph: owner, id } if owner.id() == graph.id() => *id,
                TensorValue::Traced { .. } => return Err(TraceError::ForeignTrace.into()),
                TensorValue::Ready(handle) => {
                    let literal = self.read_literal(handle)?;
                    graph.record(Operation::Constant(literal), Vec::new(), spec.clone())?
                }
            };
            results.push((id, spec));
        }
        Ok(results)
    }

    /// Executes a traced program on concrete inputs.
    ///
    /// Without validation the whole program goes to the backend at once. With validation it
    /// runs instruction by instruction so every intermediate is checked exactly as in eager
    /// execution.
    pub(crate) fn replay(&self, program: &Program, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;
        let handles = inputs
            .iter()
            .map(|input| input.handle("replay").map(Arc::clone))
            .collect::<Result<Vec<BackendHandle>>>()?;

        let outputs = if self.validator().is_enabled() {
            self.run_stepwise(function, handles)?
        } else {
            tracing::trace!(program = %program.entry, "replaying program");
            self.backend().run_program(program, &handles)?
        };
        if outputs.len() != function.results.len() {
            return Err(BackendError::execution("program result arity mismatch").into());
        }
        Ok(outputs
            .into_iter()
            .zip(function.results.iter())
            .map(|(handle, spec)| Tensor::ready(self.clone(), spec.clone(), handle))
            .collect())
    }

    /// Executes `function` one instruction at a time, validating each output.
    pub(crate) fn run_stepwise(
        &self,
        function: &Function,
        entry_inputs: Vec<BackendHandle>,
    ) -> Result<Vec<BackendHandle>> {
        if entry_inputs.len() != function.parameter_ids.len() {
            return Err(BackendError::execution("entry input arity mismatch").into());
        }
        let backend = self.backend();
        let validator = self.validator();
        let mut values: HashMap<ValueId, BackendHandle> =
            function.parameter_ids.iter().copied().zip(entry_inputs).collect();

        for instruction in &function.body {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                if let Operand::Value(id) = operand {
                    let handle = values
                        .get(id)
                        .ok_or_else(|| BackendError::execution(format!("value {id} missing")))?;
                    inputs.push(Arc::clone(handle));
                }
            }
            let handle = backend.execute_instruction(instruction, &inputs)?;
            if !matches!(instruction.op, Operation::Constant(_)) {
                validator.check(
                    backend.as_ref(),
                    instruction.op.label(),
                    &instruction.output,
                    &handle,
                )?;
            }
            values.insert(instruction.id, handle);
        }

        function
            .result_ids
            .iter()
            .map(|id| {
                values
                    .get(id)
                    .cloned()
                    .ok_or_else(|| {
                        TensorKitError::from(BackendError::execution(format!("result {id} missing")))
                    })
            })
            .collect()
    }
}
