//! Trace recording for compiled regions.
//!
//! A [`TraceGraph`] collects the instructions produced while a region body runs on traced
//! tensors. Operations that take no tensor inputs (random generators) cannot discover a trace
//! from their operands, so the graph being recorded is also published on a thread-local stack
//! for the duration of the trace.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::spec::{Function, Instruction, Operand, Operation, TensorSpec, ValueId};
use crate::error::{Result, TraceError};

static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TRACE_STACK: RefCell<Vec<Arc<TraceGraph>>> = const { RefCell::new(Vec::new()) };
}

/// Instruction buffer for one in-progress trace.
pub(crate) struct TraceGraph {
    id: u64,
    runtime_id: u64,
    state: Mutex<TraceState>,
}

struct TraceState {
    open: bool,
    next_id: u32,
    parameters: Vec<TensorSpec>,
    parameter_ids: Vec<ValueId>,
    body: Vec<Instruction>,
}

impl TraceGraph {
    pub(crate) fn new(runtime_id: u64) -> Arc<Self> {
        Arc::new(TraceGraph {
            id: TRACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            runtime_id,
            state: Mutex::new(TraceState {
                open: true,
                next_id: 0,
                parameters: Vec::new(),
                parameter_ids: Vec::new(),
                body: Vec::new(),
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn runtime_id(&self) -> u64 {
        self.runtime_id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub(crate) fn add_parameter(&self, spec: TensorSpec) -> ValueId {
        let mut state = self.state.lock();
        let id = ValueId(state.next_id);
        state.next_id += 1;
        state.parameters.push(spec);
        state.parameter_ids.push(id);
        id
    }

    /// Appends an instruction and returns the id of its result.
    pub(crate) fn record(
        &self,
        op: Operation,
        operands: Vec<Operand>,
        output: TensorSpec,
    ) -> Result<ValueId> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TraceError::ForeignTrace.into());
        }
        let id = ValueId(state.next_id);
        state.next_id += 1;
        state.body.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        Ok(id)
    }

    /// Closes the trace and packages the recorded body as a function.
    pub(crate) fn finish(&self, name: &str, results: Vec<(ValueId, TensorSpec)>) -> Function {
        let mut state = self.state.lock();
        state.open = false;
        let (result_ids, results) = results.into_iter().unzip();
        Function {
            name: name.to_string(),
            parameters: std::mem::take(&mut state.parameters),
            parameter_ids: std::mem::take(&mut state.parameter_ids),
            body: std::mem::take(&mut state.body),
            result_ids,
            results,
        }
    }

    /// Closes the trace without producing a function (failed traces).
    pub(crate) fn abandon(&self) {
        self.state.lock().open = false;
    }
}

/// RAII guard that pops the active trace when dropped.
pub(crate) struct TraceScope {
    active: bool,
}

impl Drop for TraceScope {
    fn drop(&mut self) {
        if self.active {
            TRACE_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

pub(crate) fn push_active_trace(graph: Arc<TraceGraph>) -> TraceScope {
    TRACE_STACK.with(|stack| stack.borrow_mut().push(graph));
    TraceScope { active: true }
}

/// Innermost open trace on this thread that records for `runtime_id`.
pub(crate) fn active_trace(runtime_id: u64) -> Option<Arc<TraceGraph>> {
    TRACE_STACK.with(|stack| {
        stack
            .borrow()
            .iter()
            .rev()
            .find(|graph| graph.runtime_id() == runtime_id)
            .cloned()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::spec::{DType, UnaryOp};

    #[test]
    fn records_parameters_and_instructions_in_order() {
        let graph = TraceGraph::new(1);
        let spec = TensorSpec::new(DType::F32, [2]);
        let x = graph.add_parameter(spec.clone());
        let y = graph
            .record(
                Operation::Unary(UnaryOp::Neg),
                vec![Operand::Value(x)],
                spec.clone(),
            )
            .unwrap();
        let function = graph.finish("f", vec![(y, spec.clone())]);
        assert_eq!(function.parameter_ids, vec![ValueId(0)]);
        assert_eq!(function.body.len(), 1);
        assert_eq!(function.result_ids, vec![ValueId(1)]);
        assert!(!graph.is_open());
    }

    #[test]
    fn closed_trace_rejects_recording() {
        let graph = TraceGraph::new(1);
        graph.abandon();
        let err = graph
            .record(Operation::Not, Vec::new(), TensorSpec::new(DType::Bool, [1]))
            .unwrap_err();
        assert_eq!(err, TraceError::ForeignTrace.into());
    }

    #[test]
    fn scope_publishes_and_restores_active_trace() {
        assert!(active_trace(9).is_none());
        let graph = TraceGraph::new(9);
        {
            let _scope = push_active_trace(Arc::clone(&graph));
            let active = active_trace(9).expect("trace should be active");
            assert_eq!(active.id(), graph.id());
            assert!(active_trace(10).is_none());
        }
        assert!(active_trace(9).is_none());
    }
}
