//! Reverse-mode differentiation of traced regions.
//!
//! The region is traced into a forward function, then vector-Jacobian products are appended
//! to the same function body in reverse instruction order. The result is an ordinary program
//! whose outputs are the forward value followed by one gradient per input, so it can be
//! cached and replayed like any other trace.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::spec::{
    BackendError, BinaryOp, BroadcastToSpec, CastSpec, ComparisonOp, DType, Function,
    Instruction, Operand, Operation, Program, ReduceKind, ReduceSpec, ReshapeSpec, Shape,
    SliceSpec, TensorLiteral, TensorSpec, TransposeSpec, UnaryOp, ValueId,
};
use crate::error::{DtypeError, Result, TensorKitError, TraceError};
use crate::ops::infer::reduced_shape;
use crate::runtime::{ExecutionMode, Runtime};
use crate::tensor::Tensor;

use super::cache::{TraceKey, TraceKind};
use super::region::CompiledRegion;

impl Runtime {
    /// Evaluates a scalar-valued region and its gradient with respect to every input.
    ///
    /// The region must return exactly one rank-0 float tensor and every input must be a float
    /// tensor. The body is always traced, whatever the execution mode; the mode decides
    /// whether the resulting program is cached.
    pub fn value_and_grad(
        &self,
        region: &CompiledRegion,
        inputs: &[Tensor],
    ) -> Result<(Tensor, Vec<Tensor>)> {
        self.value_and_grad_region(region, inputs, None)
    }

    pub fn value_and_grad_with_mode(
        &self,
        region: &CompiledRegion,
        inputs: &[Tensor],
        mode: ExecutionMode,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        self.value_and_grad_region(region, inputs, Some(mode))
    }

    fn value_and_grad_region(
        &self,
        region: &CompiledRegion,
        inputs: &[Tensor],
        call_override: Option<ExecutionMode>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        self.check_inputs(region.name(), inputs)?;
        for input in inputs {
            if !input.dtype().is_float() {
                return Err(DtypeError::Unsupported {
                    operation: "value_and_grad",
                    dtype: input.dtype(),
                }
                .into());
            }
        }
        let signature: Vec<TensorSpec> = inputs.iter().map(|input| input.spec().clone()).collect();
        let build = || -> Result<Program> {
            let forward = self.trace_function(region, &signature)?;
            let function = differentiate(region.name(), forward)?;
            Ok(Program::new(function.name.clone()).with_functions(vec![function]))
        };

        let mut outputs = if self.inside_trace(inputs) {
            let _guard = self.controller().enter_region();
            let program = build()?;
            self.inline_program(&program, inputs)?
        } else {
            let mode = self
                .controller()
                .resolve(call_override, region.annotation());
            let _guard = self.controller().enter_region();
            match mode {
                ExecutionMode::Eager => {
                    let program = build()?;
                    self.replay_stepwise(&program, inputs)?
                }
                ExecutionMode::Compiled => {
                    let key = TraceKey::new(region, TraceKind::ValueAndGrad, signature.clone());
                    let trace = self.trace_cache().get_or_trace(key, build)?;
                    self.replay(&trace.program, inputs)?
                }
            }
        };

        let value = outputs.remove(0);
        Ok((value, outputs))
    }

    fn replay_stepwise(&self, program: &Program, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;
        let handles = inputs
            .iter()
            .map(|input| input.handle("value_and_grad").map(Arc::clone))
            .collect::<Result<Vec<_>>>()?;
        let outputs = self.run_stepwise(function, handles)?;
        Ok(outputs
            .into_iter()
            .zip(function.results.iter())
            .map(|(handle, spec)| Tensor::ready(self.clone(), spec.clone(), handle))
            .collect())
    }

    /// Re-records every instruction of `program` into the trace enclosing `inputs`.
    fn inline_program(&self, program: &Program, inputs: &[Tensor]) -> Result<Vec<Tensor>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;
        let mut values: HashMap<ValueId, Tensor> = function
            .parameter_ids
            .iter()
            .copied()
            .zip(inputs.iter().cloned())
            .collect();
        for instruction in &function.body {
            let mut operands: Vec<Tensor> = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                match operand {
                    Operand::Value(id) => {
                        let tensor = values.get(id).cloned().ok_or_else(|| {
                            BackendError::execution(format!(
                                "value {id} missing"
                            ))
                        })?;
                        operands.push(tensor);
                    }
                    Operand::Literal(literal) => {
                        operands.push(self.from_literal(literal.clone())?);
                    }
                }
            }
            let refs: Vec<&Tensor> = operands.iter().collect();
            let output = self.apply(instruction.op.clone(), &refs, instruction.output.clone())?;
            values.insert(instruction.id, output);
        }
        function
            .result_ids
            .iter()
            .map(|id| {
                values.get(id).cloned().ok_or_else(|| {
                    TensorKitError::from(BackendError::execution(format!("result {id} missing")))
                })
            })
            .collect()
    }
}

/// Appends the backward pass to a traced scalar function.
pub(crate) fn differentiate(region: &str, forward: Function) -> Result<Function> {
    let [result_id] = forward.result_ids[..] else {
        return Err(TraceError::InvalidRegion {
            region: region.to_string(),
            detail: format!(
                "value_and_grad needs exactly one output, got {}",
                forward.result_ids.len()
            ),
        }
        .into());
    };
    let result_spec = forward.results[0].clone();
    if result_spec.shape.rank() != 0 || !result_spec.dtype.is_float() {
        return Err(TraceError::InvalidRegion {
            region: region.to_string(),
            detail: format!("value_and_grad needs a rank-0 float output, got {result_spec}"),
        }
        .into());
    }

    let mut builder = GradBuilder::new(&forward);
    let seed = builder.emit(
        Operation::Constant(TensorLiteral::filled(result_spec.clone(), 1.0)),
        Vec::new(),
        result_spec.clone(),
    );
    builder.grads.insert(result_id, seed);

    for instruction in forward.body.iter().rev() {
        let Some(&g) = builder.grads.get(&instruction.id) else {
            continue;
        };
        if !instruction.output.dtype.is_float() {
            continue;
        }
        builder.backprop(instruction, g)?;
    }

    let mut result_ids = vec![result_id];
    let mut results = vec![result_spec];
    for (&param, spec) in forward.parameter_ids.iter().zip(forward.parameters.iter()) {
        let grad = match builder.grads.get(&param) {
            Some(&grad) => grad,
            None => builder.emit(
                Operation::Constant(TensorLiteral::filled(spec.clone(), 0.0)),
                Vec::new(),
                spec.clone(),
            ),
        };
        result_ids.push(grad);
        results.push(spec.clone());
    }

    let mut body = forward.body;
    body.extend(builder.body);
    Ok(Function {
        name: format!("{}_value_and_grad", forward.name),
        parameters: forward.parameters,
        parameter_ids: forward.parameter_ids,
        body,
        result_ids,
        results,
    })
}

struct GradBuilder {
    next_id: u32,
    specs: HashMap<ValueId, TensorSpec>,
    grads: HashMap<ValueId, ValueId>,
    body: Vec<Instruction>,
}

impl GradBuilder {
    fn new(forward: &Function) -> Self {
        let mut specs: HashMap<ValueId, TensorSpec> = forward
            .parameter_ids
            .iter()
            .copied()
            .zip(forward.parameters.iter().cloned())
            .collect();
        for instruction in &forward.body {
            specs.insert(instruction.id, instruction.output.clone());
        }
        let next_id = specs.keys().map(|id| id.0 + 1).max().unwrap_or(0);
        Self {
            next_id,
            specs,
            grads: HashMap::new(),
            body: Vec::new(),
        }
    }

    fn emit(&mut self, op: Operation, operands: Vec<Operand>, output: TensorSpec) -> ValueId {
        let id = ValueId(self.next_id);
        self.next_id += 1;
        self.specs.insert(id, output.clone());
        self.body.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        id
    }

    fn spec_of(&self, operand: &Operand) -> TensorSpec {
        match operand {
            Operand::Value(id) => self.specs[id].clone(),
            Operand::Literal(literal) => literal.spec.clone(),
        }
    }

    fn binary(&mut self, op: BinaryOp, lhs: Operand, rhs: Operand) -> Operand {
        let spec = self.spec_of(&lhs);
        Operand::Value(self.emit(Operation::Binary(op), vec![lhs, rhs], spec))
    }

    fn unary(&mut self, op: UnaryOp, input: Operand) -> Operand {
        let spec = self.spec_of(&input);
        Operand::Value(self.emit(Operation::Unary(op), vec![input], spec))
    }

    fn select(&mut self, mask: Operand, on_true: Operand, on_false: Operand) -> Operand {
        let spec = self.spec_of(&on_true);
        Operand::Value(self.emit(Operation::Select, vec![mask, on_true, on_false], spec))
    }

    fn compare(&mut self, op: ComparisonOp, lhs: Operand, rhs: Operand) -> Operand {
        let spec = TensorSpec::new(DType::Bool, self.spec_of(&lhs).shape);
        Operand::Value(self.emit(Operation::Compare(op), vec![lhs, rhs], spec))
    }

    fn reshape(&mut self, input: Operand, shape: Shape) -> Operand {
        let spec = self.spec_of(&input);
        if spec.shape == shape {
            return input;
        }
        Operand::Value(self.emit(
            Operation::Reshape(ReshapeSpec {
                new_shape: shape.clone(),
            }),
            vec![input],
            TensorSpec::new(spec.dtype, shape),
        ))
    }

    fn broadcast(&mut self, input: Operand, shape: Shape) -> Operand {
        let spec = self.spec_of(&input);
        if spec.shape == shape {
            return input;
        }
        Operand::Value(self.emit(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: shape.clone(),
            }),
            vec![input],
            TensorSpec::new(spec.dtype, shape),
        ))
    }

    fn transpose(&mut self, input: Operand, perm: Vec<usize>) -> Operand {
        let spec = self.spec_of(&input);
        let dims: Vec<usize> = perm.iter().map(|&axis| spec.shape.dims()[axis]).collect();
        Operand::Value(self.emit(
            Operation::Transpose(TransposeSpec { perm }),
            vec![input],
            TensorSpec::new(spec.dtype, dims),
        ))
    }

    fn matmul(&mut self, lhs: Operand, rhs: Operand) -> Operand {
        let a = self.spec_of(&lhs);
        let b = self.spec_of(&rhs);
        let mut dims = a.shape.dims().to_vec();
        let last = dims.len() - 1;
        dims[last] = b.shape.dims()[b.shape.rank() - 1];
        Operand::Value(self.emit(
            Operation::Matmul,
            vec![lhs, rhs],
            TensorSpec::new(a.dtype, dims),
        ))
    }

    /// Expands a reduction result back to the reduced input's shape.
    fn expand_reduced(&mut self, value: Operand, input: &TensorSpec, spec: &ReduceSpec) -> Operand {
        let kept = reduced_shape(input.shape.dims(), &spec.axes, true);
        let reshaped = self.reshape(value, kept);
        self.broadcast(reshaped, input.shape.clone())
    }

    fn literal(spec: &TensorSpec, value: f64) -> Operand {
        Operand::Literal(TensorLiteral::filled(spec.clone(), value))
    }

    fn accumulate(&mut self, target: &Operand, grad: Operand) {
        let Operand::Value(id) = target else {
            return;
        };
        if !self.specs[id].dtype.is_float() {
            return;
        }
        let grad_id = match grad {
            Operand::Value(grad_id) => grad_id,
            Operand::Literal(literal) => {
                let spec = literal.spec.clone();
                self.emit(Operation::Constant(literal), Vec::new(), spec)
            }
        };
        let total = match self.grads.get(id) {
            Some(&existing) => {
                let spec = self.specs[id].clone();
                self.emit(
                    Operation::Binary(BinaryOp::Add),
                    vec![Operand::Value(existing), Operand::Value(grad_id)],
                    spec,
                )
            }
            None => grad_id,
        };
        self.grads.insert(*id, total);
    }

    fn backprop(&mut self, instruction: &Instruction, g: ValueId) -> Result<()> {
        let g = Operand::Value(g);
        let y = Operand::Value(instruction.id);
        let out = instruction.output.clone();
        let ops = &instruction.operands;
        match &instruction.op {
            Operation::Constant(_)
            | Operation::Compare(_)
            | Operation::Logical(_)
            | Operation::Not
            | Operation::RngUniform(_)
            | Operation::RngNormal(_)
            | Operation::StopGradient
            | Operation::Unary(UnaryOp::Sign)
            | Operation::Binary(BinaryOp::FloorDiv) => {}
            Operation::Unary(op) => {
                let x = ops[0].clone();
                let grad = match op {
                    UnaryOp::Neg => self.unary(UnaryOp::Neg, g),
                    UnaryOp::Abs => {
                        let sign = self.unary(UnaryOp::Sign, x.clone());
                        self.binary(BinaryOp::Mul, g, sign)
                    }
                    UnaryOp::Exp => self.binary(BinaryOp::Mul, g, y),
                    UnaryOp::Log => self.binary(BinaryOp::Div, g, x.clone()),
                    UnaryOp::Log1p => {
                        let shifted =
                            self.binary(BinaryOp::Add, x.clone(), Self::literal(&out, 1.0));
                        self.binary(BinaryOp::Div, g, shifted)
                    }
                    UnaryOp::Sin => {
                        let cos = self.unary(UnaryOp::Cos, x.clone());
                        self.binary(BinaryOp::Mul, g, cos)
                    }
                    UnaryOp::Cos => {
                        let sin = self.unary(UnaryOp::Sin, x.clone());
                        let scaled = self.binary(BinaryOp::Mul, g, sin);
                        self.unary(UnaryOp::Neg, scaled)
                    }
                    UnaryOp::Tanh => {
                        let y2 = self.binary(BinaryOp::Mul, y.clone(), y);
                        let slope = self.binary(BinaryOp::Sub, Self::literal(&out, 1.0), y2);
                        self.binary(BinaryOp::Mul, g, slope)
                    }
                    UnaryOp::Sqrt => {
                        let twice = self.binary(BinaryOp::Mul, y, Self::literal(&out, 2.0));
                        self.binary(BinaryOp::Div, g, twice)
                    }
                    UnaryOp::Square => {
                        let twice = self.binary(BinaryOp::Mul, x.clone(), Self::literal(&out, 2.0));
                        self.binary(BinaryOp::Mul, g, twice)
                    }
                    UnaryOp::Sign => unreachable!("sign has no gradient"),
                };
                self.accumulate(&x, grad);
            }
            Operation::Binary(op) => {
                let (a, b) = (ops[0].clone(), ops[1].clone());
                match op {
                    BinaryOp::Add => {
                        self.accumulate(&a, g.clone());
                        self.accumulate(&b, g);
                    }
                    BinaryOp::Sub => {
                        self.accumulate(&a, g.clone());
                        let neg = self.unary(UnaryOp::Neg, g);
                        self.accumulate(&b, neg);
                    }
                    BinaryOp::Mul => {
                        let ga = self.binary(BinaryOp::Mul, g.clone(), b.clone());
                        self.accumulate(&a, ga);
                        let gb = self.binary(BinaryOp::Mul, g, a.clone());
                        self.accumulate(&b, gb);
                    }
                    BinaryOp::Div => {
                        let ga = self.binary(BinaryOp::Div, g.clone(), b.clone());
                        self.accumulate(&a, ga);
                        let gy = self.binary(BinaryOp::Mul, g, y);
                        let ratio = self.binary(BinaryOp::Div, gy, b.clone());
                        let gb = self.unary(UnaryOp::Neg, ratio);
                        self.accumulate(&b, gb);
                    }
                    BinaryOp::Pow => {
                        let exponent = self.binary(BinaryOp::Sub, b.clone(), Self::literal(&out, 1.0));
                        let power = self.binary(BinaryOp::Pow, a.clone(), exponent);
                        let slope = self.binary(BinaryOp::Mul, b.clone(), power);
                        let ga = self.binary(BinaryOp::Mul, g.clone(), slope);
                        self.accumulate(&a, ga);
                        if matches!(b, Operand::Value(_)) {
                            let log_a = self.unary(UnaryOp::Log, a.clone());
                            let scaled = self.binary(BinaryOp::Mul, y, log_a);
                            let gb = self.binary(BinaryOp::Mul, g, scaled);
                            self.accumulate(&b, gb);
                        }
                    }
                    BinaryOp::Maximum | BinaryOp::Minimum => {
                        let cmp = if *op == BinaryOp::Maximum {
                            ComparisonOp::GreaterEqual
                        } else {
                            ComparisonOp::LessEqual
                        };
                        let mask = self.compare(cmp, a.clone(), b.clone());
                        let zero = Self::literal(&out, 0.0);
                        let ga = self.select(mask.clone(), g.clone(), zero.clone());
                        self.accumulate(&a, ga);
                        let gb = self.select(mask, zero, g);
                        self.accumulate(&b, gb);
                    }
                    BinaryOp::Mod | BinaryOp::FMod => {
                        return Err(TraceError::NotDifferentiable {
                            operation: instruction.op.label(),
                        }
                        .into())
                    }
                    BinaryOp::FloorDiv => {}
                }
            }
            Operation::Select => {
                let zero = Self::literal(&out, 0.0);
                let mask = ops[0].clone();
                let ga = self.select(mask.clone(), g.clone(), zero.clone());
                self.accumulate(&ops[1], ga);
                let gb = self.select(mask, zero, g);
                self.accumulate(&ops[2], gb);
            }
            Operation::Cast(_) => {
                let x = ops[0].clone();
                let source = self.spec_of(&x);
                if source.dtype.is_float() {
                    let back = Operand::Value(self.emit(
                        Operation::Cast(CastSpec {
                            dtype: source.dtype,
                        }),
                        vec![g],
                        source,
                    ));
                    self.accumulate(&x, back);
                }
            }
            Operation::Reduce(spec) => {
                let x = ops[0].clone();
                let input = self.spec_of(&x);
                match spec.kind {
                    ReduceKind::Sum => {
                        let grad = self.expand_reduced(g, &input, spec);
                        self.accumulate(&x, grad);
                    }
                    ReduceKind::Prod => {
                        let gy = self.binary(BinaryOp::Mul, g, y);
                        let expanded = self.expand_reduced(gy, &input, spec);
                        let grad = self.binary(BinaryOp::Div, expanded, x.clone());
                        self.accumulate(&x, grad);
                    }
                    ReduceKind::Max | ReduceKind::Min => {
                        let expanded_y = self.expand_reduced(y, &input, spec);
                        let mask = self.compare(ComparisonOp::Equal, x.clone(), expanded_y);
                        let expanded_g = self.expand_reduced(g, &input, spec);
                        let zero = Self::literal(&input, 0.0);
                        let grad = self.select(mask, expanded_g, zero);
                        self.accumulate(&x, grad);
                    }
                    ReduceKind::All | ReduceKind::Any => {}
                }
            }
            Operation::Reshape(_) => {
                let x = ops[0].clone();
                let shape = self.spec_of(&x).shape;
                let grad = self.reshape(g, shape);
                self.accumulate(&x, grad);
            }
            Operation::Transpose(spec) => {
                let mut inverse = vec![0usize; spec.perm.len()];
                for (out_axis, &in_axis) in spec.perm.iter().enumerate() {
                    inverse[in_axis] = out_axis;
                }
                let grad = self.transpose(g, inverse);
                self.accumulate(&ops[0], grad);
            }
            Operation::BroadcastTo(_) => {
                let x = ops[0].clone();
                let input = self.spec_of(&x);
                let in_dims = input.shape.dims();
                let out_dims = out.shape.dims();
                let lead = out_dims.len() - in_dims.len();
                let axes: Vec<usize> = (0..out_dims.len())
                    .filter(|&axis| axis < lead || (in_dims[axis - lead] == 1 && out_dims[axis] != 1))
                    .collect();
                let summed = if axes.is_empty() {
                    g
                } else {
                    let shape = reduced_shape(out_dims, &axes, false);
                    Operand::Value(self.emit(
                        Operation::Reduce(ReduceSpec {
                            kind: ReduceKind::Sum,
                            axes,
                            keepdims: false,
                        }),
                        vec![g],
                        TensorSpec::new(out.dtype, shape),
                    ))
                };
                let grad = self.reshape(summed, input.shape.clone());
                self.accumulate(&x, grad);
            }
            Operation::Matmul => {
                let (a, b) = (ops[0].clone(), ops[1].clone());
                let rank = out.shape.rank();
                let perm: Vec<usize> = if rank == 3 { vec![0, 2, 1] } else { vec![1, 0] };
                let b_t = self.transpose(b.clone(), perm.clone());
                let ga = self.matmul(g.clone(), b_t);
                self.accumulate(&a, ga);
                let a_t = self.transpose(a, perm);
                let gb = self.matmul(a_t, g);
                self.accumulate(&b, gb);
            }
            Operation::Concat(spec) => {
                let mut offset = 0usize;
                for operand in ops {
                    let part = self.spec_of(operand);
                    let mut starts = vec![0usize; part.shape.rank()];
                    starts[spec.axis] = offset;
                    offset += part.shape.dims()[spec.axis];
                    let piece = Operand::Value(self.emit(
                        Operation::Slice(SliceSpec {
                            starts,
                            sizes: part.shape.dims().to_vec(),
                        }),
                        vec![g.clone()],
                        TensorSpec::new(out.dtype, part.shape.clone()),
                    ));
                    self.accumulate(operand, piece);
                }
            }
            Operation::Slice(_) => {
                return Err(TraceError::NotDifferentiable {
                    operation: instruction.op.label(),
                }
                .into())
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_f32() -> TensorSpec {
        TensorSpec::new(DType::F32, Shape::scalar())
    }

    #[test]
    fn rejects_non_scalar_output() {
        let spec = TensorSpec::new(DType::F32, [2]);
        let forward = Function {
            name: "f".into(),
            parameters: vec![spec.clone()],
            parameter_ids: vec![ValueId(0)],
            body: Vec::new(),
            result_ids: vec![ValueId(0)],
            results: vec![spec],
        };
        let err = differentiate("f", forward).unwrap_err();
        assert!(matches!(
            err,
            TensorKitError::Trace(TraceError::InvalidRegion { .. })
        ));
    }

    #[test]
    fn identity_gradient_is_one() {
        let spec = scalar_f32();
        let forward = Function {
            name: "id".into(),
            parameters: vec![spec.clone()],
            parameter_ids: vec![ValueId(0)],
            body: Vec::new(),
            result_ids: vec![ValueId(0)],
            results: vec![spec.clone()],
        };
        let function = differentiate("id", forward).unwrap();
        assert_eq!(function.result_ids.len(), 2);
        let seed = &function.body[0];
        assert_eq!(seed.id, function.result_ids[1]);
        assert_eq!(
            seed.op,
            Operation::Constant(TensorLiteral::filled(spec, 1.0))
        );
    }

    #[test]
    fn slice_is_not_differentiable() {
        let input = TensorSpec::new(DType::F32, [4]);
        let sliced = TensorSpec::new(DType::F32, [1]);
        let out = scalar_f32();
        let forward = Function {
            name: "s".into(),
            parameters: vec![input],
            parameter_ids: vec![ValueId(0)],
            body: vec![
                Instruction {
                    id: ValueId(1),
                    op: Operation::Slice(SliceSpec {
                        starts: vec![1],
                        sizes: vec![1],
                    }),
                    operands: vec![Operand::Value(ValueId(0))],
                    output: sliced,
                },
                Instruction {
                    id: ValueId(2),
                    op: Operation::Reshape(ReshapeSpec {
                        new_shape: Shape::scalar(),
                    }),
                    operands: vec![Operand::Value(ValueId(1))],
                    output: out.clone(),
                },
            ],
            result_ids: vec![ValueId(2)],
            results: vec![out],
        };
        let err = differentiate("s", forward).unwrap_err();
        assert_eq!(
            err,
            TensorKitError::from(TraceError::NotDifferentiable { operation: "slice" })
        );
    }
}
