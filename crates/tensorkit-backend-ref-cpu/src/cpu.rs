use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tensorkit::backend::spec::{
    BackendError, BackendResult, BinaryOp, BroadcastToSpec, CastSpec, ComparisonOp, ConcatSpec,
    DType, Instruction, LogicalOp, Operand, Operation, PortableBackend, Program, ReduceKind,
    ReduceSpec, RngSpec, SliceSpec, SpecErrorCode, TensorInit, TensorLiteral, TensorSpec,
    TransposeSpec, UnaryOp, ValueId,
};

#[derive(Clone)]
pub struct CpuTensor {
    pub spec: TensorSpec,
    pub data: TensorData,
}

impl CpuTensor {
    /// Pairs `data` with `spec`, checking dtype and element count.
    pub fn new(spec: TensorSpec, data: TensorData) -> BackendResult<Self> {
        if data.dtype() != spec.dtype {
            return Err(BackendError::execution(format!(
                "buffer dtype {} does not match spec {spec}",
                data.dtype()
            )));
        }
        if data.len() != spec.element_count() {
            return Err(BackendError::spec(
                SpecErrorCode::OperandShapeMismatch,
                format!(
                    "buffer holds {} elements, spec {spec} needs {}",
                    data.len(),
                    spec.element_count()
                ),
            ));
        }
        Ok(Self { spec, data })
    }

    pub fn dims(&self) -> &[usize] {
        self.spec.shape.dims()
    }
}

#[derive(Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
    I32(Arc<[i32]>),
    I64(Arc<[i64]>),
    Bool(Arc<[bool]>),
}

macro_rules! map_data {
    ($data:expr, $values:ident => $body:expr) => {
        match $data {
            TensorData::F32($values) => TensorData::F32($body),
            TensorData::F64($values) => TensorData::F64($body),
            TensorData::I32($values) => TensorData::I32($body),
            TensorData::I64($values) => TensorData::I64($body),
            TensorData::Bool($values) => TensorData::Bool($body),
        }
    };
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// New buffer whose element `i` is `self[indices[i]]`.
    fn gather(&self, indices: &[usize]) -> TensorData {
        map_data!(self, values => indices.iter().map(|&idx| values[idx]).collect())
    }

    fn values(&self) -> Values {
        match self {
            TensorData::F32(v) => Values::Float(v.iter().map(|&x| f64::from(x)).collect()),
            TensorData::F64(v) => Values::Float(v.to_vec()),
            TensorData::I32(v) => Values::Int(v.iter().map(|&x| i64::from(x)).collect()),
            TensorData::I64(v) => Values::Int(v.to_vec()),
            TensorData::Bool(v) => Values::Bool(v.to_vec()),
        }
    }
}

/// Widened working copy used by the arithmetic kernels.
enum Values {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
}

impl Values {
    /// Narrows to `dtype` with `as`-conversion semantics.
    fn pack(self, dtype: DType) -> TensorData {
        match (self, dtype) {
            (Values::Float(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
            (Values::Float(v), DType::F64) => TensorData::F64(Arc::from(v)),
            (Values::Float(v), DType::I32) => TensorData::I32(v.iter().map(|&x| x as i32).collect()),
            (Values::Float(v), DType::I64) => TensorData::I64(v.iter().map(|&x| x as i64).collect()),
            (Values::Float(v), DType::Bool) => TensorData::Bool(v.iter().map(|&x| x != 0.0).collect()),
            (Values::Int(v), DType::F32) => TensorData::F32(v.iter().map(|&x| x as f32).collect()),
            (Values::Int(v), DType::F64) => TensorData::F64(v.iter().map(|&x| x as f64).collect()),
            (Values::Int(v), DType::I32) => TensorData::I32(v.iter().map(|&x| x as i32).collect()),
            (Values::Int(v), DType::I64) => TensorData::I64(Arc::from(v)),
            (Values::Int(v), DType::Bool) => TensorData::Bool(v.iter().map(|&x| x != 0).collect()),
            (Values::Bool(v), DType::Bool) => TensorData::Bool(Arc::from(v)),
            (Values::Bool(v), dtype) => {
                Values::Int(v.iter().map(|&x| i64::from(x)).collect()).pack(dtype)
            }
        }
    }
}

pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>>;
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _output: &TensorSpec,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuPortableBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> PortableBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle> {
        match init {
            TensorInit::Literal(lit) => literal_to_tensor(&lit),
            TensorInit::Zeroed(spec) => literal_to_tensor(&TensorLiteral::filled(spec, 0.0)),
        }
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        Ok(tensor_to_literal(tensor))
    }

    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle> {
        let mut handles = inputs.iter();
        let mut operands = Vec::with_capacity(instruction.operands.len());
        for operand in &instruction.operands {
            let tensor = match operand {
                Operand::Value(_) => handles
                    .next()
                    .cloned()
                    .ok_or_else(|| BackendError::execution("operand value missing"))?,
                Operand::Literal(lit) => literal_to_tensor(lit)?,
            };
            operands.push(tensor);
        }
        if handles.next().is_some() {
            return Err(BackendError::execution("too many operand handles"));
        }
        execute_operation(self.interceptor.as_ref(), instruction, &operands)
    }

    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        let function = program
            .entry_function()
            .ok_or_else(|| BackendError::execution("entry function not found"))?;

        if function.parameter_ids.len() != entry_inputs.len() {
            return Err(BackendError::execution("entry input arity mismatch"));
        }

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for (param_id, handle) in function.parameter_ids.iter().zip(entry_inputs.iter()) {
            values.insert(*param_id, handle.clone());
        }

        for (instr_index, instruction) in function.body.iter().enumerate() {
            let mut inputs = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = match operand {
                    Operand::Value(id) => values
                        .get(id)
                        .cloned()
                        .ok_or_else(|| BackendError::execution("operand value missing"))?,
                    Operand::Literal(lit) => literal_to_tensor(lit)?,
                };
                inputs.push(tensor);
            }
            let output = execute_operation(self.interceptor.as_ref(), instruction, &inputs)
                .map_err(|err| {
                    augment_backend_error(err, &function.name, instr_index, instruction, &inputs)
                })?;
            values.insert(instruction.id, output);
        }

        let mut results = Vec::with_capacity(function.result_ids.len());
        for id in &function.result_ids {
            let value = values
                .get(id)
                .cloned()
                .ok_or_else(|| BackendError::execution("missing function result value"))?;
            results.push(value);
        }
        Ok(results)
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let spec = literal.spec.clone();
    let width = spec.dtype.size_in_bytes();
    if literal.bytes.len() != spec.element_count() * width {
        return Err(BackendError::execution(format!(
            "literal byte length {} mismatches {spec}",
            literal.bytes.len()
        )));
    }
    let chunks = literal.bytes.chunks_exact(width);
    let data = match spec.dtype {
        DType::F32 => TensorData::F32(
            chunks
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::F64 => TensorData::F64(
            chunks
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        DType::I32 => TensorData::I32(
            chunks
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ),
        DType::I64 => TensorData::I64(
            chunks
                .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect(),
        ),
        DType::Bool => TensorData::Bool(literal.bytes.iter().map(|&b| b != 0).collect()),
    };
    CpuTensor::new(spec, data)
}

fn tensor_to_literal(tensor: &CpuTensor) -> TensorLiteral {
    let mut bytes = Vec::with_capacity(tensor.spec.byte_len());
    match &tensor.data {
        TensorData::F32(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        TensorData::F64(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        TensorData::I32(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        TensorData::I64(v) => v.iter().for_each(|x| bytes.extend_from_slice(&x.to_le_bytes())),
        TensorData::Bool(v) => bytes.extend(v.iter().map(|&b| u8::from(b))),
    }
    TensorLiteral::new(tensor.spec.clone(), Arc::from(bytes))
}

fn execute_operation(
    interceptor: &dyn CpuKernelInterceptor,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendResult<CpuTensor> {
    let output = &instruction.output;
    if let Some(result) = interceptor.try_execute(&instruction.op, inputs, output) {
        return result;
    }

    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::Unary(op) => op_unary(inputs, output, *op),
        Operation::Binary(op) => op_binary(inputs, output, *op),
        Operation::Compare(op) => op_compare(inputs, output, *op),
        Operation::Logical(op) => op_logical(inputs, output, *op),
        Operation::Not => op_not(inputs, output),
        Operation::Select => op_select(inputs, output),
        Operation::Cast(spec) => op_cast(inputs, output, spec),
        Operation::Reduce(spec) => op_reduce(inputs, output, spec),
        Operation::Matmul => op_matmul(inputs, output),
        Operation::Reshape(_) => op_reshape(inputs, output),
        Operation::Transpose(spec) => op_transpose(inputs, output, spec),
        Operation::BroadcastTo(spec) => op_broadcast_to(inputs, output, spec),
        Operation::Slice(spec) => op_slice(inputs, output, spec),
        Operation::Concat(spec) => op_concat(inputs, output, spec),
        Operation::RngUniform(spec) => op_rng(output, spec, false),
        Operation::RngNormal(spec) => op_rng(output, spec, true),
        Operation::StopGradient => Ok(expect_single(inputs)?.clone()),
    }
}

fn augment_backend_error(
    error: BackendError,
    function_name: &str,
    instruction_index: usize,
    instruction: &Instruction,
    inputs: &[CpuTensor],
) -> BackendError {
    match error {
        BackendError::Execution { message } => BackendError::Execution {
            message: format!(
                "{message} (at function `{}` instruction #{}, {} {} operands [{}])",
                function_name,
                instruction_index,
                instruction.op.label(),
                instruction.id,
                inputs
                    .iter()
                    .map(|t| t.spec.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        },
        other => other,
    }
}

fn unsupported(op: &Operation, dtype: DType) -> BackendError {
    BackendError::spec(
        SpecErrorCode::DTypeNotSupported,
        format!("{} on {dtype}", op.label()),
    )
}

fn expect_single(inputs: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match inputs {
        [single] => Ok(single),
        _ => Err(BackendError::execution(format!(
            "expected 1 operand, got {}",
            inputs.len()
        ))),
    }
}

fn expect_pair(inputs: &[CpuTensor]) -> BackendResult<(&CpuTensor, &CpuTensor)> {
    match inputs {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::execution(format!(
            "expected 2 operands, got {}",
            inputs.len()
        ))),
    }
}

fn expect_same_shape(lhs: &CpuTensor, rhs: &CpuTensor) -> BackendResult<()> {
    if lhs.spec.shape != rhs.spec.shape {
        return Err(BackendError::spec(
            SpecErrorCode::OperandShapeMismatch,
            format!("{} vs {}", lhs.spec, rhs.spec),
        ));
    }
    Ok(())
}

fn op_unary(inputs: &[CpuTensor], output: &TensorSpec, op: UnaryOp) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let values = match input.data.values() {
        Values::Float(v) => {
            let f: fn(f64) -> f64 = match op {
                UnaryOp::Neg => |x| -x,
                UnaryOp::Abs => f64::abs,
                UnaryOp::Sign => |x| if x == 0.0 || x.is_nan() { x } else { x.signum() },
                UnaryOp::Exp => f64::exp,
                UnaryOp::Log => f64::ln,
                UnaryOp::Log1p => f64::ln_1p,
                UnaryOp::Sin => f64::sin,
                UnaryOp::Cos => f64::cos,
                UnaryOp::Tanh => f64::tanh,
                UnaryOp::Sqrt => f64::sqrt,
                UnaryOp::Square => |x| x * x,
            };
            Values::Float(v.into_iter().map(f).collect())
        }
        Values::Int(v) => {
            let f: fn(i64) -> i64 = match op {
                UnaryOp::Neg => i64::wrapping_neg,
                UnaryOp::Abs => i64::wrapping_abs,
                UnaryOp::Sign => i64::signum,
                UnaryOp::Square => |x| x.wrapping_mul(x),
                _ => return Err(unsupported(&Operation::Unary(op), input.spec.dtype)),
            };
            Values::Int(v.into_iter().map(f).collect())
        }
        Values::Bool(_) => return Err(unsupported(&Operation::Unary(op), DType::Bool)),
    };
    CpuTensor::new(output.clone(), values.pack(output.dtype))
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> f64 {
    match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => a / b,
        BinaryOp::FloorDiv => (a / b).floor(),
        BinaryOp::Mod => {
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::FMod => a % b,
        BinaryOp::Pow => a.powf(b),
        BinaryOp::Maximum => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.max(b)
            }
        }
        BinaryOp::Minimum => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else {
                a.min(b)
            }
        }
    }
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> BackendResult<i64> {
    let divide_by_zero = || {
        BackendError::spec(
            SpecErrorCode::IntegerDivideByZero,
            format!("{} by zero", Operation::Binary(op).label()),
        )
    };
    Ok(match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                "true division requires float operands".to_string(),
            ))
        }
        BinaryOp::FloorDiv => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            let q = a.wrapping_div(b);
            if a.wrapping_rem(b) != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinaryOp::Mod => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            let r = a.wrapping_rem(b);
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::FMod => {
            if b == 0 {
                return Err(divide_by_zero());
            }
            a.wrapping_rem(b)
        }
        BinaryOp::Pow => {
            if b < 0 {
                return Err(BackendError::spec(
                    SpecErrorCode::NegativeIntegerExponent,
                    format!("exponent {b}"),
                ));
            }
            a.wrapping_pow(u32::try_from(b).unwrap_or(u32::MAX))
        }
        BinaryOp::Maximum => a.max(b),
        BinaryOp::Minimum => a.min(b),
    })
}

fn op_binary(inputs: &[CpuTensor], output: &TensorSpec, op: BinaryOp) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    expect_same_shape(lhs, rhs)?;
    let values = match (lhs.data.values(), rhs.data.values()) {
        (Values::Float(a), Values::Float(b)) => Values::Float(
            a.into_iter()
                .zip(b)
                .map(|(a, b)| float_binary(op, a, b))
                .collect(),
        ),
        (Values::Int(a), Values::Int(b)) => Values::Int(
            a.into_iter()
                .zip(b)
                .map(|(a, b)| int_binary(op, a, b))
                .collect::<BackendResult<Vec<_>>>()?,
        ),
        _ => return Err(unsupported(&Operation::Binary(op), lhs.spec.dtype)),
    };
    CpuTensor::new(output.clone(), values.pack(output.dtype))
}

fn compare<T: PartialOrd>(op: ComparisonOp, a: T, b: T) -> bool {
    match op {
        ComparisonOp::Less => a < b,
        ComparisonOp::LessEqual => a <= b,
        ComparisonOp::Equal => a == b,
        ComparisonOp::NotEqual => a != b,
        ComparisonOp::GreaterEqual => a >= b,
        ComparisonOp::Greater => a > b,
    }
}

fn op_compare(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    op: ComparisonOp,
) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    expect_same_shape(lhs, rhs)?;
    let mask: Vec<bool> = match (lhs.data.values(), rhs.data.values()) {
        (Values::Float(a), Values::Float(b)) => {
            a.into_iter().zip(b).map(|(a, b)| compare(op, a, b)).collect()
        }
        (Values::Int(a), Values::Int(b)) => {
            a.into_iter().zip(b).map(|(a, b)| compare(op, a, b)).collect()
        }
        (Values::Bool(a), Values::Bool(b)) => {
            a.into_iter().zip(b).map(|(a, b)| compare(op, a, b)).collect()
        }
        _ => return Err(unsupported(&Operation::Compare(op), lhs.spec.dtype)),
    };
    CpuTensor::new(output.clone(), TensorData::Bool(Arc::from(mask)))
}

fn op_logical(inputs: &[CpuTensor], output: &TensorSpec, op: LogicalOp) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    expect_same_shape(lhs, rhs)?;
    let (TensorData::Bool(a), TensorData::Bool(b)) = (&lhs.data, &rhs.data) else {
        return Err(unsupported(&Operation::Logical(op), lhs.spec.dtype));
    };
    let mask: Arc<[bool]> = a
        .iter()
        .zip(b.iter())
        .map(|(&a, &b)| match op {
            LogicalOp::And => a && b,
            LogicalOp::Or => a || b,
            LogicalOp::Xor => a ^ b,
        })
        .collect();
    CpuTensor::new(output.clone(), TensorData::Bool(mask))
}

fn op_not(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let TensorData::Bool(values) = &input.data else {
        return Err(unsupported(&Operation::Not, input.spec.dtype));
    };
    CpuTensor::new(
        output.clone(),
        TensorData::Bool(values.iter().map(|&x| !x).collect()),
    )
}

fn pick<T: Copy>(mask: &[bool], on_true: &[T], on_false: &[T]) -> Arc<[T]> {
    mask.iter()
        .zip(on_true.iter().zip(on_false.iter()))
        .map(|(&m, (&t, &f))| if m { t } else { f })
        .collect()
}

fn op_select(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let [cond, on_true, on_false] = inputs else {
        return Err(BackendError::execution(format!(
            "select expects 3 operands, got {}",
            inputs.len()
        )));
    };
    expect_same_shape(cond, on_true)?;
    expect_same_shape(on_true, on_false)?;
    let TensorData::Bool(mask) = &cond.data else {
        return Err(unsupported(&Operation::Select, cond.spec.dtype));
    };
    let data = match (&on_true.data, &on_false.data) {
        (TensorData::F32(t), TensorData::F32(f)) => TensorData::F32(pick(mask, t, f)),
        (TensorData::F64(t), TensorData::F64(f)) => TensorData::F64(pick(mask, t, f)),
        (TensorData::I32(t), TensorData::I32(f)) => TensorData::I32(pick(mask, t, f)),
        (TensorData::I64(t), TensorData::I64(f)) => TensorData::I64(pick(mask, t, f)),
        (TensorData::Bool(t), TensorData::Bool(f)) => TensorData::Bool(pick(mask, t, f)),
        _ => {
            return Err(BackendError::spec(
                SpecErrorCode::DTypeNotSupported,
                format!("select branches {} and {}", on_true.spec, on_false.spec),
            ))
        }
    };
    CpuTensor::new(output.clone(), data)
}

fn op_cast(inputs: &[CpuTensor], output: &TensorSpec, spec: &CastSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    if input.spec.dtype == spec.dtype {
        return CpuTensor::new(output.clone(), input.data.clone());
    }
    CpuTensor::new(output.clone(), input.data.values().pack(spec.dtype))
}

fn op_reduce(inputs: &[CpuTensor], output: &TensorSpec, spec: &ReduceSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let in_dims = input.dims();
    if spec.axes.iter().any(|&axis| axis >= in_dims.len()) {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!("reduce axes {:?} for rank {}", spec.axes, in_dims.len()),
        ));
    }
    let kept: Vec<usize> = in_dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if spec.axes.contains(&axis) { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept);
    let out_len: usize = kept.iter().product();
    let out_index = |flat: usize| -> usize {
        unravel_index(flat, in_dims)
            .iter()
            .zip(kept.iter().zip(kept_strides.iter()))
            .map(|(&coord, (&dim, &stride))| if dim == 1 { 0 } else { coord * stride })
            .sum()
    };
    let op = Operation::Reduce(spec.clone());

    let values = match (input.data.values(), spec.kind) {
        (Values::Float(v), kind @ (ReduceKind::Sum | ReduceKind::Prod | ReduceKind::Max | ReduceKind::Min)) => {
            let init = match kind {
                ReduceKind::Sum => 0.0,
                ReduceKind::Prod => 1.0,
                ReduceKind::Max => f64::NEG_INFINITY,
                _ => f64::INFINITY,
            };
            let mut acc = vec![init; out_len];
            for (flat, x) in v.into_iter().enumerate() {
                let slot = &mut acc[out_index(flat)];
                *slot = match kind {
                    ReduceKind::Sum => *slot + x,
                    ReduceKind::Prod => *slot * x,
                    ReduceKind::Max => float_binary(BinaryOp::Maximum, *slot, x),
                    _ => float_binary(BinaryOp::Minimum, *slot, x),
                };
            }
            Values::Float(acc)
        }
        (Values::Int(v), kind @ (ReduceKind::Sum | ReduceKind::Prod | ReduceKind::Max | ReduceKind::Min)) => {
            let (lowest, highest) = if input.spec.dtype == DType::I32 {
                (i64::from(i32::MIN), i64::from(i32::MAX))
            } else {
                (i64::MIN, i64::MAX)
            };
            let init = match kind {
                ReduceKind::Sum => 0,
                ReduceKind::Prod => 1,
                ReduceKind::Max => lowest,
                _ => highest,
            };
            let mut acc = vec![init; out_len];
            for (flat, x) in v.into_iter().enumerate() {
                let slot = &mut acc[out_index(flat)];
                *slot = match kind {
                    ReduceKind::Sum => slot.wrapping_add(x),
                    ReduceKind::Prod => slot.wrapping_mul(x),
                    ReduceKind::Max => (*slot).max(x),
                    _ => (*slot).min(x),
                };
            }
            Values::Int(acc)
        }
        (Values::Bool(v), kind @ (ReduceKind::All | ReduceKind::Any)) => {
            let all = kind == ReduceKind::All;
            let mut acc = vec![all; out_len];
            for (flat, x) in v.into_iter().enumerate() {
                let slot = &mut acc[out_index(flat)];
                *slot = if all { *slot && x } else { *slot || x };
            }
            Values::Bool(acc)
        }
        _ => return Err(unsupported(&op, input.spec.dtype)),
    };
    CpuTensor::new(output.clone(), values.pack(output.dtype))
}

fn op_matmul(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let (lhs, rhs) = expect_pair(inputs)?;
    let (batch, m, k, n) = matmul_dims(lhs.dims(), rhs.dims())?;
    let values = match (lhs.data.values(), rhs.data.values()) {
        (Values::Float(a), Values::Float(b)) => {
            let mut out = vec![0.0; batch * m * n];
            for bi in 0..batch {
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0.0;
                        for p in 0..k {
                            acc += a[bi * m * k + i * k + p] * b[bi * k * n + p * n + j];
                        }
                        out[bi * m * n + i * n + j] = acc;
                    }
                }
            }
            Values::Float(out)
        }
        (Values::Int(a), Values::Int(b)) => {
            let mut out = vec![0i64; batch * m * n];
            for bi in 0..batch {
                for i in 0..m {
                    for j in 0..n {
                        let mut acc = 0i64;
                        for p in 0..k {
                            acc = acc.wrapping_add(
                                a[bi * m * k + i * k + p].wrapping_mul(b[bi * k * n + p * n + j]),
                            );
                        }
                        out[bi * m * n + i * n + j] = acc;
                    }
                }
            }
            Values::Int(out)
        }
        _ => return Err(unsupported(&Operation::Matmul, lhs.spec.dtype)),
    };
    CpuTensor::new(output.clone(), values.pack(output.dtype))
}

/// `(batch, m, k, n)` for rank-2 or equal-batch rank-3 operands.
pub fn matmul_dims(lhs: &[usize], rhs: &[usize]) -> BackendResult<(usize, usize, usize, usize)> {
    match (lhs, rhs) {
        ([m, k], [k2, n]) if k == k2 => Ok((1, *m, *k, *n)),
        ([b, m, k], [b2, k2, n]) if b == b2 && k == k2 => Ok((*b, *m, *k, *n)),
        _ => Err(BackendError::spec(
            SpecErrorCode::OperandShapeMismatch,
            format!("matmul of {lhs:?} and {rhs:?}"),
        )),
    }
}

fn op_reshape(inputs: &[CpuTensor], output: &TensorSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    CpuTensor::new(output.clone(), input.data.clone())
}

fn op_transpose(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &TransposeSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let in_dims = input.dims();
    let mut seen = vec![false; in_dims.len()];
    if spec.perm.len() != in_dims.len()
        || spec
            .perm
            .iter()
            .any(|&axis| axis >= in_dims.len() || std::mem::replace(&mut seen[axis], true))
    {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!("permutation {:?} for rank {}", spec.perm, in_dims.len()),
        ));
    }
    let out_dims: Vec<usize> = spec.perm.iter().map(|&axis| in_dims[axis]).collect();
    let in_strides = compute_strides(in_dims);
    let indices: Vec<usize> = (0..input.data.len())
        .map(|flat| {
            unravel_index(flat, &out_dims)
                .iter()
                .zip(spec.perm.iter())
                .map(|(&coord, &axis)| coord * in_strides[axis])
                .sum()
        })
        .collect();
    CpuTensor::new(output.clone(), input.data.gather(&indices))
}

fn op_broadcast_to(
    inputs: &[CpuTensor],
    output: &TensorSpec,
    spec: &BroadcastToSpec,
) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let in_dims = input.dims();
    let out_dims = spec.result_shape.dims();
    if in_dims.len() > out_dims.len() {
        return Err(BackendError::spec(
            SpecErrorCode::OperandShapeMismatch,
            format!("cannot broadcast {} to {}", input.spec.shape, spec.result_shape),
        ));
    }
    let lead = out_dims.len() - in_dims.len();
    for (axis, &dim) in in_dims.iter().enumerate() {
        if dim != 1 && dim != out_dims[lead + axis] {
            return Err(BackendError::spec(
                SpecErrorCode::OperandShapeMismatch,
                format!("cannot broadcast {} to {}", input.spec.shape, spec.result_shape),
            ));
        }
    }
    let in_strides = compute_strides(in_dims);
    let indices: Vec<usize> = (0..spec.result_shape.element_count())
        .map(|flat| {
            let coords = unravel_index(flat, out_dims);
            in_dims
                .iter()
                .enumerate()
                .map(|(axis, &dim)| {
                    if dim == 1 {
                        0
                    } else {
                        coords[lead + axis] * in_strides[axis]
                    }
                })
                .sum()
        })
        .collect();
    CpuTensor::new(output.clone(), input.data.gather(&indices))
}

fn op_slice(inputs: &[CpuTensor], output: &TensorSpec, spec: &SliceSpec) -> BackendResult<CpuTensor> {
    let input = expect_single(inputs)?;
    let in_dims = input.dims();
    let valid = spec.starts.len() == in_dims.len()
        && spec.sizes.len() == in_dims.len()
        && in_dims
            .iter()
            .zip(spec.starts.iter().zip(spec.sizes.iter()))
            .all(|(&dim, (&start, &size))| start + size <= dim);
    if !valid {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!(
                "slice starts {:?} sizes {:?} for {}",
                spec.starts, spec.sizes, input.spec.shape
            ),
        ));
    }
    let in_strides = compute_strides(in_dims);
    let count: usize = spec.sizes.iter().product();
    let indices: Vec<usize> = (0..count)
        .map(|flat| {
            unravel_index(flat, &spec.sizes)
                .iter()
                .enumerate()
                .map(|(axis, &coord)| (coord + spec.starts[axis]) * in_strides[axis])
                .sum()
        })
        .collect();
    CpuTensor::new(output.clone(), input.data.gather(&indices))
}

fn op_concat(inputs: &[CpuTensor], output: &TensorSpec, spec: &ConcatSpec) -> BackendResult<CpuTensor> {
    let first = inputs
        .first()
        .ok_or_else(|| BackendError::execution("concat requires at least one operand"))?;
    let axis = spec.axis;
    let out_dims = output.shape.dims();
    if axis >= out_dims.len() {
        return Err(BackendError::spec(
            SpecErrorCode::InvalidAttributeValue,
            format!("concat axis {axis} for rank {}", out_dims.len()),
        ));
    }
    let mut owners = Vec::with_capacity(out_dims[axis]);
    for (part, tensor) in inputs.iter().enumerate() {
        if tensor.data.dtype() != first.data.dtype() {
            return Err(unsupported(&Operation::Concat(spec.clone()), tensor.spec.dtype));
        }
        let dims = tensor.dims();
        let compatible = dims.len() == out_dims.len()
            && dims
                .iter()
                .zip(out_dims.iter())
                .enumerate()
                .all(|(a, (&d, &o))| a == axis || d == o);
        if !compatible {
            return Err(BackendError::spec(
                SpecErrorCode::OperandShapeMismatch,
                format!("concat operand {} into {}", tensor.spec.shape, output.shape),
            ));
        }
        owners.extend((0..dims[axis]).map(|offset| (part, offset)));
    }
    if owners.len() != out_dims[axis] {
        return Err(BackendError::spec(
            SpecErrorCode::OperandShapeMismatch,
            format!("concat operands do not fill {}", output.shape),
        ));
    }

    let picks: Vec<(usize, usize)> = (0..output.element_count())
        .map(|flat| {
            let mut coords = unravel_index(flat, out_dims);
            let (part, offset) = owners[coords[axis]];
            coords[axis] = offset;
            let strides = compute_strides(inputs[part].dims());
            let idx = coords.iter().zip(strides.iter()).map(|(c, s)| c * s).sum();
            (part, idx)
        })
        .collect();

    macro_rules! concat_parts {
        ($variant:ident) => {{
            let slices = inputs
                .iter()
                .map(|tensor| match &tensor.data {
                    TensorData::$variant(values) => Ok(values.as_ref()),
                    _ => Err(BackendError::execution("concat operand dtype mismatch")),
                })
                .collect::<BackendResult<Vec<_>>>()?;
            TensorData::$variant(picks.iter().map(|&(part, idx)| slices[part][idx]).collect())
        }};
    }
    let data = match first.data {
        TensorData::F32(_) => concat_parts!(F32),
        TensorData::F64(_) => concat_parts!(F64),
        TensorData::I32(_) => concat_parts!(I32),
        TensorData::I64(_) => concat_parts!(I64),
        TensorData::Bool(_) => concat_parts!(Bool),
    };
    CpuTensor::new(output.clone(), data)
}

fn op_rng(output: &TensorSpec, spec: &RngSpec, normal: bool) -> BackendResult<CpuTensor> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let count = output.element_count();
    let data = match (output.dtype, normal) {
        (DType::F32, false) => TensorData::F32((0..count).map(|_| rng.gen::<f32>()).collect()),
        (DType::F64, false) => TensorData::F64((0..count).map(|_| rng.gen::<f64>()).collect()),
        (dtype @ (DType::F32 | DType::F64), true) => {
            let samples: Vec<f64> = (0..count)
                .map(|_| {
                    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                    let u2: f64 = rng.gen();
                    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
                })
                .collect();
            Values::Float(samples).pack(dtype)
        }
        (dtype, _) => {
            let op = if normal {
                Operation::RngNormal(spec.clone())
            } else {
                Operation::RngUniform(spec.clone())
            };
            return Err(unsupported(&op, dtype));
        }
    };
    CpuTensor::new(output.clone(), data)
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; dims.len()];
    for (i, dim) in dims.iter().enumerate().rev() {
        if *dim == 0 {
            continue;
        }
        coords[i] = index % *dim;
        index /= *dim;
    }
    coords
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorkit::backend::spec::{Shape, TensorLiteral};

    fn f32_tensor(dims: &[usize], values: &[f32]) -> CpuTensor {
        CpuTensor::new(
            TensorSpec::new(DType::F32, dims.to_vec()),
            TensorData::F32(Arc::from(values.to_vec())),
        )
        .unwrap()
    }

    fn i32_tensor(dims: &[usize], values: &[i32]) -> CpuTensor {
        CpuTensor::new(
            TensorSpec::new(DType::I32, dims.to_vec()),
            TensorData::I32(Arc::from(values.to_vec())),
        )
        .unwrap()
    }

    fn as_f32(tensor: &CpuTensor) -> Vec<f32> {
        match &tensor.data {
            TensorData::F32(values) => values.to_vec(),
            _ => panic!("expected f32 data"),
        }
    }

    fn run(op: Operation, inputs: &[CpuTensor], output: TensorSpec) -> BackendResult<CpuTensor> {
        let instruction = Instruction {
            id: ValueId(inputs.len() as u32),
            op,
            operands: (0..inputs.len() as u32).map(|i| Operand::Value(ValueId(i))).collect(),
            output,
        };
        CpuPortableBackend::new().execute_instruction(&instruction, inputs)
    }

    #[test]
    fn literal_round_trip_preserves_bytes() {
        let spec = TensorSpec::new(DType::I64, [3]);
        let literal = TensorLiteral::filled(spec, -7.0);
        let tensor = literal_to_tensor(&literal).unwrap();
        assert_eq!(tensor_to_literal(&tensor), literal);
    }

    #[test]
    fn transpose_moves_elements() {
        let input = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = run(
            Operation::Transpose(TransposeSpec { perm: vec![1, 0] }),
            &[input],
            TensorSpec::new(DType::F32, [3, 2]),
        )
        .unwrap();
        assert_eq!(as_f32(&out), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn broadcast_repeats_rows() {
        let input = f32_tensor(&[3], &[1.0, 2.0, 3.0]);
        let out = run(
            Operation::BroadcastTo(BroadcastToSpec {
                result_shape: Shape::new(vec![2, 3]),
            }),
            &[input],
            TensorSpec::new(DType::F32, [2, 3]),
        )
        .unwrap();
        assert_eq!(as_f32(&out), vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn reduce_sum_over_rows() {
        let input = f32_tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = run(
            Operation::Reduce(ReduceSpec {
                kind: ReduceKind::Sum,
                axes: vec![0],
                keepdims: false,
            }),
            &[input],
            TensorSpec::new(DType::F32, [3]),
        )
        .unwrap();
        assert_eq!(as_f32(&out), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn concat_along_last_axis() {
        let lhs = f32_tensor(&[2, 1], &[1.0, 2.0]);
        let rhs = f32_tensor(&[2, 2], &[3.0, 4.0, 5.0, 6.0]);
        let out = run(
            Operation::Concat(ConcatSpec { axis: 1 }),
            &[lhs, rhs],
            TensorSpec::new(DType::F32, [2, 3]),
        )
        .unwrap();
        assert_eq!(as_f32(&out), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn integer_floordiv_by_zero_is_backend_error() {
        let lhs = i32_tensor(&[2], &[4, 5]);
        let rhs = i32_tensor(&[2], &[2, 0]);
        let err = run(
            Operation::Binary(BinaryOp::FloorDiv),
            &[lhs, rhs],
            TensorSpec::new(DType::I32, [2]),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            BackendError::SpecViolation {
                code: SpecErrorCode::IntegerDivideByZero,
                ..
            }
        ));
    }

    #[test]
    fn integer_mod_follows_divisor_sign() {
        let lhs = i32_tensor(&[2], &[-7, 7]);
        let rhs = i32_tensor(&[2], &[3, -3]);
        let out = run(
            Operation::Binary(BinaryOp::Mod),
            &[lhs.clone(), rhs.clone()],
            TensorSpec::new(DType::I32, [2]),
        )
        .unwrap();
        let fmod = run(
            Operation::Binary(BinaryOp::FMod),
            &[lhs, rhs],
            TensorSpec::new(DType::I32, [2]),
        )
        .unwrap();
        match (&out.data, &fmod.data) {
            (TensorData::I32(m), TensorData::I32(f)) => {
                assert_eq!(m.as_ref(), &[2, -2]);
                assert_eq!(f.as_ref(), &[-1, 1]);
            }
            _ => panic!("expected i32 data"),
        }
    }

    #[test]
    fn rng_is_deterministic_per_seed() {
        let spec = TensorSpec::new(DType::F32, [4]);
        let rng = RngSpec {
            spec: spec.clone(),
            seed: 11,
        };
        let a = op_rng(&spec, &rng, true).unwrap();
        let b = op_rng(&spec, &rng, true).unwrap();
        assert_eq!(as_f32(&a), as_f32(&b));
    }

    #[test]
    fn literal_operands_are_resolved_by_backend() {
        let input = f32_tensor(&[2], &[1.0, 2.0]);
        let literal = TensorLiteral::filled(TensorSpec::new(DType::F32, [2]), 10.0);
        let instruction = Instruction {
            id: ValueId(1),
            op: Operation::Binary(BinaryOp::Add),
            operands: vec![Operand::Value(ValueId(0)), Operand::Literal(literal)],
            output: TensorSpec::new(DType::F32, [2]),
        };
        let out = CpuPortableBackend::new()
            .execute_instruction(&instruction, &[input])
            .unwrap();
        assert_eq!(as_f32(&out), vec![11.0, 12.0]);
    }
}
