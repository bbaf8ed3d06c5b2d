//! Backend contract: dtypes, tensor specs, the operation catalog and the program IR.
//!
//! Everything a numerical engine needs to implement lives here. Programs are flat SSA
//! functions over [`Instruction`]s; primitive operations expect operands whose dtypes and
//! shapes already agree, so dtype promotion and broadcasting are made explicit by the
//! functional layer before an instruction is ever emitted.

use std::{fmt, sync::Arc};

use serde::{ser::SerializeStruct, Deserialize, Serialize};
use thiserror::Error;

/// Scalar element types understood by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Returns `true` for dtypes that participate in arithmetic.
    pub fn is_numeric(self) -> bool {
        self.is_float() || self.is_integer()
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Canonical user-facing name (`float32`, `int64`, ...).
    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::Bool => "bool",
        }
    }

    /// Parses the names accepted in configuration (`float32`, `f32`, `int64`, ...).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "float32" | "f32" => Some(DType::F32),
            "float64" | "f64" => Some(DType::F64),
            "int32" | "i32" => Some(DType::I32),
            "int64" | "i64" => Some(DType::I64),
            "bool" => Some(DType::Bool),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical tensor shape. Rank zero denotes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<usize> {
        self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape::new(dims.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.dims.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<Shape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.shape)
    }
}

/// Dense literal tensor payload in little-endian byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, bytes: Arc<[u8]>) -> Self {
        Self { spec, bytes }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Literal of `spec` with every element set to `value` (converted to the dtype).
    pub fn filled(spec: TensorSpec, value: f64) -> Self {
        let count = spec.element_count();
        let mut bytes = Vec::with_capacity(spec.byte_len());
        for _ in 0..count {
            match spec.dtype {
                DType::F32 => bytes.extend_from_slice(&(value as f32).to_le_bytes()),
                DType::F64 => bytes.extend_from_slice(&value.to_le_bytes()),
                DType::I32 => bytes.extend_from_slice(&(value as i32).to_le_bytes()),
                DType::I64 => bytes.extend_from_slice(&(value as i64).to_le_bytes()),
                DType::Bool => bytes.push(u8::from(value != 0.0)),
            }
        }
        Self::new(spec, Arc::from(bytes))
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("spec", &self.spec)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            spec: TensorSpec,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            spec: helper.spec,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Initialization payload when materialising tensors on a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TensorInit {
    Literal(TensorLiteral),
    Zeroed(TensorSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sign,
    Exp,
    Log,
    Log1p,
    Sin,
    Cos,
    Tanh,
    Sqrt,
    Square,
}

/// Elementwise binary ops. `Div` is true division and only defined for floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    FMod,
    Pow,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOp {
    Less,
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOp {
    And,
    Or,
    Xor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Prod,
    Max,
    Min,
    All,
    Any,
}

/// Reduction over sorted, unique, non-negative axes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastToSpec {
    pub result_shape: Shape,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SliceSpec {
    pub starts: Vec<usize>,
    pub sizes: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Deterministic random generator payload shared by `RngUniform` and `RngNormal`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngSpec {
    pub spec: TensorSpec,
    pub seed: u64,
}

/// Unique identifier for SSA values in a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Operand reference in an instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    Value(ValueId),
    Literal(TensorLiteral),
}

/// The fixed operation catalog every backend implements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Compare(ComparisonOp),
    Logical(LogicalOp),
    Not,
    Select,
    Cast(CastSpec),
    Reduce(ReduceSpec),
    Matmul,
    Reshape(ReshapeSpec),
    Transpose(TransposeSpec),
    BroadcastTo(BroadcastToSpec),
    Slice(SliceSpec),
    Concat(ConcatSpec),
    RngUniform(RngSpec),
    RngNormal(RngSpec),
    StopGradient,
}

impl Operation {
    /// Stable label used in error messages, validation reports and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::Unary(op) => match op {
                UnaryOp::Neg => "neg",
                UnaryOp::Abs => "abs",
                UnaryOp::Sign => "sign",
                UnaryOp::Exp => "exp",
                UnaryOp::Log => "log",
                UnaryOp::Log1p => "log1p",
                UnaryOp::Sin => "sin",
                UnaryOp::Cos => "cos",
                UnaryOp::Tanh => "tanh",
                UnaryOp::Sqrt => "sqrt",
                UnaryOp::Square => "square",
            },
            Operation::Binary(op) => match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div => "div",
                BinaryOp::FloorDiv => "floordiv",
                BinaryOp::Mod => "mod",
                BinaryOp::FMod => "fmod",
                BinaryOp::Pow => "pow",
                BinaryOp::Maximum => "maximum",
                BinaryOp::Minimum => "minimum",
            },
            Operation::Compare(op) => match op {
                ComparisonOp::Less => "less",
                ComparisonOp::LessEqual => "less_equal",
                ComparisonOp::Equal => "equal",
                ComparisonOp::NotEqual => "not_equal",
                ComparisonOp::GreaterEqual => "greater_equal",
                ComparisonOp::Greater => "greater",
            },
            Operation::Logical(op) => match op {
                LogicalOp::And => "logical_and",
                LogicalOp::Or => "logical_or",
                LogicalOp::Xor => "logical_xor",
            },
            Operation::Not => "logical_not",
            Operation::Select => "select",
            Operation::Cast(_) => "cast",
            Operation::Reduce(spec) => match spec.kind {
                ReduceKind::Sum => "reduce_sum",
                ReduceKind::Prod => "reduce_prod",
                ReduceKind::Max => "reduce_max",
                ReduceKind::Min => "reduce_min",
                ReduceKind::All => "reduce_all",
                ReduceKind::Any => "reduce_any",
            },
            Operation::Matmul => "matmul",
            Operation::Reshape(_) => "reshape",
            Operation::Transpose(_) => "transpose",
            Operation::BroadcastTo(_) => "broadcast_to",
            Operation::Slice(_) => "slice",
            Operation::Concat(_) => "concat",
            Operation::RngUniform(_) => "rng_uniform",
            Operation::RngNormal(_) => "rng_normal",
            Operation::StopGradient => "stop_gradient",
        }
    }
}

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<Operand>,
    pub output: TensorSpec,
}

/// Flat program function: parameters, straight-line body, results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub parameters: Vec<TensorSpec>,
    pub parameter_ids: Vec<ValueId>,
    pub body: Vec<Instruction>,
    pub result_ids: Vec<ValueId>,
    pub results: Vec<TensorSpec>,
}

/// Complete program with an entry function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub entry: String,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            functions: Vec::new(),
        }
    }

    pub fn with_functions(mut self, functions: Vec<Function>) -> Self {
        self.functions = functions;
        self
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == self.entry)
    }

    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json_str(src: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(src)
    }

    pub fn to_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "program @{} {{", self.entry)?;
        for function in &self.functions {
            let params = function
                .parameter_ids
                .iter()
                .zip(function.parameters.iter())
                .map(|(id, spec)| format!("{id}: {spec}"))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "  func @{}({params}) {{", function.name)?;
            for instruction in &function.body {
                let operands = instruction
                    .operands
                    .iter()
                    .map(|operand| match operand {
                        Operand::Value(id) => id.to_string(),
                        Operand::Literal(lit) => format!("literal<{}>", lit.spec),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                writeln!(
                    f,
                    "    {} = {}({operands}) : {}",
                    instruction.id,
                    instruction.op.label(),
                    instruction.output
                )?;
            }
            let results = function
                .result_ids
                .iter()
                .map(ValueId::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(f, "    return {results}")?;
            writeln!(f, "  }}")?;
        }
        write!(f, "}}")
    }
}

/// Stable set of contract violations a backend may report.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SpecErrorCode {
    DTypeNotSupported,
    InvalidAttributeValue,
    IntegerDivideByZero,
    NegativeIntegerExponent,
    OperandShapeMismatch,
    Unspecified(&'static str),
}

impl SpecErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecErrorCode::DTypeNotSupported => "SpecError: dtype not supported for op",
            SpecErrorCode::InvalidAttributeValue => "SpecError: invalid attribute value",
            SpecErrorCode::IntegerDivideByZero => "SpecError: integer divide by zero",
            SpecErrorCode::NegativeIntegerExponent => "SpecError: negative integer exponent",
            SpecErrorCode::OperandShapeMismatch => "SpecError: operand shape mismatch",
            SpecErrorCode::Unspecified(code) => code,
        }
    }
}

/// Backend error surfaced unchanged to callers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    #[error("{}{}", .code.as_str(), .detail.as_ref().map(|d| format!(" ({d})")).unwrap_or_default())]
    SpecViolation {
        code: SpecErrorCode,
        detail: Option<String>,
    },
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn spec(code: SpecErrorCode, detail: impl Into<Option<String>>) -> Self {
        BackendError::SpecViolation {
            code,
            detail: detail.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Portable backend trait that evaluates single instructions and whole programs.
pub trait PortableBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`, `"faer"`).
    fn backend_name(&self) -> &str;

    /// Materialises a tensor handle from host initialisation data.
    fn materialize(&self, init: TensorInit) -> BackendResult<Self::TensorHandle>;

    /// Reads back a tensor handle into a dense literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Executes a single instruction given already materialised operand handles.
    ///
    /// `inputs` holds one handle per `Operand::Value`; literal operands are resolved by the
    /// backend itself.
    fn execute_instruction(
        &self,
        instruction: &Instruction,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Self::TensorHandle>;

    /// Executes an entire program starting from the entry function.
    fn run_program(
        &self,
        program: &Program,
        entry_inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
