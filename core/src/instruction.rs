//! The fixed instruction catalog, the per-instruction validation
//! descriptors, and the dispatcher that drives one compilation unit.
//!
//! Every instruction is a variant of a closed enum; the dispatcher is an
//! exhaustive match, so catalog coverage is checked at compile time. Before
//! an instruction body runs, one shared validator interprets its declarative
//! descriptor: legal block scopes and required operand count/types.

use serde::{Deserialize, Serialize};

use crate::compilers;
use crate::context::{BlockType, CompilationContext, CompiledUnit, UnitConfig};
use crate::encoder::op;
use crate::error::{ErrorKind, Result};
use crate::memory::ValueType;

// =============================================================================
// Input records
// =============================================================================

/// One argument of an instruction record: a numeric literal with its
/// integer/float flag, or an identifier to be classified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Argument {
    Integer(i64),
    Float(f64),
    Identifier(String),
}

impl Argument {
    pub fn identifier(&self) -> Option<&str> {
        match self {
            Argument::Identifier(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value and its integer flag, when the argument is a literal.
    pub fn number(&self) -> Option<(f64, bool)> {
        match self {
            Argument::Integer(v) => Some((*v as f64, true)),
            Argument::Float(v) => Some((*v, false)),
            Argument::Identifier(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Argument::Integer(v) => v.to_string(),
            Argument::Float(v) => v.to_string(),
            Argument::Identifier(s) => s.clone(),
        }
    }
}

/// What the upstream parser feeds us, one line at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionRecord {
    pub line_number: u32,
    pub instruction: String,
    #[serde(default)]
    pub arguments: Vec<Argument>,
}

impl InstructionRecord {
    pub fn new(line_number: u32, instruction: &str, arguments: Vec<Argument>) -> Self {
        InstructionRecord {
            line_number,
            instruction: instruction.to_string(),
            arguments,
        }
    }
}

// =============================================================================
// Catalog
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    // Declarations
    Int,
    IntPtr,
    IntPtrPtr,
    Float,
    FloatPtr,
    FloatPtrPtr,
    Float64,
    Float64Ptr,
    Float64PtrPtr,
    Buf8s,
    Buf8u,
    Buf16s,
    Buf16u,
    Buf32,
    BufF32,
    BufF64,
    Const,
    Const64,
    Local,
    LocalF,
    Local64,
    // Value stack
    Push,
    Push64,
    Set,
    Drop,
    // Arithmetic / comparison / logic
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Min,
    Max,
    Neg,
    Abs,
    Floor,
    Ceil,
    Sqrt,
    Eqz,
    ToInt,
    ToFloat,
    ToFloat64,
    // Memory access
    Load,
    Load8s,
    Load8u,
    Load16s,
    Load16u,
    LoadF,
    LoadF64,
    Store,
    Store8,
    Store16,
    // Control flow
    Block,
    BlockEnd,
    Loop,
    LoopEnd,
    If,
    Else,
    IfEnd,
    Skip,
    SkipIf,
    Function,
    FunctionEnd,
    Init,
    InitEnd,
    // Map
    Map,
    Row,
    MapDefault,
    MapEnd,
}

impl Instruction {
    pub fn from_name(name: &str) -> Option<Instruction> {
        use Instruction::*;
        Some(match name {
            "int" => Int,
            "int*" => IntPtr,
            "int**" => IntPtrPtr,
            "float" => Float,
            "float*" => FloatPtr,
            "float**" => FloatPtrPtr,
            "float64" => Float64,
            "float64*" => Float64Ptr,
            "float64**" => Float64PtrPtr,
            "buf8s" => Buf8s,
            "buf8u" => Buf8u,
            "buf16s" => Buf16s,
            "buf16u" => Buf16u,
            "buf32" => Buf32,
            "buff32" => BufF32,
            "buff64" => BufF64,
            "const" => Const,
            "const64" => Const64,
            "local" => Local,
            "localf" => LocalF,
            "local64" => Local64,
            "push" => Push,
            "push64" => Push64,
            "set" => Set,
            "drop" => Drop,
            "add" => Add,
            "sub" => Sub,
            "mul" => Mul,
            "div" => Div,
            "rem" => Rem,
            "and" => And,
            "or" => Or,
            "xor" => Xor,
            "shl" => Shl,
            "shr" => Shr,
            "eq" => Eq,
            "ne" => Ne,
            "lt" => Lt,
            "gt" => Gt,
            "le" => Le,
            "ge" => Ge,
            "min" => Min,
            "max" => Max,
            "neg" => Neg,
            "abs" => Abs,
            "floor" => Floor,
            "ceil" => Ceil,
            "sqrt" => Sqrt,
            "eqz" => Eqz,
            "toint" => ToInt,
            "tofloat" => ToFloat,
            "tofloat64" => ToFloat64,
            "load" => Load,
            "load8s" => Load8s,
            "load8u" => Load8u,
            "load16s" => Load16s,
            "load16u" => Load16u,
            "loadf" => LoadF,
            "loadf64" => LoadF64,
            "store" => Store,
            "store8" => Store8,
            "store16" => Store16,
            "block" => Block,
            "blockEnd" => BlockEnd,
            "loop" => Loop,
            "loopEnd" => LoopEnd,
            "if" => If,
            "else" => Else,
            "ifEnd" => IfEnd,
            "skip" => Skip,
            "skipIf" => SkipIf,
            "function" => Function,
            "functionEnd" => FunctionEnd,
            "init" => Init,
            "initEnd" => InitEnd,
            "map" => Map,
            "row" => Row,
            "mapDefault" => MapDefault,
            "mapEnd" => MapEnd,
            _ => return None,
        })
    }
}

// =============================================================================
// Validation descriptors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandReq {
    Any,
    Int,
}

#[derive(Debug, Clone, Copy)]
pub enum ScopeRule {
    /// Legal when the top block frame is one of these.
    OneOf(&'static [BlockType]),
    /// A block closer: the top frame must be exactly this type, otherwise
    /// the error is a missing block start, not a scope violation.
    Closer(BlockType),
}

#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub scope: ScopeRule,
    /// Required operand types, top of stack first.
    pub operands: &'static [OperandReq],
}

const MODULE_SCOPE: &[BlockType] = &[BlockType::Module];
const BODY_SCOPE: &[BlockType] = &[
    BlockType::Module,
    BlockType::Function,
    BlockType::Loop,
    BlockType::If,
    BlockType::Block,
    BlockType::Init,
];
const LOCAL_SCOPE: &[BlockType] = &[BlockType::Module, BlockType::Function, BlockType::Init];
const MAP_SCOPE: &[BlockType] = &[BlockType::Map];

const NO_OPERANDS: &[OperandReq] = &[];
const ONE_ANY: &[OperandReq] = &[OperandReq::Any];
const ONE_INT: &[OperandReq] = &[OperandReq::Int];
const TWO_ANY: &[OperandReq] = &[OperandReq::Any, OperandReq::Any];
const TWO_INT: &[OperandReq] = &[OperandReq::Int, OperandReq::Int];
const VALUE_THEN_ADDRESS: &[OperandReq] = &[OperandReq::Any, OperandReq::Int];

pub fn descriptor(instruction: Instruction) -> Descriptor {
    use Instruction::*;
    let (scope, operands): (ScopeRule, &'static [OperandReq]) = match instruction {
        Int | IntPtr | IntPtrPtr | Float | FloatPtr | FloatPtrPtr | Float64 | Float64Ptr
        | Float64PtrPtr | Buf8s | Buf8u | Buf16s | Buf16u | Buf32 | BufF32 | BufF64 | Const
        | Const64 => (ScopeRule::OneOf(MODULE_SCOPE), NO_OPERANDS),
        Local | LocalF | Local64 => (ScopeRule::OneOf(LOCAL_SCOPE), NO_OPERANDS),

        Push | Push64 => (ScopeRule::OneOf(BODY_SCOPE), NO_OPERANDS),
        Set | Drop => (ScopeRule::OneOf(BODY_SCOPE), ONE_ANY),

        Add | Sub | Mul | Div | Eq | Ne | Lt | Gt | Le | Ge | Min | Max => {
            (ScopeRule::OneOf(BODY_SCOPE), TWO_ANY)
        }
        Rem | And | Or | Xor | Shl | Shr => (ScopeRule::OneOf(BODY_SCOPE), TWO_INT),
        Neg | Abs | Floor | Ceil | Sqrt | ToInt | ToFloat | ToFloat64 => {
            (ScopeRule::OneOf(BODY_SCOPE), ONE_ANY)
        }
        Eqz => (ScopeRule::OneOf(BODY_SCOPE), ONE_INT),

        Load | Load8s | Load8u | Load16s | Load16u | LoadF | LoadF64 => {
            (ScopeRule::OneOf(BODY_SCOPE), ONE_INT)
        }
        Store => (ScopeRule::OneOf(BODY_SCOPE), VALUE_THEN_ADDRESS),
        Store8 | Store16 => (ScopeRule::OneOf(BODY_SCOPE), TWO_INT),

        Block | Loop => (ScopeRule::OneOf(BODY_SCOPE), NO_OPERANDS),
        BlockEnd => (ScopeRule::Closer(BlockType::Block), NO_OPERANDS),
        LoopEnd => (ScopeRule::Closer(BlockType::Loop), NO_OPERANDS),
        If => (ScopeRule::OneOf(BODY_SCOPE), ONE_INT),
        Else | IfEnd => (ScopeRule::Closer(BlockType::If), NO_OPERANDS),
        Skip => (ScopeRule::OneOf(BODY_SCOPE), NO_OPERANDS),
        SkipIf => (ScopeRule::OneOf(BODY_SCOPE), ONE_INT),
        Function => (ScopeRule::OneOf(MODULE_SCOPE), NO_OPERANDS),
        FunctionEnd => (ScopeRule::Closer(BlockType::Function), NO_OPERANDS),
        Init => (ScopeRule::OneOf(MODULE_SCOPE), NO_OPERANDS),
        InitEnd => (ScopeRule::Closer(BlockType::Init), NO_OPERANDS),

        Map => (ScopeRule::OneOf(BODY_SCOPE), ONE_ANY),
        Row | MapDefault => (ScopeRule::OneOf(MAP_SCOPE), NO_OPERANDS),
        MapEnd => (ScopeRule::Closer(BlockType::Map), ONE_ANY),
    };
    Descriptor { scope, operands }
}

/// The shared validation routine run before every instruction body.
fn validate(ctx: &CompilationContext, instruction: Instruction, name: &str) -> Result<()> {
    let desc = descriptor(instruction);
    let top = ctx.top_block().block_type;

    match desc.scope {
        ScopeRule::OneOf(allowed) => {
            if !allowed.contains(&top) {
                return Err(ctx.err(ErrorKind::Scope {
                    instruction: name.to_string(),
                    found: top.name().to_string(),
                }));
            }
        }
        ScopeRule::Closer(expected) => {
            if top != expected {
                return Err(ctx.err(ErrorKind::MissingBlockStart {
                    closer: name.to_string(),
                    opener: expected.opener().to_string(),
                }));
            }
        }
    }

    // Operands below the current frame's entry depth belong to the
    // enclosing scope and are out of reach; a closer hands its values to
    // that enclosing scope, so it checks against the parent's floor.
    let floor = match desc.scope {
        ScopeRule::OneOf(_) => ctx.top_block().entry_depth,
        ScopeRule::Closer(_) => ctx.block_stack[ctx.block_stack.len() - 2].entry_depth,
    };
    let needed = desc.operands.len();
    let found = ctx.stack.len() - floor;
    if found < needed {
        return Err(ctx.err(ErrorKind::MissingOperands {
            instruction: name.to_string(),
            needed,
            found,
        }));
    }
    for (position, req) in desc.operands.iter().enumerate() {
        let item = &ctx.stack[ctx.stack.len() - 1 - position];
        if *req == OperandReq::Int && item.ty != ValueType::Int {
            return Err(ctx.err(ErrorKind::OperandType {
                instruction: name.to_string(),
                position,
                expected: "int".to_string(),
                found: item.ty.name().to_string(),
            }));
        }
    }
    Ok(())
}

// =============================================================================
// Dispatch
// =============================================================================

/// Look the instruction up, validate it against the current context, and run
/// its compiler. The context is mutated in place.
pub fn dispatch(ctx: &mut CompilationContext, record: &InstructionRecord) -> Result<()> {
    ctx.set_line(record.line_number);

    let name = record.instruction.as_str();
    let instruction = Instruction::from_name(name).ok_or_else(|| {
        ctx.err(ErrorKind::UnknownInstruction {
            name: name.to_string(),
        })
    })?;

    validate(ctx, instruction, name)?;

    use Instruction::*;
    use ValueType as V;
    let args = &record.arguments;
    match instruction {
        Int => compilers::declare(ctx, name, args, V::Int, 0),
        IntPtr => compilers::declare(ctx, name, args, V::Int, 1),
        IntPtrPtr => compilers::declare(ctx, name, args, V::Int, 2),
        Float => compilers::declare(ctx, name, args, V::Float, 0),
        FloatPtr => compilers::declare(ctx, name, args, V::Float, 1),
        FloatPtrPtr => compilers::declare(ctx, name, args, V::Float, 2),
        Float64 => compilers::declare(ctx, name, args, V::Float64, 0),
        Float64Ptr => compilers::declare(ctx, name, args, V::Float64, 1),
        Float64PtrPtr => compilers::declare(ctx, name, args, V::Float64, 2),
        Buf8s => compilers::declare_buffer(ctx, name, args, V::Int, 1, false),
        Buf8u => compilers::declare_buffer(ctx, name, args, V::Int, 1, true),
        Buf16s => compilers::declare_buffer(ctx, name, args, V::Int, 2, false),
        Buf16u => compilers::declare_buffer(ctx, name, args, V::Int, 2, true),
        Buf32 => compilers::declare_buffer(ctx, name, args, V::Int, 4, false),
        BufF32 => compilers::declare_buffer(ctx, name, args, V::Float, 4, false),
        BufF64 => compilers::declare_buffer(ctx, name, args, V::Float64, 8, false),
        Const => compilers::declare_const(ctx, name, args, false),
        Const64 => compilers::declare_const(ctx, name, args, true),
        Local => compilers::declare_local(ctx, name, args, V::Int),
        LocalF => compilers::declare_local(ctx, name, args, V::Float),
        Local64 => compilers::declare_local(ctx, name, args, V::Float64),

        Push => compilers::push(ctx, name, args),
        Push64 => compilers::push64(ctx, name, args),
        Set => compilers::set(ctx, name, args),
        Drop => compilers::drop_top(ctx),

        Add => compilers::binary(ctx, name, [op::I32_ADD, op::F32_ADD, op::F64_ADD], false),
        Sub => compilers::binary(ctx, name, [op::I32_SUB, op::F32_SUB, op::F64_SUB], false),
        Mul => compilers::binary(ctx, name, [op::I32_MUL, op::F32_MUL, op::F64_MUL], false),
        Div => compilers::binary(ctx, name, [op::I32_DIV_S, op::F32_DIV, op::F64_DIV], false),
        Rem => compilers::binary_int(ctx, op::I32_REM_S),
        And => compilers::binary_int(ctx, op::I32_AND),
        Or => compilers::binary_int(ctx, op::I32_OR),
        Xor => compilers::binary_int(ctx, op::I32_XOR),
        Shl => compilers::binary_int(ctx, op::I32_SHL),
        Shr => compilers::binary_int(ctx, op::I32_SHR_S),
        Eq => compilers::binary(ctx, name, [op::I32_EQ, op::F32_EQ, op::F64_EQ], true),
        Ne => compilers::binary(ctx, name, [op::I32_NE, op::F32_NE, op::F64_NE], true),
        Lt => compilers::binary(ctx, name, [op::I32_LT_S, op::F32_LT, op::F64_LT], true),
        Gt => compilers::binary(ctx, name, [op::I32_GT_S, op::F32_GT, op::F64_GT], true),
        Le => compilers::binary(ctx, name, [op::I32_LE_S, op::F32_LE, op::F64_LE], true),
        Ge => compilers::binary(ctx, name, [op::I32_GE_S, op::F32_GE, op::F64_GE], true),
        Min => compilers::binary_float(ctx, name, op::F32_MIN, op::F64_MIN),
        Max => compilers::binary_float(ctx, name, op::F32_MAX, op::F64_MAX),
        Neg => compilers::unary_float(ctx, name, op::F32_NEG, op::F64_NEG),
        Abs => compilers::unary_float(ctx, name, op::F32_ABS, op::F64_ABS),
        Floor => compilers::unary_float(ctx, name, op::F32_FLOOR, op::F64_FLOOR),
        Ceil => compilers::unary_float(ctx, name, op::F32_CEIL, op::F64_CEIL),
        Sqrt => compilers::unary_float(ctx, name, op::F32_SQRT, op::F64_SQRT),
        Eqz => compilers::eqz(ctx),
        ToInt => compilers::convert(ctx, name, V::Int),
        ToFloat => compilers::convert(ctx, name, V::Float),
        ToFloat64 => compilers::convert(ctx, name, V::Float64),

        Load => compilers::load(ctx, op::I32_LOAD, V::Int, 2),
        Load8s => compilers::load(ctx, op::I32_LOAD8_S, V::Int, 0),
        Load8u => compilers::load(ctx, op::I32_LOAD8_U, V::Int, 0),
        Load16s => compilers::load(ctx, op::I32_LOAD16_S, V::Int, 1),
        Load16u => compilers::load(ctx, op::I32_LOAD16_U, V::Int, 1),
        LoadF => compilers::load(ctx, op::F32_LOAD, V::Float, 2),
        LoadF64 => compilers::load(ctx, op::F64_LOAD, V::Float64, 3),
        Store => compilers::store(ctx, name, None),
        Store8 => compilers::store(ctx, name, Some((op::I32_STORE8, 0))),
        Store16 => compilers::store(ctx, name, Some((op::I32_STORE16, 1))),

        Block => compilers::block_open(ctx),
        BlockEnd => compilers::block_close(ctx, name),
        Loop => compilers::loop_open(ctx),
        LoopEnd => compilers::loop_close(ctx, name),
        If => compilers::if_open(ctx, name, args),
        Else => compilers::if_else(ctx, name),
        IfEnd => compilers::if_close(ctx, name),
        Skip => compilers::skip(ctx, name, false),
        SkipIf => compilers::skip(ctx, name, true),
        Function => compilers::function_open(ctx, name, args),
        FunctionEnd => compilers::function_close(ctx, name),
        Init => compilers::init_open(ctx),
        InitEnd => compilers::init_close(ctx, name),

        Map => compilers::map_open(ctx, name, args),
        Row => compilers::map_row(ctx, name, args),
        MapDefault => compilers::map_default(ctx, name, args),
        MapEnd => compilers::map_end(ctx, name),
    }
}

// =============================================================================
// Driver
// =============================================================================

/// Compile one unit: dispatch every record in order through validation and
/// its instruction compiler, then finalize. Fatal on the first error.
pub fn compile_unit(config: &UnitConfig, records: &[InstructionRecord]) -> Result<CompiledUnit> {
    let mut ctx = CompilationContext::new(config);
    for record in records {
        dispatch(&mut ctx, record)?;
    }
    ctx.finish()
}
