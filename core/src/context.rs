//! The mutable compilation state threaded through every instruction
//! compiler: namespace tables, the abstract operand stack, the block stack,
//! and the two output byte-code segments. Exclusively owned by the call
//! chain for one unit; instruction compilers mutate it in place.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::encoder::{self, op};
use crate::error::{CompileError, ErrorKind, Result};
use crate::memory::{MemoryMap, ValueType};

// =============================================================================
// Abstract operand stack
// =============================================================================

/// Compile-time facts about one value on the runtime operand stack at this
/// program point. Mirrors the target's implicit value stack item for item.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackItem {
    pub ty: ValueType,
    /// Known to be non-zero (e.g. a non-null address constant).
    pub is_non_zero: bool,
    /// Provably in bounds at compile time; exempt from runtime bounds checks.
    pub is_safe_memory_address: bool,
    /// Known constant value, when the item came from a literal or constant.
    pub constant_value: Option<f64>,
}

impl StackItem {
    pub fn of(ty: ValueType) -> Self {
        StackItem {
            ty,
            is_non_zero: false,
            is_safe_memory_address: false,
            constant_value: None,
        }
    }

    pub fn constant(ty: ValueType, value: f64) -> Self {
        StackItem {
            ty,
            is_non_zero: value != 0.0,
            is_safe_memory_address: false,
            constant_value: Some(value),
        }
    }

    pub fn safe_address(byte_address: u32) -> Self {
        StackItem {
            ty: ValueType::Int,
            is_non_zero: byte_address != 0,
            is_safe_memory_address: true,
            constant_value: Some(byte_address as f64),
        }
    }
}

// =============================================================================
// Block stack
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Module,
    Function,
    Loop,
    If,
    Map,
    Block,
    Init,
}

impl BlockType {
    pub fn name(self) -> &'static str {
        match self {
            BlockType::Module => "module",
            BlockType::Function => "function",
            BlockType::Loop => "loop",
            BlockType::If => "if",
            BlockType::Map => "map",
            BlockType::Block => "block",
            BlockType::Init => "init",
        }
    }

    /// The instruction that opens this block, for error messages.
    pub fn opener(self) -> &'static str {
        match self {
            BlockType::Module => "module",
            BlockType::Function => "function",
            BlockType::Loop => "loop",
            BlockType::If => "if",
            BlockType::Map => "map",
            BlockType::Block => "block",
            BlockType::Init => "init",
        }
    }
}

/// One open structured construct. `entry_depth` snapshots the operand stack
/// depth at open so closers can verify the body is balanced.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub block_type: BlockType,
    pub expected_result: Option<ValueType>,
    pub entry_depth: usize,
    pub else_seen: bool,
}

impl Frame {
    pub fn new(block_type: BlockType, expected_result: Option<ValueType>, depth: usize) -> Self {
        Frame {
            block_type,
            expected_result,
            entry_depth: depth,
            else_seen: false,
        }
    }
}

// =============================================================================
// Namespace
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Local {
    pub index: u32,
    pub ty: ValueType,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Const {
    pub value: f64,
    pub ty: ValueType,
}

/// Per-unit name tables. Locals grow monotonically; indices are never reused
/// within one compilation.
#[derive(Debug, Clone, Default)]
pub struct Namespace {
    pub memory: MemoryMap,
    pub locals: HashMap<String, Local>,
    pub consts: HashMap<String, Const>,
    local_types: Vec<ValueType>,
}

impl Namespace {
    fn add_local(&mut self, name: String, ty: ValueType) -> u32 {
        let index = self.local_types.len() as u32;
        self.local_types.push(ty);
        self.locals.insert(name, Local { index, ty });
        index
    }
}

// =============================================================================
// Map lowering state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MapRow {
    pub key: f64,
    pub value: f64,
}

/// Rows and typing collected between `map` and `mapEnd`.
#[derive(Debug, Clone)]
pub struct MapState {
    pub input_ty: ValueType,
    pub output_ty: ValueType,
    pub rows: Vec<MapRow>,
    pub default: Option<f64>,
}

// =============================================================================
// Output types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentId {
    Init,
    Loop,
}

/// An `i32.const` placeholder awaiting the external linker. The placeholder
/// is a 5-byte padded signed LEB at `offset`, patchable in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relocation {
    pub module: String,
    pub name: String,
    /// True for end-of-region references (`module.name&`).
    pub end: bool,
    pub segment: SegmentId,
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
}

/// Configuration for one compilation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitConfig {
    pub module_id: String,
    /// Base byte offset of this unit's memory region; word aligned.
    pub starting_byte_address: u32,
    /// Total linear memory available to the produced code, in bytes.
    pub memory_byte_size: u32,
}

/// Everything a successful compilation hands back: the memory map for
/// external callers, the local declarations the module-assembly stage needs,
/// and the two byte-code segments it concatenates into function bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledUnit {
    pub module_id: String,
    pub memory: MemoryMap,
    pub locals: Vec<LocalDecl>,
    pub init_segment: Vec<u8>,
    pub loop_segment: Vec<u8>,
    pub relocations: Vec<Relocation>,
    pub memory_byte_size: u32,
}

// =============================================================================
// Compilation context
// =============================================================================

#[derive(Debug)]
pub struct CompilationContext {
    pub module_id: String,
    pub namespace: Namespace,
    pub stack: Vec<StackItem>,
    pub block_stack: Vec<Frame>,
    pub init_segment: Vec<u8>,
    pub loop_segment: Vec<u8>,
    pub starting_byte_address: u32,
    pub memory_byte_size: u32,
    pub map: Option<MapState>,
    pub relocations: Vec<Relocation>,
    line: u32,
    temp_counter: u32,
}

impl CompilationContext {
    pub fn new(config: &UnitConfig) -> Self {
        CompilationContext {
            module_id: config.module_id.clone(),
            namespace: Namespace::default(),
            stack: Vec::new(),
            block_stack: vec![Frame::new(BlockType::Module, None, 0)],
            init_segment: Vec::new(),
            loop_segment: Vec::new(),
            starting_byte_address: config.starting_byte_address,
            memory_byte_size: config.memory_byte_size,
            map: None,
            relocations: Vec::new(),
            line: 0,
            temp_counter: 0,
        }
    }

    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    /// Wrap a taxonomy entry with the current line and module.
    pub fn err(&self, kind: ErrorKind) -> CompileError {
        CompileError {
            kind,
            line: self.line,
            module: self.module_id.clone(),
        }
    }

    // -------------------------------------------------------------------------
    // Block stack
    // -------------------------------------------------------------------------

    pub fn top_block(&self) -> &Frame {
        // The MODULE frame is never popped, so the stack is never empty.
        self.block_stack.last().unwrap()
    }

    pub fn top_block_mut(&mut self) -> &mut Frame {
        self.block_stack.last_mut().unwrap()
    }

    pub fn push_frame(&mut self, block_type: BlockType, expected: Option<ValueType>) {
        let depth = self.stack.len();
        self.block_stack.push(Frame::new(block_type, expected, depth));
    }

    /// Pop the top frame, which must match `expected`; `closer` names the
    /// closing instruction for the error message.
    pub fn pop_frame(&mut self, expected: BlockType, closer: &str) -> Result<Frame> {
        let top = *self.top_block();
        if top.block_type != expected || top.block_type == BlockType::Module {
            return Err(self.err(ErrorKind::MissingBlockStart {
                closer: closer.to_string(),
                opener: expected.opener().to_string(),
            }));
        }
        Ok(self.block_stack.pop().unwrap())
    }

    /// True while any INIT frame is open; routes emission.
    pub fn in_init(&self) -> bool {
        self.block_stack
            .iter()
            .any(|f| f.block_type == BlockType::Init)
    }

    // -------------------------------------------------------------------------
    // Operand stack
    // -------------------------------------------------------------------------

    pub fn push_item(&mut self, item: StackItem) {
        self.stack.push(item);
    }

    pub fn pop_item(&mut self, instruction: &str) -> Result<StackItem> {
        self.stack.pop().ok_or_else(|| {
            self.err(ErrorKind::MissingOperands {
                instruction: instruction.to_string(),
                needed: 1,
                found: 0,
            })
        })
    }

    pub fn peek_item(&self, instruction: &str) -> Result<&StackItem> {
        self.stack.last().ok_or_else(|| {
            self.err(ErrorKind::MissingOperands {
                instruction: instruction.to_string(),
                needed: 1,
                found: 0,
            })
        })
    }

    // -------------------------------------------------------------------------
    // Locals
    // -------------------------------------------------------------------------

    pub fn declare_local(&mut self, name: &str, ty: ValueType) -> Result<u32> {
        if self.namespace.locals.contains_key(name)
            || self.namespace.consts.contains_key(name)
            || self.namespace.memory.contains(name)
        {
            return Err(self.err(ErrorKind::Redeclared {
                name: name.to_string(),
            }));
        }
        Ok(self.namespace.add_local(name.to_string(), ty))
    }

    /// Allocate a fresh unnamed temporary. Temporaries are never reused
    /// within one compilation.
    pub fn alloc_temp(&mut self, ty: ValueType) -> u32 {
        let name = format!("#tmp{}", self.temp_counter);
        self.temp_counter += 1;
        self.namespace.add_local(name, ty)
    }

    pub fn local_decls(&self) -> Vec<LocalDecl> {
        let mut by_index: Vec<(&String, &Local)> = self.namespace.locals.iter().collect();
        by_index.sort_by_key(|(_, local)| local.index);
        by_index
            .into_iter()
            .map(|(name, local)| LocalDecl {
                name: name.clone(),
                ty: local.ty,
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Emission
    // -------------------------------------------------------------------------

    fn segment_mut(&mut self) -> &mut Vec<u8> {
        if self.in_init() {
            &mut self.init_segment
        } else {
            &mut self.loop_segment
        }
    }

    pub fn current_segment(&self) -> SegmentId {
        if self.in_init() {
            SegmentId::Init
        } else {
            SegmentId::Loop
        }
    }

    /// The single emit primitive: append raw bytes to whichever segment the
    /// block stack routes to.
    pub fn emit(&mut self, bytes: &[u8]) {
        self.segment_mut().extend_from_slice(bytes);
    }

    pub fn emit_op(&mut self, opcode: u8) {
        self.segment_mut().push(opcode);
    }

    pub fn emit_uleb(&mut self, value: u32) {
        let seg = self.segment_mut();
        encoder::uleb(value as u64, seg);
    }

    pub fn emit_i32_const(&mut self, value: i32) {
        let seg = self.segment_mut();
        seg.push(op::I32_CONST);
        encoder::sleb(value as i64, seg);
    }

    pub fn emit_f32_const(&mut self, value: f32) {
        let seg = self.segment_mut();
        seg.push(op::F32_CONST);
        encoder::f32_bytes(value, seg);
    }

    pub fn emit_f64_const(&mut self, value: f64) {
        let seg = self.segment_mut();
        seg.push(op::F64_CONST);
        encoder::f64_bytes(value, seg);
    }

    /// Typed constant from an f64-carried value, as used by map rows,
    /// defaults and declared constants.
    pub fn emit_const_of(&mut self, ty: ValueType, value: f64) {
        match ty {
            ValueType::Int => self.emit_i32_const(value as i64 as i32),
            ValueType::Float => self.emit_f32_const(value as f32),
            ValueType::Float64 => self.emit_f64_const(value),
        }
    }

    pub fn emit_local_get(&mut self, index: u32) {
        self.emit_op(op::LOCAL_GET);
        self.emit_uleb(index);
    }

    pub fn emit_local_set(&mut self, index: u32) {
        self.emit_op(op::LOCAL_SET);
        self.emit_uleb(index);
    }

    /// Memory access opcode with its alignment and offset immediates.
    pub fn emit_access(&mut self, opcode: u8, align_log2: u32) {
        self.emit_op(opcode);
        self.emit_uleb(align_log2);
        self.emit_uleb(0);
    }

    /// Emit an `i32.const` whose immediate is a 5-byte padded placeholder,
    /// and record a relocation for the external linker to patch.
    pub fn emit_reloc_const(&mut self, module: String, name: String, end: bool) {
        let segment = self.current_segment();
        self.emit_op(op::I32_CONST);
        let offset = match segment {
            SegmentId::Init => self.init_segment.len(),
            SegmentId::Loop => self.loop_segment.len(),
        };
        let seg = self.segment_mut();
        encoder::sleb_padded(0, 5, seg);
        self.relocations.push(Relocation {
            module,
            name,
            end,
            segment,
            offset,
        });
    }

    // -------------------------------------------------------------------------
    // Finalization
    // -------------------------------------------------------------------------

    pub fn finish(self) -> Result<CompiledUnit> {
        if self.block_stack.len() != 1 {
            let open = self.top_block().block_type;
            let err = self.err(ErrorKind::Argument {
                instruction: "<end of unit>".to_string(),
                message: format!("unclosed '{}' block", open.name()),
            });
            return Err(err);
        }
        if !self.stack.is_empty() {
            let err = self.err(ErrorKind::Argument {
                instruction: "<end of unit>".to_string(),
                message: format!("{} value(s) left on the operand stack", self.stack.len()),
            });
            return Err(err);
        }
        Ok(CompiledUnit {
            module_id: self.module_id.clone(),
            memory: self.namespace.memory.clone(),
            locals: self.local_decls(),
            init_segment: self.init_segment,
            loop_segment: self.loop_segment,
            relocations: self.relocations,
            memory_byte_size: self.memory_byte_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::decode_sleb;

    fn ctx() -> CompilationContext {
        CompilationContext::new(&UnitConfig {
            module_id: "test".to_string(),
            starting_byte_address: 0,
            memory_byte_size: 65536,
        })
    }

    #[test]
    fn test_emit_routes_to_init_inside_init_frame() {
        let mut c = ctx();
        c.emit_op(0x01);
        c.push_frame(BlockType::Init, None);
        c.emit_op(0x02);
        c.push_frame(BlockType::Loop, None);
        c.emit_op(0x03); // still inside init, nested loop does not reroute
        c.block_stack.pop();
        c.pop_frame(BlockType::Init, "initEnd").unwrap();
        c.emit_op(0x04);
        assert_eq!(c.init_segment, [0x02, 0x03]);
        assert_eq!(c.loop_segment, [0x01, 0x04]);
    }

    #[test]
    fn test_pop_frame_mismatch_is_missing_block_start() {
        let mut c = ctx();
        c.push_frame(BlockType::Block, None);
        let err = c.pop_frame(BlockType::Loop, "loopEnd").unwrap_err();
        assert_eq!(err.code(), "MISSING_BLOCK_START");
    }

    #[test]
    fn test_module_frame_cannot_be_popped() {
        let mut c = ctx();
        let err = c.pop_frame(BlockType::Module, "end").unwrap_err();
        assert_eq!(err.code(), "MISSING_BLOCK_START");
    }

    #[test]
    fn test_temps_grow_monotonically_and_are_listed_in_order() {
        let mut c = ctx();
        c.declare_local("a", ValueType::Float).unwrap();
        let t0 = c.alloc_temp(ValueType::Int);
        let t1 = c.alloc_temp(ValueType::Float64);
        assert_eq!(t0, 1);
        assert_eq!(t1, 2);
        let decls = c.local_decls();
        assert_eq!(decls.len(), 3);
        assert_eq!(decls[0].name, "a");
        assert_eq!(decls[1].ty, ValueType::Int);
        assert_eq!(decls[2].ty, ValueType::Float64);
    }

    #[test]
    fn test_redeclared_local_is_rejected() {
        let mut c = ctx();
        c.declare_local("x", ValueType::Int).unwrap();
        let err = c.declare_local("x", ValueType::Int).unwrap_err();
        assert_eq!(err.code(), "REDECLARED_IDENTIFIER");
    }

    #[test]
    fn test_reloc_const_records_patchable_placeholder() {
        let mut c = ctx();
        c.emit_op(0x01);
        c.emit_reloc_const("osc".to_string(), "freq".to_string(), false);
        let reloc = &c.relocations[0];
        assert_eq!(reloc.segment, SegmentId::Loop);
        assert_eq!(reloc.offset, 2); // after the filler byte and the opcode
        let placeholder = &c.loop_segment[reloc.offset..reloc.offset + 5];
        assert_eq!(decode_sleb(placeholder).unwrap(), (0, 5));
    }

    #[test]
    fn test_finish_rejects_unclosed_block_and_leftover_operands() {
        let mut c = ctx();
        c.push_frame(BlockType::Loop, None);
        assert!(c.finish().is_err());

        let mut c = ctx();
        c.push_item(StackItem::of(ValueType::Int));
        assert!(c.finish().is_err());
    }
}
