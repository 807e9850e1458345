//! Instruction bodies. Each function runs after the shared validator has
//! checked scope and operand preconditions; it mutates the context in place,
//! emitting bytes through the context's routing primitive and keeping the
//! abstract operand stack in sync with the emitted code.

use crate::context::{BlockType, CompilationContext, Const, MapRow, MapState, StackItem};
use crate::encoder::{blocktype, op};
use crate::error::{ErrorKind, Result};
use crate::ident::{self, Classified};
use crate::instruction::Argument;
use crate::memory::{CellSpec, MemoryEntry, ValueType};

// =============================================================================
// Argument helpers
// =============================================================================

fn bad_arg(
    ctx: &CompilationContext,
    name: &str,
    message: impl Into<String>,
) -> crate::error::CompileError {
    ctx.err(ErrorKind::Argument {
        instruction: name.to_string(),
        message: message.into(),
    })
}

fn require_arg<'a>(
    ctx: &CompilationContext,
    name: &str,
    args: &'a [Argument],
    index: usize,
) -> Result<&'a Argument> {
    args.get(index)
        .ok_or_else(|| bad_arg(ctx, name, format!("missing argument {}", index + 1)))
}

fn require_ident<'a>(
    ctx: &CompilationContext,
    name: &str,
    args: &'a [Argument],
    index: usize,
) -> Result<&'a str> {
    require_arg(ctx, name, args, index)?
        .identifier()
        .ok_or_else(|| bad_arg(ctx, name, format!("argument {} must be an identifier", index + 1)))
}

fn require_number(
    ctx: &CompilationContext,
    name: &str,
    args: &[Argument],
    index: usize,
) -> Result<(f64, bool)> {
    require_arg(ctx, name, args, index)?
        .number()
        .ok_or_else(|| bad_arg(ctx, name, format!("argument {} must be a number", index + 1)))
}

fn is_plain_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `int` / `float` / `float64` as a type argument.
fn type_arg(ctx: &CompilationContext, name: &str, text: &str) -> Result<ValueType> {
    match text {
        "int" => Ok(ValueType::Int),
        "float" => Ok(ValueType::Float),
        "float64" => Ok(ValueType::Float64),
        other => Err(bad_arg(
            ctx,
            name,
            format!("'{other}' is not a type (expected int, float or float64)"),
        )),
    }
}

fn optional_type_arg(
    ctx: &CompilationContext,
    name: &str,
    args: &[Argument],
) -> Result<Option<ValueType>> {
    match args.first() {
        None => Ok(None),
        Some(arg) => {
            let text = arg
                .identifier()
                .ok_or_else(|| bad_arg(ctx, name, "result type must be an identifier"))?;
            type_arg(ctx, name, text).map(Some)
        }
    }
}

/// A literal or declared constant, as map rows and defaults accept.
fn const_or_literal(
    ctx: &CompilationContext,
    name: &str,
    arg: &Argument,
) -> Result<(f64, ValueType)> {
    if let Some((value, is_integer)) = arg.number() {
        let ty = if is_integer {
            ValueType::Int
        } else {
            ValueType::Float
        };
        return Ok((value, ty));
    }
    let ident = arg.identifier().unwrap_or_default();
    match ctx.namespace.consts.get(ident) {
        Some(c) => Ok((c.value, c.ty)),
        None => Err(ctx.err(ErrorKind::Undeclared {
            name: ident.to_string(),
        })),
    }
}

fn check_fresh_name(ctx: &CompilationContext, name: &str, id: &str) -> Result<()> {
    if !is_plain_name(id) {
        return Err(bad_arg(ctx, name, format!("'{id}' is not a valid name")));
    }
    if ctx.namespace.memory.contains(id)
        || ctx.namespace.locals.contains_key(id)
        || ctx.namespace.consts.contains_key(id)
    {
        return Err(ctx.err(ErrorKind::Redeclared {
            name: id.to_string(),
        }));
    }
    Ok(())
}

// =============================================================================
// Declarations
// =============================================================================

pub fn declare(
    ctx: &mut CompilationContext,
    name: &str,
    args: &[Argument],
    base: ValueType,
    pointer_depth: u8,
) -> Result<()> {
    let id = require_ident(ctx, name, args, 0)?.to_string();
    check_fresh_name(ctx, name, &id)?;

    let spec = if pointer_depth > 0 {
        CellSpec::pointer(base, pointer_depth)
    } else {
        let default = match args.get(1) {
            None => None,
            Some(arg) => match arg.number() {
                Some((value, _)) => Some(value),
                None => return Err(bad_arg(ctx, name, "default value must be a number")),
            },
        };
        CellSpec::scalar(base, default)
    };

    let base_address = ctx.starting_byte_address;
    if let Some(kind) = ctx.namespace.memory.allocate(&id, spec, base_address).err() {
        return Err(ctx.err(kind));
    }
    Ok(())
}

pub fn declare_buffer(
    ctx: &mut CompilationContext,
    name: &str,
    args: &[Argument],
    base: ValueType,
    element_word_size: u32,
    is_unsigned: bool,
) -> Result<()> {
    let id = require_ident(ctx, name, args, 0)?.to_string();
    check_fresh_name(ctx, name, &id)?;

    let (count, is_integer) = require_number(ctx, name, args, 1)?;
    if !is_integer || count < 1.0 {
        return Err(bad_arg(ctx, name, "element count must be a positive integer"));
    }
    // An `as u32` cast would saturate silently for absurd counts; bound the
    // region against the unit's linear memory before converting.
    let max_elements = ctx.memory_byte_size / element_word_size;
    if count > max_elements as f64 {
        return Err(bad_arg(
            ctx,
            name,
            format!("{count} elements of {element_word_size} byte(s) exceed linear memory"),
        ));
    }

    let spec = CellSpec::buffer(base, count as u32, element_word_size, is_unsigned);
    let base_address = ctx.starting_byte_address;
    if let Some(kind) = ctx.namespace.memory.allocate(&id, spec, base_address).err() {
        return Err(ctx.err(kind));
    }
    Ok(())
}

pub fn declare_const(
    ctx: &mut CompilationContext,
    name: &str,
    args: &[Argument],
    force_float64: bool,
) -> Result<()> {
    let id = require_ident(ctx, name, args, 0)?.to_string();
    check_fresh_name(ctx, name, &id)?;
    let (value, is_integer) = require_number(ctx, name, args, 1)?;
    let ty = if force_float64 {
        ValueType::Float64
    } else if is_integer {
        ValueType::Int
    } else {
        ValueType::Float
    };
    ctx.namespace.consts.insert(id, Const { value, ty });
    Ok(())
}

pub fn declare_local(
    ctx: &mut CompilationContext,
    name: &str,
    args: &[Argument],
    ty: ValueType,
) -> Result<()> {
    let id = require_ident(ctx, name, args, 0)?.to_string();
    ctx.declare_local(&id, ty)?;
    Ok(())
}

// =============================================================================
// push / set / drop
// =============================================================================

/// Direct typed access opcode and alignment for a cell's own storage.
fn entry_access(entry: &MemoryEntry, for_store: bool) -> (u8, u32) {
    match entry.element_word_size {
        1 if for_store => (op::I32_STORE8, 0),
        1 => (
            if entry.is_unsigned {
                op::I32_LOAD8_U
            } else {
                op::I32_LOAD8_S
            },
            0,
        ),
        2 if for_store => (op::I32_STORE16, 1),
        2 => (
            if entry.is_unsigned {
                op::I32_LOAD16_U
            } else {
                op::I32_LOAD16_S
            },
            1,
        ),
        8 => (if for_store { op::F64_STORE } else { op::F64_LOAD }, 3),
        _ => match entry.value_type() {
            ValueType::Float => (if for_store { op::F32_STORE } else { op::F32_LOAD }, 2),
            _ => (if for_store { op::I32_STORE } else { op::I32_LOAD }, 2),
        },
    }
}

fn typed_access(ty: ValueType, for_store: bool) -> (u8, u32) {
    match ty {
        ValueType::Int => (if for_store { op::I32_STORE } else { op::I32_LOAD }, 2),
        ValueType::Float => (if for_store { op::F32_STORE } else { op::F32_LOAD }, 2),
        ValueType::Float64 => (if for_store { op::F64_STORE } else { op::F64_LOAD }, 3),
    }
}

fn push_one(ctx: &mut CompilationContext, arg: &Argument) -> Result<()> {
    if let Some((value, is_integer)) = arg.number() {
        if is_integer {
            ctx.emit_i32_const(value as i64 as i32);
            ctx.push_item(StackItem::constant(ValueType::Int, value));
        } else {
            ctx.emit_f32_const(value as f32);
            ctx.push_item(StackItem::constant(ValueType::Float, value));
        }
        return Ok(());
    }

    let text = arg.identifier().unwrap_or_default();
    let classified =
        ident::classify(text, &ctx.namespace.memory).map_err(|kind| ctx.err(kind))?;

    match classified {
        Classified::IntLiteral(v) => {
            ctx.emit_i32_const(v as i32);
            ctx.push_item(StackItem::constant(ValueType::Int, v as f64));
        }
        Classified::FloatLiteral(v) => {
            ctx.emit_f32_const(v as f32);
            ctx.push_item(StackItem::constant(ValueType::Float, v));
        }
        Classified::Plain(id) => {
            if let Some(local) = ctx.namespace.locals.get(&id).copied() {
                ctx.emit_local_get(local.index);
                ctx.push_item(StackItem::of(local.ty));
            } else if let Some(c) = ctx.namespace.consts.get(&id).copied() {
                ctx.emit_const_of(c.ty, c.value);
                ctx.push_item(StackItem::constant(c.ty, c.value));
            } else if let Some(entry) = ctx.namespace.memory.get(&id).cloned() {
                let (opcode, align) = entry_access(&entry, false);
                ctx.emit_i32_const(entry.byte_address as i32);
                ctx.emit_access(opcode, align);
                ctx.push_item(StackItem::of(entry.value_type()));
            } else {
                return Err(ctx.err(ErrorKind::Undeclared { name: id }));
            }
        }
        Classified::MemoryStart(entry) => {
            ctx.emit_i32_const(entry.byte_address as i32);
            ctx.push_item(StackItem::safe_address(entry.byte_address));
        }
        Classified::MemoryEnd(entry) => {
            let end = entry.end_byte_address();
            ctx.emit_i32_const(end as i32);
            ctx.push_item(StackItem::constant(ValueType::Int, end as f64));
        }
        Classified::Deref(entry) => {
            if !entry.is_pointer {
                return Err(ctx.err(ErrorKind::TypeMismatch {
                    message: format!("'{}' is not a pointer", entry.id),
                }));
            }
            let pointee = entry.pointee_type();
            // The pointer's own value is a dynamically stored address.
            ctx.emit_i32_const(entry.byte_address as i32);
            ctx.emit_access(op::I32_LOAD, 2);
            clamp_address(ctx, pointee.byte_size());
            let (opcode, align) = typed_access(pointee, false);
            ctx.emit_access(opcode, align);
            ctx.push_item(StackItem::of(pointee));
        }
        Classified::ElementCount(entry) => {
            ctx.emit_i32_const(entry.number_of_elements as i32);
            ctx.push_item(StackItem::constant(
                ValueType::Int,
                entry.number_of_elements as f64,
            ));
        }
        Classified::ElementWordSize(entry) => {
            ctx.emit_i32_const(entry.element_word_size as i32);
            ctx.push_item(StackItem::constant(
                ValueType::Int,
                entry.element_word_size as f64,
            ));
        }
        Classified::ElementMin(entry) => {
            let (min, _) = ident::element_bounds(&entry).map_err(|kind| ctx.err(kind))?;
            ctx.emit_i32_const(min);
            ctx.push_item(StackItem::constant(ValueType::Int, min as f64));
        }
        Classified::ElementMax(entry) => {
            let (_, max) = ident::element_bounds(&entry).map_err(|kind| ctx.err(kind))?;
            ctx.emit_i32_const(max);
            ctx.push_item(StackItem::constant(ValueType::Int, max as f64));
        }
        Classified::Intermodular { module, name: cell, end } => {
            ctx.emit_reloc_const(module, cell, end);
            let mut item = StackItem::of(ValueType::Int);
            // Start addresses are in bounds by construction once linked.
            item.is_safe_memory_address = !end;
            ctx.push_item(item);
        }
    }
    Ok(())
}

pub fn push(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    if args.is_empty() {
        return Err(bad_arg(ctx, name, "expects at least one argument"));
    }
    for arg in args {
        push_one(ctx, arg)?;
    }
    Ok(())
}

pub fn push64(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let arg = require_arg(ctx, name, args, 0)?;
    let (value, _) = const_or_literal(ctx, name, arg)?;
    ctx.emit_f64_const(value);
    ctx.push_item(StackItem::constant(ValueType::Float64, value));
    Ok(())
}

pub fn set(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let target = require_ident(ctx, name, args, 0)?.to_string();
    let value = ctx.pop_item(name)?;

    let classified =
        ident::classify(&target, &ctx.namespace.memory).map_err(|kind| ctx.err(kind))?;

    match classified {
        Classified::Plain(id) => {
            if let Some(local) = ctx.namespace.locals.get(&id).copied() {
                if local.ty != value.ty {
                    return Err(ctx.err(ErrorKind::TypeMismatch {
                        message: format!(
                            "cannot assign {} to {} local '{}'",
                            value.ty.name(),
                            local.ty.name(),
                            id
                        ),
                    }));
                }
                ctx.emit_local_set(local.index);
                Ok(())
            } else if let Some(entry) = ctx.namespace.memory.get(&id).cloned() {
                if entry.value_type() != value.ty {
                    return Err(ctx.err(ErrorKind::TypeMismatch {
                        message: format!(
                            "cannot store {} into {} cell '{}'",
                            value.ty.name(),
                            entry.value_type().name(),
                            id
                        ),
                    }));
                }
                // The value is already on the stack; the address has to go
                // underneath it, so park the value in a temporary.
                let temp = ctx.alloc_temp(value.ty);
                ctx.emit_local_set(temp);
                ctx.emit_i32_const(entry.byte_address as i32);
                ctx.emit_local_get(temp);
                let (opcode, align) = entry_access(&entry, true);
                ctx.emit_access(opcode, align);
                Ok(())
            } else if ctx.namespace.consts.contains_key(&id) {
                Err(bad_arg(ctx, name, format!("cannot assign to constant '{id}'")))
            } else {
                Err(ctx.err(ErrorKind::Undeclared { name: id }))
            }
        }
        Classified::Deref(entry) => {
            if !entry.is_pointer {
                return Err(ctx.err(ErrorKind::TypeMismatch {
                    message: format!("'{}' is not a pointer", entry.id),
                }));
            }
            let pointee = entry.pointee_type();
            if pointee != value.ty {
                return Err(ctx.err(ErrorKind::TypeMismatch {
                    message: format!(
                        "cannot store {} through {} pointer '{}'",
                        value.ty.name(),
                        pointee.name(),
                        entry.id
                    ),
                }));
            }
            let temp = ctx.alloc_temp(value.ty);
            ctx.emit_local_set(temp);
            ctx.emit_i32_const(entry.byte_address as i32);
            ctx.emit_access(op::I32_LOAD, 2);
            clamp_address(ctx, pointee.byte_size());
            ctx.emit_local_get(temp);
            let (opcode, align) = typed_access(pointee, true);
            ctx.emit_access(opcode, align);
            Ok(())
        }
        _ => Err(bad_arg(ctx, name, format!("'{target}' is not assignable"))),
    }
}

pub fn drop_top(ctx: &mut CompilationContext) -> Result<()> {
    ctx.pop_item("drop")?;
    ctx.emit_op(op::DROP);
    Ok(())
}

// =============================================================================
// Arithmetic / comparison / conversion
// =============================================================================

fn opcode_for(ty: ValueType, table: [u8; 3]) -> u8 {
    match ty {
        ValueType::Int => table[0],
        ValueType::Float => table[1],
        ValueType::Float64 => table[2],
    }
}

pub fn binary(
    ctx: &mut CompilationContext,
    name: &str,
    table: [u8; 3],
    result_is_int: bool,
) -> Result<()> {
    let b = ctx.pop_item(name)?;
    let a = ctx.pop_item(name)?;
    if a.ty != b.ty {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!(
                "'{}' operands disagree: {} vs {}",
                name,
                a.ty.name(),
                b.ty.name()
            ),
        }));
    }
    ctx.emit_op(opcode_for(a.ty, table));
    let result = if result_is_int { ValueType::Int } else { a.ty };
    ctx.push_item(StackItem::of(result));
    Ok(())
}

pub fn binary_int(ctx: &mut CompilationContext, opcode: u8) -> Result<()> {
    ctx.pop_item("int op")?;
    ctx.pop_item("int op")?;
    ctx.emit_op(opcode);
    ctx.push_item(StackItem::of(ValueType::Int));
    Ok(())
}

pub fn binary_float(
    ctx: &mut CompilationContext,
    name: &str,
    f32_op: u8,
    f64_op: u8,
) -> Result<()> {
    let b = ctx.pop_item(name)?;
    let a = ctx.pop_item(name)?;
    if a.ty != b.ty || a.ty == ValueType::Int {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!("'{name}' needs two float operands of the same width"),
        }));
    }
    ctx.emit_op(if a.ty == ValueType::Float64 { f64_op } else { f32_op });
    ctx.push_item(StackItem::of(a.ty));
    Ok(())
}

pub fn unary_float(
    ctx: &mut CompilationContext,
    name: &str,
    f32_op: u8,
    f64_op: u8,
) -> Result<()> {
    let v = ctx.pop_item(name)?;
    if v.ty == ValueType::Int {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!("'{name}' needs a float operand"),
        }));
    }
    ctx.emit_op(if v.ty == ValueType::Float64 { f64_op } else { f32_op });
    ctx.push_item(StackItem::of(v.ty));
    Ok(())
}

pub fn eqz(ctx: &mut CompilationContext) -> Result<()> {
    ctx.pop_item("eqz")?;
    ctx.emit_op(op::I32_EQZ);
    ctx.push_item(StackItem::of(ValueType::Int));
    Ok(())
}

pub fn convert(ctx: &mut CompilationContext, name: &str, target: ValueType) -> Result<()> {
    let v = ctx.pop_item(name)?;
    let opcode = match (v.ty, target) {
        (ValueType::Float, ValueType::Int) => op::I32_TRUNC_F32_S,
        (ValueType::Float64, ValueType::Int) => op::I32_TRUNC_F64_S,
        (ValueType::Int, ValueType::Float) => op::F32_CONVERT_I32_S,
        (ValueType::Float64, ValueType::Float) => op::F32_DEMOTE_F64,
        (ValueType::Int, ValueType::Float64) => op::F64_CONVERT_I32_S,
        (ValueType::Float, ValueType::Float64) => op::F64_PROMOTE_F32,
        _ => {
            return Err(ctx.err(ErrorKind::TypeMismatch {
                message: format!("operand is already {}", target.name()),
            }))
        }
    };
    ctx.emit_op(opcode);
    ctx.push_item(StackItem::of(target));
    Ok(())
}

// =============================================================================
// Bounds-checked access
// =============================================================================

/// With a dynamically computed address on top of the runtime stack, replace
/// it by `address > memoryByteSize - elementSize ? 0 : address`. Out-of-range
/// addresses collapse to the safe sentinel 0; negative addresses are caught
/// by the unsigned comparison.
fn clamp_address(ctx: &mut CompilationContext, element_size: u32) {
    let limit = ctx.memory_byte_size.saturating_sub(element_size);
    let temp = ctx.alloc_temp(ValueType::Int);
    ctx.emit_local_set(temp);
    ctx.emit_i32_const(0);
    ctx.emit_local_get(temp);
    ctx.emit_local_get(temp);
    ctx.emit_i32_const(limit as i32);
    ctx.emit_op(op::I32_GT_U);
    ctx.emit_op(op::SELECT);
}

pub fn load(
    ctx: &mut CompilationContext,
    opcode: u8,
    result: ValueType,
    align: u32,
) -> Result<()> {
    let address = ctx.pop_item("load")?;
    if !address.is_safe_memory_address {
        clamp_address(ctx, result.byte_size());
    }
    ctx.emit_access(opcode, align);
    ctx.push_item(StackItem::of(result));
    Ok(())
}

pub fn store(
    ctx: &mut CompilationContext,
    name: &str,
    narrow: Option<(u8, u32)>,
) -> Result<()> {
    let value = ctx.pop_item(name)?;
    let address = ctx.pop_item(name)?;
    let (opcode, align) = match narrow {
        Some(pair) => pair,
        None => typed_access(value.ty, true),
    };
    if address.is_safe_memory_address {
        ctx.emit_access(opcode, align);
        return Ok(());
    }
    // Both operands are already on the runtime stack; park the value so the
    // address can be clamped underneath it.
    let temp = ctx.alloc_temp(value.ty);
    ctx.emit_local_set(temp);
    clamp_address(ctx, value.ty.byte_size());
    ctx.emit_local_get(temp);
    ctx.emit_access(opcode, align);
    Ok(())
}

// =============================================================================
// Control flow
// =============================================================================

fn blocktype_byte(ty: Option<ValueType>) -> u8 {
    match ty {
        None => blocktype::VOID,
        Some(ValueType::Int) => blocktype::I32,
        Some(ValueType::Float) => blocktype::F32,
        Some(ValueType::Float64) => blocktype::F64,
    }
}

fn check_balanced(ctx: &CompilationContext, name: &str, expected_depth: usize) -> Result<()> {
    if ctx.stack.len() != expected_depth {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!(
                "'{}' body must leave the operand stack balanced ({} expected, {} found)",
                name,
                expected_depth,
                ctx.stack.len()
            ),
        }));
    }
    Ok(())
}

pub fn block_open(ctx: &mut CompilationContext) -> Result<()> {
    ctx.push_frame(BlockType::Block, None);
    ctx.emit_op(op::BLOCK);
    ctx.emit_op(blocktype::VOID);
    Ok(())
}

pub fn block_close(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = ctx.pop_frame(BlockType::Block, name)?;
    check_balanced(ctx, name, frame.entry_depth)?;
    ctx.emit_op(op::END);
    Ok(())
}

pub fn loop_open(ctx: &mut CompilationContext) -> Result<()> {
    ctx.push_frame(BlockType::Loop, None);
    // An outer block to give `skip` an exit label, then the loop itself.
    ctx.emit_op(op::BLOCK);
    ctx.emit_op(blocktype::VOID);
    ctx.emit_op(op::LOOP);
    ctx.emit_op(blocktype::VOID);
    Ok(())
}

pub fn loop_close(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = ctx.pop_frame(BlockType::Loop, name)?;
    check_balanced(ctx, name, frame.entry_depth)?;
    ctx.emit_op(op::BR);
    ctx.emit_uleb(0);
    ctx.emit_op(op::END);
    ctx.emit_op(op::END);
    Ok(())
}

pub fn if_open(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let expected = optional_type_arg(ctx, name, args)?;
    ctx.pop_item(name)?;
    ctx.push_frame(BlockType::If, expected);
    ctx.emit_op(op::IF);
    ctx.emit_op(blocktype_byte(expected));
    Ok(())
}

pub fn if_else(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = *ctx.top_block();
    if frame.else_seen {
        return Err(bad_arg(ctx, name, "duplicate else"));
    }
    if let Some(expected) = frame.expected_result {
        let result = ctx.pop_item(name)?;
        if result.ty != expected {
            return Err(ctx.err(ErrorKind::TypeMismatch {
                message: format!(
                    "if branch result is {}, declared {}",
                    result.ty.name(),
                    expected.name()
                ),
            }));
        }
    }
    check_balanced(ctx, name, frame.entry_depth)?;
    ctx.top_block_mut().else_seen = true;
    ctx.emit_op(op::ELSE);
    Ok(())
}

pub fn if_close(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = ctx.pop_frame(BlockType::If, name)?;
    if let Some(expected) = frame.expected_result {
        if !frame.else_seen {
            return Err(bad_arg(ctx, name, "if with a result type requires an else branch"));
        }
        let result = ctx.peek_item(name)?;
        if result.ty != expected {
            return Err(ctx.err(ErrorKind::TypeMismatch {
                message: format!(
                    "else branch result is {}, declared {}",
                    result.ty.name(),
                    expected.name()
                ),
            }));
        }
        check_balanced(ctx, name, frame.entry_depth + 1)?;
    } else {
        check_balanced(ctx, name, frame.entry_depth)?;
    }
    ctx.emit_op(op::END);
    Ok(())
}

pub fn skip(ctx: &mut CompilationContext, name: &str, conditional: bool) -> Result<()> {
    // Find the nearest BLOCK or LOOP frame. IF frames add one label level;
    // a LOOP target needs one more to clear the loop label and reach its
    // enclosing exit block.
    let mut depth = 0u32;
    let mut target = None;
    for frame in ctx.block_stack.iter().rev() {
        match frame.block_type {
            BlockType::Block => {
                target = Some(depth);
                break;
            }
            BlockType::Loop => {
                target = Some(depth + 1);
                break;
            }
            BlockType::If => depth += 1,
            BlockType::Module | BlockType::Function | BlockType::Init | BlockType::Map => break,
        }
    }
    let depth = target.ok_or_else(|| {
        ctx.err(ErrorKind::Scope {
            instruction: name.to_string(),
            found: ctx.top_block().block_type.name().to_string(),
        })
    })?;
    if conditional {
        ctx.pop_item(name)?;
        ctx.emit_op(op::BR_IF);
    } else {
        ctx.emit_op(op::BR);
    }
    ctx.emit_uleb(depth);
    Ok(())
}

pub fn function_open(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let expected = optional_type_arg(ctx, name, args)?;
    ctx.push_frame(BlockType::Function, expected);
    Ok(())
}

pub fn function_close(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = ctx.pop_frame(BlockType::Function, name)?;
    if let Some(expected) = frame.expected_result {
        let result = ctx.pop_item(name)?;
        if result.ty != expected {
            return Err(ctx.err(ErrorKind::TypeMismatch {
                message: format!(
                    "function result is {}, declared {}",
                    result.ty.name(),
                    expected.name()
                ),
            }));
        }
    }
    check_balanced(ctx, name, frame.entry_depth)?;
    Ok(())
}

pub fn init_open(ctx: &mut CompilationContext) -> Result<()> {
    ctx.push_frame(BlockType::Init, None);
    Ok(())
}

pub fn init_close(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    let frame = ctx.pop_frame(BlockType::Init, name)?;
    check_balanced(ctx, name, frame.entry_depth)?;
    Ok(())
}

// =============================================================================
// Branchless map lowering
// =============================================================================

pub fn map_open(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let output = {
        let text = require_ident(ctx, name, args, 0)?;
        type_arg(ctx, name, text)?
    };
    let input = ctx.peek_item(name)?.ty;
    if ctx.map.is_some() {
        return Err(bad_arg(ctx, name, "map block already open"));
    }
    ctx.push_frame(BlockType::Map, Some(output));
    ctx.map = Some(MapState {
        input_ty: input,
        output_ty: output,
        rows: Vec::new(),
        default: None,
    });
    Ok(())
}

fn check_key_type(ctx: &CompilationContext, state: &MapState, ty: ValueType) -> Result<()> {
    if ty != ValueType::Int && ty != state.input_ty {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!(
                "map key is {}, input is {}",
                ty.name(),
                state.input_ty.name()
            ),
        }));
    }
    Ok(())
}

fn check_value_type(ctx: &CompilationContext, state: &MapState, ty: ValueType) -> Result<()> {
    let ok = match state.output_ty {
        ValueType::Int => ty == ValueType::Int,
        ValueType::Float => ty != ValueType::Float64,
        ValueType::Float64 => true,
    };
    if !ok {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!(
                "map value is {}, output is {}",
                ty.name(),
                state.output_ty.name()
            ),
        }));
    }
    Ok(())
}

pub fn map_row(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let key_arg = require_arg(ctx, name, args, 0)?;
    let value_arg = require_arg(ctx, name, args, 1)?;
    let (key, key_ty) = const_or_literal(ctx, name, key_arg)?;
    let (value, value_ty) = const_or_literal(ctx, name, value_arg)?;

    match ctx.map.as_ref() {
        Some(state) => {
            check_key_type(ctx, state, key_ty)?;
            check_value_type(ctx, state, value_ty)?;
        }
        None => return Err(bad_arg(ctx, name, "map block was never opened")),
    }
    if let Some(state) = ctx.map.as_mut() {
        state.rows.push(MapRow { key, value });
    }
    Ok(())
}

pub fn map_default(ctx: &mut CompilationContext, name: &str, args: &[Argument]) -> Result<()> {
    let arg = require_arg(ctx, name, args, 0)?;
    let (value, value_ty) = const_or_literal(ctx, name, arg)?;
    match ctx.map.as_ref() {
        Some(state) => {
            check_value_type(ctx, state, value_ty)?;
            if state.default.is_some() {
                return Err(bad_arg(ctx, name, "duplicate default"));
            }
        }
        None => return Err(bad_arg(ctx, name, "map block was never opened")),
    }
    if let Some(state) = ctx.map.as_mut() {
        state.default = Some(value);
    }
    Ok(())
}

/// First-match-wins lookup without branches: for each row in declaration
/// order, `cond = input == key`, `apply = cond AND NOT matched`,
/// `result = select(rowValue, result, apply)`, `matched = matched OR cond`.
/// Later rows cannot override an earlier match because `apply` is gated by
/// `NOT matched`; unmatched input keeps the default.
pub fn map_end(ctx: &mut CompilationContext, name: &str) -> Result<()> {
    ctx.pop_frame(BlockType::Map, name)?;
    let state = match ctx.map.take() {
        Some(state) => state,
        None => return Err(bad_arg(ctx, name, "map block was never opened")),
    };

    let input_item = ctx.pop_item(name)?;
    if input_item.ty != state.input_ty {
        return Err(ctx.err(ErrorKind::TypeMismatch {
            message: format!(
                "map input changed type: {} declared, {} on the stack",
                state.input_ty.name(),
                input_item.ty.name()
            ),
        }));
    }

    let output = state.output_ty;
    let default = state.default.unwrap_or(0.0);

    if state.rows.is_empty() {
        ctx.emit_op(op::DROP);
        ctx.emit_const_of(output, default);
        ctx.push_item(StackItem::constant(output, default));
        return Ok(());
    }

    let eq_op = opcode_for(state.input_ty, [op::I32_EQ, op::F32_EQ, op::F64_EQ]);
    let t_input = ctx.alloc_temp(state.input_ty);
    let t_result = ctx.alloc_temp(output);
    let t_matched = ctx.alloc_temp(ValueType::Int);
    let t_cond = ctx.alloc_temp(ValueType::Int);

    ctx.emit_local_set(t_input);
    ctx.emit_const_of(output, default);
    ctx.emit_local_set(t_result);
    ctx.emit_i32_const(0);
    ctx.emit_local_set(t_matched);

    for row in &state.rows {
        // cond = input == key
        ctx.emit_local_get(t_input);
        ctx.emit_const_of(state.input_ty, row.key);
        ctx.emit_op(eq_op);
        ctx.emit_local_set(t_cond);
        // result = select(rowValue, result, cond AND NOT matched)
        ctx.emit_const_of(output, row.value);
        ctx.emit_local_get(t_result);
        ctx.emit_local_get(t_cond);
        ctx.emit_local_get(t_matched);
        ctx.emit_op(op::I32_EQZ);
        ctx.emit_op(op::I32_AND);
        ctx.emit_op(op::SELECT);
        ctx.emit_local_set(t_result);
        // matched = matched OR cond
        ctx.emit_local_get(t_matched);
        ctx.emit_local_get(t_cond);
        ctx.emit_op(op::I32_OR);
        ctx.emit_local_set(t_matched);
    }

    ctx.emit_local_get(t_result);
    ctx.push_item(StackItem::of(output));
    Ok(())
}
