//! Compiler for a stack-based, typed assembly language targeting a
//! WebAssembly-compatible host.
//!
//! One compilation unit is a sequence of instruction records from the
//! upstream text parser. Compiling it yields a [`CompiledUnit`]: the unit's
//! memory map (so hosts and editor overlays can locate any named cell at
//! runtime), its local declarations, and two byte-code segments (init and
//! loop) that an external module-assembly stage concatenates into function
//! bodies of the final binary module.

pub mod compilers;
pub mod context;
pub mod encoder;
pub mod error;
pub mod ident;
pub mod instruction;
pub mod memory;

pub use context::{CompiledUnit, LocalDecl, Relocation, SegmentId, StackItem, UnitConfig};
pub use error::{CompileError, ErrorKind};
pub use instruction::{compile_unit, Argument, InstructionRecord};
pub use memory::{MemoryEntry, MemoryMap, ValueType};
