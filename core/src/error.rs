use serde::ser::{Serialize, SerializeStruct, Serializer};
use thiserror::Error;

/// Everything that can go wrong while compiling one unit. Each variant maps
/// to one stable error code surfaced to the caller.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ErrorKind {
    #[error("'{instruction}' is not allowed in {found} scope")]
    Scope { instruction: String, found: String },

    #[error("'{instruction}' needs {needed} operand(s) on the stack, found {found}")]
    MissingOperands {
        instruction: String,
        needed: usize,
        found: usize,
    },

    #[error("'{instruction}' operand {position} from the top must be {expected}, found {found}")]
    OperandType {
        instruction: String,
        position: usize,
        expected: String,
        found: String,
    },

    #[error("'{name}' is not declared")]
    Undeclared { name: String },

    #[error("'{name}' is already declared")]
    Redeclared { name: String },

    #[error("type mismatch: {message}")]
    TypeMismatch { message: String },

    #[error("unrecognized instruction '{name}'")]
    UnknownInstruction { name: String },

    #[error("'{closer}' without a matching '{opener}'")]
    MissingBlockStart { closer: String, opener: String },

    #[error("'{instruction}': {message}")]
    Argument {
        instruction: String,
        message: String,
    },
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Scope { .. } => "SCOPE",
            ErrorKind::MissingOperands { .. } => "MISSING_OPERANDS",
            ErrorKind::OperandType { .. } => "OPERAND_TYPE",
            ErrorKind::Undeclared { .. } => "UNDECLARED_IDENTIFIER",
            ErrorKind::Redeclared { .. } => "REDECLARED_IDENTIFIER",
            ErrorKind::TypeMismatch { .. } => "TYPE_MISMATCH",
            ErrorKind::UnknownInstruction { .. } => "UNKNOWN_INSTRUCTION",
            ErrorKind::MissingBlockStart { .. } => "MISSING_BLOCK_START",
            ErrorKind::Argument { .. } => "BAD_ARGUMENT",
        }
    }
}

/// A fatal compile error for one unit: the taxonomy entry plus the source
/// line and module it was raised from. Compilation stops at the first one.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{module}:{line}: {kind}")]
pub struct CompileError {
    pub kind: ErrorKind,
    pub line: u32,
    pub module: String,
}

impl CompileError {
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }
}

// External callers (editor overlays, runtime hosts) consume errors as
// `{ code, lineNumber, moduleId, message }`.
impl Serialize for CompileError {
    // Written out in full: the crate-wide `Result` alias below would
    // otherwise shadow the two-parameter form this impl needs.
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut st = serializer.serialize_struct("CompileError", 4)?;
        st.serialize_field("code", self.code())?;
        st.serialize_field("lineNumber", &self.line)?;
        st.serialize_field("moduleId", &self.module)?;
        st.serialize_field("message", &self.to_string())?;
        st.end()
    }
}

pub type Result<T> = std::result::Result<T, CompileError>;
