//! Execution host error types.
//!
//! Every failure the [`Machine`](super::Machine) detects while running a method body is an
//! [`EmulationError`]. It converts into [`crate::Error::Emulation`] so callers see a single
//! error type.

use std::fmt;

/// Errors that can occur while executing CIL.
#[derive(Debug, Clone, PartialEq)]
pub enum EmulationError {
    /// Evaluation stack underflow (pop from empty stack).
    StackUnderflow,
    /// Evaluation stack grew beyond the method's declared maximum.
    StackOverflow {
        /// The declared `max_stack` of the method.
        limit: usize,
    },
    /// Local variable index out of bounds.
    LocalIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of locals available.
        count: usize,
    },
    /// Argument index out of bounds.
    ArgumentIndexOutOfBounds {
        /// The requested index.
        index: usize,
        /// Number of arguments available.
        count: usize,
    },
    /// Array element index out of bounds.
    ArrayIndexOutOfBounds {
        /// The requested index.
        index: i64,
        /// Length of the array.
        length: usize,
    },
    /// A null reference was dereferenced.
    NullReference,
    /// Integer division by zero.
    DivisionByZero,
    /// A cast or unbox to an incompatible type.
    InvalidCast {
        /// The type found at run time.
        from: String,
        /// The type the instruction required.
        to: String,
    },
    /// An instruction received operands of the wrong kind.
    TypeMismatch {
        /// The operation being attempted.
        operation: &'static str,
        /// Description of the operands found.
        found: String,
    },
    /// A call named a method that neither the module nor the natives provide.
    MissingMethod {
        /// `Type::Name` of the method.
        method: String,
    },
    /// A field access named a field the object or module does not have.
    MissingField {
        /// Name of the field.
        field: String,
    },
    /// A method body has no instructions to execute.
    NoMethodBody {
        /// `Type::Name` of the method.
        method: String,
    },
    /// Execution reached an opcode the host cannot run.
    UnsupportedOpcode {
        /// Mnemonic of the opcode.
        mnemonic: &'static str,
        /// Offset of the instruction.
        offset: u32,
    },
    /// Execution ran off the end of a method body without returning.
    FellThrough {
        /// `Type::Name` of the method.
        method: String,
    },
    /// Nested calls went deeper than the configured limit.
    CallDepthExceeded {
        /// The configured limit.
        limit: usize,
    },
    /// The executed method executed more instructions than the configured limit.
    InstructionLimitExceeded {
        /// The configured limit.
        limit: u64,
    },
    /// A `throw` left the outermost frame.
    UnhandledException {
        /// Type of the thrown object.
        type_name: String,
        /// Message string, when the object carried one.
        message: Option<String>,
    },
}

impl fmt::Display for EmulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmulationError::StackUnderflow => write!(f, "evaluation stack underflow"),
            EmulationError::StackOverflow { limit } => {
                write!(f, "evaluation stack overflow (max stack: {limit})")
            }
            EmulationError::LocalIndexOutOfBounds { index, count } => {
                write!(f, "local variable index {index} out of bounds (count: {count})")
            }
            EmulationError::ArgumentIndexOutOfBounds { index, count } => {
                write!(f, "argument index {index} out of bounds (count: {count})")
            }
            EmulationError::ArrayIndexOutOfBounds { index, length } => {
                write!(f, "array index {index} out of bounds (length: {length})")
            }
            EmulationError::NullReference => write!(f, "null reference"),
            EmulationError::DivisionByZero => write!(f, "division by zero"),
            EmulationError::InvalidCast { from, to } => {
                write!(f, "unable to cast {from} to {to}")
            }
            EmulationError::TypeMismatch { operation, found } => {
                write!(f, "type mismatch in {operation}: {found}")
            }
            EmulationError::MissingMethod { method } => write!(f, "missing method {method}"),
            EmulationError::MissingField { field } => write!(f, "missing field {field}"),
            EmulationError::NoMethodBody { method } => write!(f, "method {method} has no body"),
            EmulationError::UnsupportedOpcode { mnemonic, offset } => {
                write!(f, "unsupported opcode {mnemonic} at IL_{offset:04x}")
            }
            EmulationError::FellThrough { method } => {
                write!(f, "execution fell off the end of {method}")
            }
            EmulationError::CallDepthExceeded { limit } => {
                write!(f, "call depth exceeded (limit: {limit})")
            }
            EmulationError::InstructionLimitExceeded { limit } => {
                write!(f, "instruction limit exceeded (limit: {limit})")
            }
            EmulationError::UnhandledException { type_name, message } => match message {
                Some(message) => write!(f, "unhandled exception {type_name}: {message}"),
                None => write!(f, "unhandled exception {type_name}"),
            },
        }
    }
}

impl std::error::Error for EmulationError {}
