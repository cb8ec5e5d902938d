use thiserror::Error;

use crate::emulation::EmulationError;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into a handful of categories that map onto the different phases a module
/// goes through: loading, rewriting, rule registration, and finally execution of the rewritten
/// code.
///
/// # Error Categories
///
/// ## Structural Input Errors
/// - [`Error::Malformed`] - Corrupted container, undecodable method body or unresolvable token
/// - [`Error::OutOfBounds`] - Attempted to read beyond the input boundaries
/// - [`Error::NotSupported`] - Unsupported container version or feature
/// - [`Error::Empty`] - Empty input provided
/// - [`Error::FileError`] - Filesystem I/O errors
///
/// ## Assembly Errors
/// - [`Error::InvalidMnemonic`] - Unknown instruction mnemonic
/// - [`Error::InvalidBranch`] - Branch with a non-branch opcode or out-of-range offset
/// - [`Error::UndefinedLabel`] - Branch to a label that was never defined
/// - [`Error::DuplicateLabel`] - Label defined twice
///
/// ## Registration Errors
/// - [`Error::SignatureMismatch`] - A substitute does not fit the method it was registered for
/// - [`Error::MemberNotFound`] - A selector named a type or member that does not exist
/// - [`Error::NoCompatibleConstructor`] - No constructor fits the supplied factory
/// - [`Error::MissingAccessor`] - A property has no getter or setter to replace
///
/// ## Run-time Errors
/// - [`Error::MissingMock`] - Strict mocking found a call without a substitute
/// - [`Error::Emulation`] - The execution host failed while running a method
/// - [`Error::Substitute`] - A substitute implementation reported a failure
/// - [`Error::LockError`] - Thread synchronization failure
///
/// # Examples
///
/// ```rust,no_run
/// use dotshim::{Error, Module};
/// use std::path::Path;
///
/// match Module::from_file(Path::new("Demo.dshm")) {
///     Ok(module) => {
///         println!("Loaded {}", module.name);
///     }
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("Malformed module: {} ({}:{})", message, file, line);
///     }
///     Err(Error::FileError(io_err)) => {
///         eprintln!("I/O error: {}", io_err);
///     }
///     Err(e) => {
///         eprintln!("Other error: {}", e);
///     }
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The input is damaged and could not be parsed.
    ///
    /// Raised for structurally invalid containers, method bodies that do not decode, and
    /// instruction operands that do not resolve to a method. The error includes the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing the input.
    #[error("Out of Bound read would have occurred!")]
    OutOfBounds,

    /// This input is not supported.
    ///
    /// Indicates a container with an unknown magic or version, or an opcode outside
    /// the instruction subset understood by this library.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// The encoder was asked to emit an instruction it does not know.
    #[error("Invalid instruction mnemonic: {0}")]
    InvalidMnemonic(String),

    /// A branch could not be encoded.
    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// A branch refers to a label that was never defined.
    #[error("Undefined label: {0}")]
    UndefinedLabel(String),

    /// A label was defined twice.
    #[error("Duplicate label: {0}")]
    DuplicateLabel(String),

    /// A substitute's own signature does not structurally match the method it was
    /// registered for.
    ///
    /// Raised at registration time, before any rewritten code runs.
    #[error("The delegate you provided does not have a compatible signature with the '{method}' method.")]
    SignatureMismatch {
        /// Name of the target method
        method: String,
    },

    /// A selector referred to a type or member the catalog does not contain.
    #[error("Unable to find member '{0}'")]
    MemberNotFound(String),

    /// No constructor of the selected type is compatible with the supplied factory.
    #[error("Unable to find a compatible constructor from type '{0}' that matches the current implementation delegate.")]
    NoCompatibleConstructor(String),

    /// The selected property lacks the requested accessor.
    ///
    /// # Fields
    ///
    /// * `property` - Name of the property
    /// * `accessor` - Either `getter` or `setter`
    #[error("The property '{property}' has no {accessor} method.")]
    MissingAccessor {
        /// Name of the property
        property: String,
        /// The accessor kind that is missing
        accessor: &'static str,
    },

    /// Strict mocking encountered a call that has no registered substitute.
    #[error("Method '{type_name}.{method}' is missing a mock implementation")]
    MissingMock {
        /// Full name of the declaring type
        type_name: String,
        /// Name of the unmapped method
        method: String,
    },

    /// The execution host failed while running a method body.
    #[error("{0}")]
    Emulation(#[from] EmulationError),

    /// A substitute implementation reported a failure.
    #[error("Substitute failed - {0}")]
    Substitute(String),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when trying to acquire a mutex or rwlock that has been poisoned.
    #[error("Failed to lock target")]
    LockError,
}
