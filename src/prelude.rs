//! # dotshim Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the dotshim library. Import this module to get quick access to the essential
//! types for rewriting modules and registering substitutes.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotshim operations
pub use crate::Error;

/// The result type used throughout dotshim
pub use crate::Result;

// ================================================================================================
// Module Model
// ================================================================================================

/// The module and its table entries
pub use crate::metadata::module::{FieldDef, MemberRef, MethodDef, Module, TypeDef};

/// Method descriptors and their attributes
pub use crate::metadata::method::{MethodDescriptor, MethodFlags};

/// Type signatures
pub use crate::metadata::typesig::TypeSig;

/// Metadata token type for referencing table entries
pub use crate::metadata::token::Token;

/// Method bodies
pub use crate::metadata::body::MethodBody;

// ================================================================================================
// Instructions
// ================================================================================================

/// Writing method bodies by hand
pub use crate::assembly::InstructionAssembler;

// ================================================================================================
// Interception
// ================================================================================================

/// The runtime context and the rule API
pub use crate::interception::{
    CallTarget, Delegate, FnSubstitute, Interception, InvocationContext, Replace, Substitute,
};

// ================================================================================================
// Rewriting and Execution
// ================================================================================================

/// The rewrite pass
pub use crate::rewriter::{rewrite_module, CallSiteRewriter, RewriteOptions, RewriteReport};

/// The execution host
pub use crate::emulation::{EmValue, Machine};

/// Batch rewriting
pub use crate::task::RewriteTask;
