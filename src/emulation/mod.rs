//! CIL execution host.
//!
//! Rewritten modules only show their behavior when they run. This module provides a small
//! interpreter for the instruction subset the module model supports, enough to execute
//! test subjects, their call sites and the conditional dispatch the rewriter emits.
//!
//! # Architecture
//!
//! - [`EmValue`] and [`HeapObject`] represent values on the stack and the managed heap
//! - [`Machine`] decodes bodies and executes them frame by frame
//! - [`Natives`] stands in for methods of types the module does not define
//! - [`EmulationError`] reports everything that can go wrong while executing
//!
//! Calls into `Dotshim.Runtime.*` are not looked up anywhere: the machine recognizes the
//! [runtime helpers](crate::rewriter::intrinsics::RuntimeHelper) and runs them against its
//! [`Interception`](crate::interception::Interception) context.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dotshim::{
//!     emulation::{EmValue, Machine},
//!     interception::Interception,
//!     Module,
//! };
//!
//! let mut machine = Machine::new(Arc::new(Module::new("Empty")), Arc::new(Interception::new()));
//! machine.natives_mut().register("Demo.Clock", "Now", 0, |_| Ok(EmValue::I64(0)));
//! assert!(machine.natives().contains("Demo.Clock", "Now", 0));
//! ```

mod error;
mod machine;
pub(crate) mod natives;
mod value;

pub use error::EmulationError;
pub use machine::{Machine, MachineLimits};
pub use natives::{NativeCall, NativeFn, Natives};
pub use value::{EmValue, HeapObject, ObjectRef, RuntimeHandle};
