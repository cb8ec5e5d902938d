// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
//#![deny(unsafe_code)]
// - 'file/mod.rs' uses mmap to map a file into memory

//! # dotshim
//!
//! Call-site interception for CIL modules. `dotshim` rewrites the method bodies of a
//! compiled module so that every `call`, `callvirt` and `newobj` first asks an interception
//! runtime whether a substitute is registered for the target, and only falls back to the
//! original call when none is. Test code uses it to replace calls the unit under test
//! makes into code it does not own.
//!
//! ## Features
//!
//! - **Bytecode rewriting** - conditional dispatch at every call site, idempotent across passes
//! - **Structural signature matching** - overloads, generics and assignability, no identity needed
//! - **Declarative rules** - replace methods, constructors and property accessors by selector
//! - **Strict mocking** - fail fast on any unmocked call out of a type under test
//! - **Execution host** - run rewritten modules and observe the interception in-process
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dotshim::prelude::*;
//!
//! // Rewrite a module once
//! let mut module = Module::from_file("tests/samples/Demo.dshm".as_ref())?;
//! let options = RewriteOptions::default();
//! rewrite_module(&mut module, &mut CallSiteRewriter::new(options.clone()), &options)?;
//!
//! // Register a substitute and run the rewritten code
//! let interception = Arc::new(Interception::new());
//! Replace::method(&module, "Demo.Util", "Helper", &[TypeSig::String])?
//!     .with(&interception, |text: String| text.len() as i32)?;
//!
//! let mut machine = Machine::new(Arc::new(module), interception);
//! let result = machine.invoke_by_name("Demo.C", "Do", None, vec![])?;
//! println!("{result:?}");
//! # Ok::<(), dotshim::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`metadata`] - the in-memory [`Module`] and its binary container
//! - [`assembly`] - CIL opcodes, decoding, encoding and a fluent assembler
//! - [`interception`] - matcher, call maps, providers, rules and the [`interception::Interception`] context
//! - [`rewriter`] - the method body rewriter
//! - [`emulation`] - the execution host for rewritten modules
//! - [`task`] - batch rewriting of files on disk
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result):
//!
//! ```rust,no_run
//! use dotshim::{Error, Module};
//!
//! match Module::from_file(std::path::Path::new("tests/samples/broken.dshm")) {
//!     Ok(module) => println!("Loaded {}", module.name),
//!     Err(Error::NotSupported) => println!("Not a module container"),
//!     Err(Error::Malformed { message, .. }) => println!("Malformed: {}", message),
//!     Err(e) => println!("Other error: {}", e),
//! }
//! ```
//!
//! ## Fuzzing
//!
//! ```bash
//! cargo +nightly fuzz run module --release
//! ```
#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use dotshim::prelude::*;
///
/// let module = Module::new("Empty");
/// assert_eq!(module.method_count(), 0);
/// ```
pub mod prelude;

/// CIL instructions: opcodes, decoding, encoding and assembling.
///
/// Method bodies are byte streams of ECMA-335 instructions. The [`assembly`] module turns
/// them into [`assembly::Instruction`]s and back, resolving branch labels on the way.
///
/// # Examples
///
/// ```rust
/// use dotshim::assembly::{decode_stream, InstructionAssembler};
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldarg(0)?.ldc_i4(1)?.add()?.ret()?;
/// let (code, _) = asm.finish()?;
///
/// let instructions = decode_stream(&code)?;
/// assert_eq!(instructions.len(), 4);
/// assert_eq!(instructions[2].mnemonic(), "add");
/// # Ok::<(), dotshim::Error>(())
/// ```
pub mod assembly;

/// The CIL module model and its binary container.
///
/// # Key Components
///
/// - [`metadata::module`] - types, methods, member references and the processed table
/// - [`metadata::method`] - structural method descriptors
/// - [`metadata::typesig`] - type signatures and assignability
/// - [`metadata::body`] - method bodies
/// - [`metadata::container`] - the `DSHM` container format
pub mod metadata;

/// Rules, call maps and the runtime context rewritten code consults.
pub mod interception;

/// Rewriting of method bodies for call interception.
///
/// See [`rewriter::rewrite_module`] for the entry point and [`rewriter::intrinsics`] for the
/// runtime helpers rewritten bodies call.
pub mod rewriter;

/// Execution host for (rewritten) modules.
pub mod emulation;

/// Batch rewriting of module files.
pub mod task;

/// `dotshim` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
/// This is used consistently throughout the crate for all fallible operations.
///
/// # Examples
///
/// ```rust,no_run
/// use dotshim::{Module, Result};
///
/// fn load(path: &str) -> Result<Module> {
///     Module::from_file(std::path::Path::new(path))
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dotshim` Error type
///
/// The main error type for all operations in this crate: container parsing, instruction
/// encoding, rule registration, call map population and execution.
///
/// # Examples
///
/// ```rust
/// use dotshim::{Error, Module};
///
/// match Module::from_mem(vec![0x00, 0x01]) {
///     Ok(_) => unreachable!(),
///     Err(Error::NotSupported) | Err(Error::OutOfBounds) => println!("not a module"),
///     Err(e) => println!("Error: {}", e),
/// }
/// ```
pub use error::Error;

/// The in-memory CIL module.
///
/// See [`metadata::module::Module`].
pub use metadata::module::Module;

/// Provides access to low-level file and memory parsing utilities.
///
/// # Example
///
/// ```rust
/// use dotshim::Parser;
///
/// let data = [0x2A, 0x00, 0x00, 0x00];
/// let mut parser = Parser::new(&data);
/// assert_eq!(parser.read_le::<u32>()?, 0x2A);
/// # Ok::<(), dotshim::Error>(())
/// ```
pub use file::{parser::Parser, File};
