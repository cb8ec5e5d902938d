//! Module model and its binary container.
//!
//! # Key Components
//!
//! - [`module`] - the in-memory [`Module`](module::Module) with its tables and resolution
//! - [`container`] - reading and writing the `DSHM` container
//! - [`method`] - structural [`MethodDescriptor`](method::MethodDescriptor)s
//! - [`typesig`] - type signatures and assignability
//! - [`body`] - method bodies with tiny/fat headers
//! - [`sequencepoints`] - debug IL-offset to source-line mappings
//! - [`token`] - metadata table row references
//!
//! # Examples
//!
//! ```rust,no_run
//! use dotshim::Module;
//!
//! let module = Module::from_file("tests/samples/Demo.dshm".as_ref())?;
//! for (token, method) in module.methods() {
//!     println!("{token}: {}", method.name);
//! }
//! # Ok::<(), dotshim::Error>(())
//! ```

/// Method bodies and their headers
pub mod body;
/// The binary module container
pub mod container;
/// Structural method descriptors and signatures
pub mod method;
/// The module model
pub mod module;
/// Debug sequence points
pub mod sequencepoints;
/// Commonly used metadata token type
pub mod token;
/// Type signatures and assignability
pub mod typesig;
