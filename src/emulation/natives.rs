//! Host-implemented methods.
//!
//! Modules call into types they do not define: `System.Object::.ctor`, string helpers,
//! exception constructors, or whatever external API the code under test depends on. The
//! [`Natives`] registry maps those calls onto Rust closures, keyed by declaring type name,
//! method name and parameter count.
//!
//! # Default Natives
//!
//! [`Natives::new`] preinstalls:
//!
//! - `System.Object::.ctor`, `System.Object::ToString`
//! - `System.String::Concat` (two and three arguments), `System.String::get_Length`,
//!   `System.String::op_Equality`
//! - `.ctor(string)`/`.ctor()` and `get_Message` for `System.Exception`,
//!   `System.InvalidOperationException`, `System.ArgumentException` and
//!   `System.NotImplementedException`
//!
//! # Examples
//!
//! ```rust
//! use std::sync::{Arc, Mutex};
//! use dotshim::emulation::{EmValue, Natives};
//!
//! let printed = Arc::new(Mutex::new(Vec::new()));
//! let sink = printed.clone();
//!
//! let mut natives = Natives::new();
//! natives.register("System.Console", "WriteLine", 1, move |call| {
//!     sink.lock().unwrap().push(call.args[0].to_string());
//!     Ok(EmValue::Void)
//! });
//! assert!(natives.contains("System.Console", "WriteLine", 1));
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::{
    emulation::{EmValue, EmulationError},
    metadata::method::MethodDescriptor,
    Result,
};

/// Field holding an exception's message.
pub(crate) const EXCEPTION_MESSAGE_FIELD: &str = "_message";

const EXCEPTION_TYPES: &[&str] = &[
    "System.Exception",
    "System.InvalidOperationException",
    "System.ArgumentException",
    "System.NotImplementedException",
];

/// Arguments of a native call.
pub struct NativeCall<'a> {
    /// The method being called
    pub method: &'a MethodDescriptor,
    /// The receiver, for instance methods and constructors
    pub this: Option<&'a EmValue>,
    /// Arguments in declaration order
    pub args: &'a [EmValue],
}

impl NativeCall<'_> {
    /// The receiver, failing with a null reference when there is none.
    ///
    /// # Errors
    /// Returns [`EmulationError::NullReference`] for static calls or a null receiver.
    pub fn this(&self) -> Result<&EmValue> {
        match self.this {
            Some(this) if !this.is_null() => Ok(this),
            _ => Err(EmulationError::NullReference.into()),
        }
    }

    /// Argument `index` as a string; null becomes the empty string.
    ///
    /// # Errors
    /// Returns [`EmulationError::TypeMismatch`] for non-string arguments.
    pub fn str_arg(&self, index: usize) -> Result<String> {
        match self.args.get(index) {
            Some(EmValue::Str(value)) => Ok(value.to_string()),
            Some(EmValue::Null) => Ok(String::new()),
            Some(other) => Err(EmulationError::TypeMismatch {
                operation: "native string argument",
                found: format!("{other:?}"),
            }
            .into()),
            None => Err(EmulationError::ArgumentIndexOutOfBounds {
                index,
                count: self.args.len(),
            }
            .into()),
        }
    }
}

/// A host closure standing in for a method body.
pub type NativeFn = Arc<dyn Fn(&NativeCall<'_>) -> Result<EmValue> + Send + Sync>;

/// Registry of host-implemented methods.
#[derive(Clone)]
pub struct Natives {
    methods: FxHashMap<(String, String, usize), NativeFn>,
}

impl Natives {
    /// A registry with the default natives installed.
    #[must_use]
    pub fn new() -> Self {
        let mut natives = Natives::empty();
        natives.install_defaults();
        natives
    }

    /// A registry without any natives.
    #[must_use]
    pub fn empty() -> Self {
        Natives {
            methods: FxHashMap::default(),
        }
    }

    /// Install `f` as the implementation of `type_name::name` taking `arity` parameters,
    /// replacing any earlier registration.
    pub fn register<F>(&mut self, type_name: &str, name: &str, arity: usize, f: F)
    where
        F: Fn(&NativeCall<'_>) -> Result<EmValue> + Send + Sync + 'static,
    {
        self.methods
            .insert((type_name.to_string(), name.to_string(), arity), Arc::new(f));
    }

    /// Whether an implementation is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str, name: &str, arity: usize) -> bool {
        self.methods
            .contains_key(&(type_name.to_string(), name.to_string(), arity))
    }

    /// The implementation of `method`, if any.
    #[must_use]
    pub fn get(&self, method: &MethodDescriptor) -> Option<NativeFn> {
        self.methods.get(&method.lookup_key()).cloned()
    }

    /// Number of registered natives.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no natives are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    fn install_defaults(&mut self) {
        self.register("System.Object", ".ctor", 0, |_| Ok(EmValue::Void));
        self.register("System.Object", "ToString", 0, |call| {
            let this = call.this()?;
            Ok(match this {
                EmValue::Str(_) => this.clone(),
                EmValue::Boxed(inner) => EmValue::string(&inner.to_string()),
                other => EmValue::string(&other.type_sig().type_name()),
            })
        });

        self.register("System.String", "Concat", 2, |call| {
            Ok(EmValue::string(&(call.str_arg(0)? + &call.str_arg(1)?)))
        });
        self.register("System.String", "Concat", 3, |call| {
            Ok(EmValue::string(
                &(call.str_arg(0)? + &call.str_arg(1)? + &call.str_arg(2)?),
            ))
        });
        self.register("System.String", "get_Length", 0, |call| match call.this()? {
            EmValue::Str(value) => Ok(EmValue::I32(
                i32::try_from(value.encode_utf16().count()).unwrap_or(i32::MAX),
            )),
            other => Err(EmulationError::TypeMismatch {
                operation: "System.String::get_Length",
                found: format!("{other:?}"),
            }
            .into()),
        });
        self.register("System.String", "op_Equality", 2, |call| {
            Ok(EmValue::Bool(call.args.first() == call.args.get(1)))
        });

        for exception in EXCEPTION_TYPES {
            self.register(exception, ".ctor", 0, |_| Ok(EmValue::Void));
            self.register(exception, ".ctor", 1, |call| {
                let message = call.args.first().cloned().unwrap_or(EmValue::Null);
                if let Some(object) = call.this()?.as_object() {
                    object.set_field(EXCEPTION_MESSAGE_FIELD, message)?;
                }
                Ok(EmValue::Void)
            });
            self.register(exception, "get_Message", 0, |call| {
                match call.this()?.as_object() {
                    Some(object) => Ok(object.field(EXCEPTION_MESSAGE_FIELD)?.unwrap_or(EmValue::Null)),
                    None => Ok(EmValue::Null),
                }
            });
        }
    }
}

impl Default for Natives {
    fn default() -> Self {
        Natives::new()
    }
}
