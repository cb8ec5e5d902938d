//! Runtime values of the execution host.

use std::{fmt, sync::Arc, sync::Mutex};

use rustc_hash::FxHashMap;

use crate::{
    emulation::EmulationError,
    interception::{CallMap, CallProvider, InvocationContext, StackTrace, Substitute},
    metadata::{
        method::MethodDescriptor,
        typesig::{TypeResolver, TypeSig},
    },
    Result,
};

/// Shared reference to a heap object.
pub type ObjectRef = Arc<HeapObject>;

/// A value on the evaluation stack, in a local, argument, field or array slot.
///
/// | CIL Type | Variant |
/// |----------|---------|
/// | `int32` | [`EmValue::I32`] |
/// | `int64` | [`EmValue::I64`] |
/// | `float64` | [`EmValue::F64`] |
/// | `bool` | [`EmValue::Bool`] (accepted wherever an `int32` is) |
/// | `char` | [`EmValue::Char`] (accepted wherever an `int32` is) |
/// | `string` | [`EmValue::Str`] |
/// | Object or array reference | [`EmValue::ObjectRef`] |
/// | Boxed value type | [`EmValue::Boxed`] |
/// | `null` | [`EmValue::Null`] |
///
/// Objects owned by the host itself (call maps, substitutes, method and type handles) are
/// carried as [`EmValue::Handle`] so that emitted code can pass them around like any other
/// object reference.
#[derive(Clone)]
pub enum EmValue {
    /// No value (void return)
    Void,
    /// 32-bit signed integer
    I32(i32),
    /// 64-bit signed integer
    I64(i64),
    /// 64-bit floating point
    F64(f64),
    /// Boolean
    Bool(bool),
    /// UTF-16 code unit, stored as a Rust `char`
    Char(char),
    /// Immutable string
    Str(Arc<str>),
    /// Reference to an object or array
    ObjectRef(ObjectRef),
    /// A boxed primitive or value type
    Boxed(Box<EmValue>),
    /// Null reference
    Null,
    /// Host-side object
    Handle(RuntimeHandle),
}

/// An object or array on the managed heap.
#[derive(Debug)]
pub enum HeapObject {
    /// Instance of a class
    Instance {
        /// The runtime type
        class: TypeSig,
        /// Field values by name
        fields: Mutex<FxHashMap<String, EmValue>>,
    },
    /// Single-dimensional array
    Array {
        /// Element type
        element: TypeSig,
        /// Elements
        items: Mutex<Vec<EmValue>>,
    },
}

impl HeapObject {
    /// A new instance of `class` with no fields set.
    #[must_use]
    pub fn instance(class: TypeSig) -> ObjectRef {
        Arc::new(HeapObject::Instance {
            class,
            fields: Mutex::new(FxHashMap::default()),
        })
    }

    /// A new array of `length` default elements.
    #[must_use]
    pub fn array(element: TypeSig, length: usize) -> ObjectRef {
        let fill = EmValue::default_for(&element);
        Arc::new(HeapObject::Array {
            element,
            items: Mutex::new(vec![fill; length]),
        })
    }

    /// A new array holding `items`.
    #[must_use]
    pub fn array_of(element: TypeSig, items: Vec<EmValue>) -> ObjectRef {
        Arc::new(HeapObject::Array {
            element,
            items: Mutex::new(items),
        })
    }

    /// The runtime type of this object.
    #[must_use]
    pub fn type_sig(&self) -> TypeSig {
        match self {
            HeapObject::Instance { class, .. } => class.clone(),
            HeapObject::Array { element, .. } => TypeSig::sz_array(element.clone()),
        }
    }

    /// Read a field, `None` when it was never written.
    ///
    /// # Errors
    /// Returns [`EmulationError::TypeMismatch`] for arrays.
    pub fn field(&self, name: &str) -> Result<Option<EmValue>> {
        match self {
            HeapObject::Instance { fields, .. } => Ok(lock!(fields).get(name).cloned()),
            HeapObject::Array { .. } => Err(EmulationError::TypeMismatch {
                operation: "ldfld",
                found: "array".to_string(),
            }
            .into()),
        }
    }

    /// Write a field.
    ///
    /// # Errors
    /// Returns [`EmulationError::TypeMismatch`] for arrays.
    pub fn set_field(&self, name: &str, value: EmValue) -> Result<()> {
        match self {
            HeapObject::Instance { fields, .. } => {
                lock!(fields).insert(name.to_string(), value);
                Ok(())
            }
            HeapObject::Array { .. } => Err(EmulationError::TypeMismatch {
                operation: "stfld",
                found: "array".to_string(),
            }
            .into()),
        }
    }

    /// Copy of all elements.
    ///
    /// # Errors
    /// Returns [`EmulationError::TypeMismatch`] for instances.
    pub fn elements(&self) -> Result<Vec<EmValue>> {
        match self {
            HeapObject::Array { items, .. } => Ok(lock!(items).clone()),
            HeapObject::Instance { class, .. } => Err(EmulationError::TypeMismatch {
                operation: "ldelem",
                found: class.to_string(),
            }
            .into()),
        }
    }

    /// Number of elements.
    ///
    /// # Errors
    /// Returns [`EmulationError::TypeMismatch`] for instances.
    pub fn length(&self) -> Result<usize> {
        match self {
            HeapObject::Array { items, .. } => Ok(lock!(items).len()),
            HeapObject::Instance { class, .. } => Err(EmulationError::TypeMismatch {
                operation: "ldlen",
                found: class.to_string(),
            }
            .into()),
        }
    }

    /// Read one element.
    ///
    /// # Errors
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] or
    /// [`EmulationError::TypeMismatch`].
    pub fn element(&self, index: i64) -> Result<EmValue> {
        match self {
            HeapObject::Array { items, .. } => {
                let items = lock!(items);
                usize::try_from(index)
                    .ok()
                    .and_then(|slot| items.get(slot).cloned())
                    .ok_or_else(|| {
                        EmulationError::ArrayIndexOutOfBounds {
                            index,
                            length: items.len(),
                        }
                        .into()
                    })
            }
            HeapObject::Instance { class, .. } => Err(EmulationError::TypeMismatch {
                operation: "ldelem",
                found: class.to_string(),
            }
            .into()),
        }
    }

    /// Write one element.
    ///
    /// # Errors
    /// Returns [`EmulationError::ArrayIndexOutOfBounds`] or
    /// [`EmulationError::TypeMismatch`].
    pub fn set_element(&self, index: i64, value: EmValue) -> Result<()> {
        match self {
            HeapObject::Array { items, .. } => {
                let mut items = lock!(items);
                let length = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|slot| items.get_mut(slot))
                    .ok_or(EmulationError::ArrayIndexOutOfBounds { index, length })?;
                *slot = value;
                Ok(())
            }
            HeapObject::Instance { class, .. } => Err(EmulationError::TypeMismatch {
                operation: "stelem",
                found: class.to_string(),
            }
            .into()),
        }
    }
}

/// Host objects reachable from executing code.
#[derive(Clone)]
pub enum RuntimeHandle {
    /// Result of `ldtoken` on a type
    Type(TypeSig),
    /// Result of `ldtoken` on a method
    Method(Arc<MethodDescriptor>),
    /// A call provider selected for a host method
    Provider(Arc<dyn CallProvider>),
    /// A published call map
    CallMap(Arc<CallMap>),
    /// A substitute taken from a call map
    Substitute(Arc<dyn Substitute>),
    /// A constructed invocation context
    Context(Arc<InvocationContext>),
    /// A captured stack trace
    StackTrace(Arc<StackTrace>),
}

impl RuntimeHandle {
    /// Runtime type name reported for the handle.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            RuntimeHandle::Type(_) => "System.Type",
            RuntimeHandle::Method(_) => "System.Reflection.MethodBase",
            RuntimeHandle::Provider(_) => "Dotshim.Runtime.ICallProvider",
            RuntimeHandle::CallMap(_) => "Dotshim.Runtime.CallMap",
            RuntimeHandle::Substitute(_) => "Dotshim.Runtime.ISubstitute",
            RuntimeHandle::Context(_) => "Dotshim.Runtime.InvocationContext",
            RuntimeHandle::StackTrace(_) => "System.Diagnostics.StackTrace",
        }
    }
}

impl PartialEq for RuntimeHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RuntimeHandle::Type(a), RuntimeHandle::Type(b)) => a == b,
            (RuntimeHandle::Method(a), RuntimeHandle::Method(b)) => a == b,
            (RuntimeHandle::Provider(a), RuntimeHandle::Provider(b)) => Arc::ptr_eq(a, b),
            (RuntimeHandle::CallMap(a), RuntimeHandle::CallMap(b)) => Arc::ptr_eq(a, b),
            (RuntimeHandle::Substitute(a), RuntimeHandle::Substitute(b)) => Arc::ptr_eq(a, b),
            (RuntimeHandle::Context(a), RuntimeHandle::Context(b)) => Arc::ptr_eq(a, b),
            (RuntimeHandle::StackTrace(a), RuntimeHandle::StackTrace(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeHandle::Type(ty) => write!(f, "Type({ty})"),
            RuntimeHandle::Method(method) => write!(f, "Method({method})"),
            RuntimeHandle::Context(context) => write!(f, "Context({context})"),
            other => f.write_str(other.type_name()),
        }
    }
}

impl EmValue {
    /// The zero value a local or field of type `ty` starts with.
    #[must_use]
    pub fn default_for(ty: &TypeSig) -> EmValue {
        match ty {
            TypeSig::Boolean => EmValue::Bool(false),
            TypeSig::Char => EmValue::Char('\0'),
            TypeSig::I4 => EmValue::I32(0),
            TypeSig::I8 => EmValue::I64(0),
            TypeSig::R8 => EmValue::F64(0.0),
            _ => EmValue::Null,
        }
    }

    /// Shorthand for a string value.
    #[must_use]
    pub fn string(value: &str) -> EmValue {
        EmValue::Str(Arc::from(value))
    }

    /// Whether this is the null reference.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, EmValue::Null)
    }

    /// The runtime type of the value. Null reports `System.Object`.
    #[must_use]
    pub fn type_sig(&self) -> TypeSig {
        match self {
            EmValue::Void => TypeSig::Void,
            EmValue::I32(_) => TypeSig::I4,
            EmValue::I64(_) => TypeSig::I8,
            EmValue::F64(_) => TypeSig::R8,
            EmValue::Bool(_) => TypeSig::Boolean,
            EmValue::Char(_) => TypeSig::Char,
            EmValue::Str(_) => TypeSig::String,
            EmValue::ObjectRef(object) => object.type_sig(),
            EmValue::Boxed(inner) => inner.type_sig(),
            EmValue::Null => TypeSig::Object,
            EmValue::Handle(handle) => TypeSig::class(handle.type_name()),
        }
    }

    /// Integer view used by arithmetic, comparisons and conditional branches.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EmValue::I32(value) => Some(i64::from(*value)),
            EmValue::I64(value) => Some(*value),
            EmValue::Bool(value) => Some(i64::from(*value)),
            EmValue::Char(value) => Some(i64::from(u32::from(*value))),
            _ => None,
        }
    }

    /// 32-bit integer view; `bool` and `char` widen like on the CIL stack.
    #[must_use]
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            EmValue::I32(value) => Some(*value),
            EmValue::Bool(value) => Some(i32::from(*value)),
            EmValue::Char(value) => i32::try_from(u32::from(*value)).ok(),
            _ => None,
        }
    }

    /// The string behind a string value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            EmValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// The heap object behind an object reference.
    #[must_use]
    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            EmValue::ObjectRef(object) => Some(object),
            _ => None,
        }
    }

    /// The host object behind a handle.
    #[must_use]
    pub fn as_handle(&self) -> Option<&RuntimeHandle> {
        match self {
            EmValue::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    /// Truth value tested by `brtrue`/`brfalse`: non-zero numbers and non-null references.
    #[must_use]
    pub fn is_truthy(&self) -> bool {
        match self {
            EmValue::Void | EmValue::Null => false,
            EmValue::F64(value) => *value != 0.0,
            other => other.as_i64().map_or(true, |value| value != 0),
        }
    }

    /// Convert a stack value into the representation of a location typed `ty`.
    ///
    /// Integers stored into `bool` and `char` slots become [`EmValue::Bool`] and
    /// [`EmValue::Char`]; everything else is kept as is.
    #[must_use]
    pub fn coerce_to(self, ty: &TypeSig) -> EmValue {
        match (ty, &self) {
            (TypeSig::Boolean, EmValue::I32(value)) => EmValue::Bool(*value != 0),
            (TypeSig::Char, EmValue::I32(value)) => u32::try_from(*value)
                .ok()
                .and_then(char::from_u32)
                .map_or(self, EmValue::Char),
            (TypeSig::I8, EmValue::I32(value)) => EmValue::I64(i64::from(*value)),
            _ => self,
        }
    }

    /// `box` semantics: wrap value types, pass references through.
    #[must_use]
    pub fn box_as(self, ty: &TypeSig) -> EmValue {
        match self {
            EmValue::I32(_)
            | EmValue::I64(_)
            | EmValue::F64(_)
            | EmValue::Bool(_)
            | EmValue::Char(_) => EmValue::Boxed(Box::new(self.coerce_to(ty))),
            other => other,
        }
    }

    /// Box whatever needs boxing to be stored as `System.Object`.
    #[must_use]
    pub fn into_object(self) -> EmValue {
        let ty = self.type_sig();
        self.box_as(&ty)
    }

    /// Undo [`EmValue::into_object`] for values that are boxed.
    #[must_use]
    pub fn unboxed(self) -> EmValue {
        match self {
            EmValue::Boxed(inner) => *inner,
            other => other,
        }
    }

    /// `unbox.any` semantics: unwrap a boxed value of type `ty`, or cast a reference.
    ///
    /// # Errors
    /// Returns [`EmulationError::NullReference`] when unboxing null into a value type and
    /// [`EmulationError::InvalidCast`] when the runtime type does not fit.
    pub fn unbox_to(self, ty: &TypeSig, resolver: &dyn TypeResolver) -> Result<EmValue> {
        if ty.is_value_type() {
            return match self {
                EmValue::Boxed(inner) => {
                    let inner = inner.coerce_to(ty);
                    if inner.type_sig() == *ty {
                        Ok(inner)
                    } else {
                        Err(EmulationError::InvalidCast {
                            from: inner.type_sig().to_string(),
                            to: ty.to_string(),
                        }
                        .into())
                    }
                }
                EmValue::Null => Err(EmulationError::NullReference.into()),
                other if other.type_sig() == *ty => Ok(other),
                other => Err(EmulationError::InvalidCast {
                    from: other.type_sig().to_string(),
                    to: ty.to_string(),
                }
                .into()),
            };
        }

        if self.is_null() || ty.is_assignable_from(&self.type_sig(), resolver) {
            Ok(self)
        } else {
            Err(EmulationError::InvalidCast {
                from: self.type_sig().to_string(),
                to: ty.to_string(),
            }
            .into())
        }
    }
}

impl Default for EmValue {
    fn default() -> Self {
        EmValue::Null
    }
}

impl PartialEq for EmValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EmValue::Void, EmValue::Void) | (EmValue::Null, EmValue::Null) => true,
            (EmValue::F64(a), EmValue::F64(b)) => a == b,
            (EmValue::Str(a), EmValue::Str(b)) => a == b,
            (EmValue::ObjectRef(a), EmValue::ObjectRef(b)) => Arc::ptr_eq(a, b),
            (EmValue::Boxed(a), EmValue::Boxed(b)) => a == b,
            (EmValue::Handle(a), EmValue::Handle(b)) => a == b,
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

impl fmt::Debug for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::Void => write!(f, "void"),
            EmValue::I32(value) => write!(f, "{value}"),
            EmValue::I64(value) => write!(f, "{value}L"),
            EmValue::F64(value) => write!(f, "{value:?}"),
            EmValue::Bool(value) => write!(f, "{value}"),
            EmValue::Char(value) => write!(f, "{value:?}"),
            EmValue::Str(value) => write!(f, "{value:?}"),
            EmValue::ObjectRef(object) => write!(f, "<{}>", object.type_sig()),
            EmValue::Boxed(inner) => write!(f, "box({inner:?})"),
            EmValue::Null => write!(f, "null"),
            EmValue::Handle(handle) => write!(f, "{handle:?}"),
        }
    }
}

impl fmt::Display for EmValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmValue::Str(value) => write!(f, "\"{value}\""),
            EmValue::Boxed(inner) => write!(f, "{inner}"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::typesig::NoResolver;

    #[test]
    fn boxing_round_trip() {
        let boxed = EmValue::I32(7).box_as(&TypeSig::I4);
        assert!(matches!(boxed, EmValue::Boxed(_)));
        assert_eq!(
            boxed.unbox_to(&TypeSig::I4, &NoResolver).unwrap(),
            EmValue::I32(7)
        );
    }

    #[test]
    fn boxing_bool_from_stack_int() {
        let boxed = EmValue::I32(1).box_as(&TypeSig::Boolean);
        assert_eq!(boxed.type_sig(), TypeSig::Boolean);
        assert_eq!(
            boxed.unbox_to(&TypeSig::Boolean, &NoResolver).unwrap(),
            EmValue::Bool(true)
        );
    }

    #[test]
    fn unbox_null_and_wrong_type() {
        assert!(matches!(
            EmValue::Null.unbox_to(&TypeSig::I4, &NoResolver),
            Err(crate::Error::Emulation(EmulationError::NullReference))
        ));
        assert!(matches!(
            EmValue::string("x").unbox_to(&TypeSig::I4, &NoResolver),
            Err(crate::Error::Emulation(EmulationError::InvalidCast { .. }))
        ));
        assert!(EmValue::Null
            .unbox_to(&TypeSig::String, &NoResolver)
            .unwrap()
            .is_null());
    }

    #[test]
    fn reference_equality() {
        let a = HeapObject::instance(TypeSig::class("Demo.C"));
        let b = HeapObject::instance(TypeSig::class("Demo.C"));
        assert_eq!(EmValue::ObjectRef(a.clone()), EmValue::ObjectRef(a.clone()));
        assert_ne!(EmValue::ObjectRef(a), EmValue::ObjectRef(b));
        assert_eq!(EmValue::Bool(true), EmValue::I32(1));
    }

    #[test]
    fn arrays() {
        let array = HeapObject::array(TypeSig::Object, 2);
        array.set_element(1, EmValue::string("x")).unwrap();
        assert_eq!(array.length().unwrap(), 2);
        assert_eq!(array.element(1).unwrap(), EmValue::string("x"));
        assert!(array.element(2).is_err());
        assert!(array.element(-1).is_err());
    }

    #[test]
    fn fields() {
        let object = HeapObject::instance(TypeSig::class("Demo.C"));
        assert_eq!(object.field("count").unwrap(), None);
        object.set_field("count", EmValue::I32(3)).unwrap();
        assert_eq!(object.field("count").unwrap(), Some(EmValue::I32(3)));
    }
}
