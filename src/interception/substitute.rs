//! Substitute implementations.
//!
//! A [`Substitute`] receives the [`InvocationContext`] of an intercepted call and produces
//! the value the call site sees. Two implementations cover the common cases:
//!
//! - [`Delegate`] wraps a plain Rust closure. Its structural signature is derived from the
//!   closure's argument and return types, which lets registration reject closures that do
//!   not fit the method they replace. Arguments are unboxed before the call and value-type
//!   results boxed afterwards.
//! - [`FnSubstitute`] wraps a closure over the whole context, for substitutes that need
//!   the receiver, the calling method or the stack trace.
//!
//! # Examples
//!
//! ```rust
//! use dotshim::{interception::{Delegate, IntoDelegate}, metadata::typesig::TypeSig};
//!
//! let helper = (|name: String| -> i32 { name.len() as i32 }).into_delegate();
//! assert_eq!(helper.descriptor().parameters, vec![TypeSig::String]);
//! assert_eq!(helper.descriptor().return_type, TypeSig::I4);
//! ```

use std::{fmt, sync::Arc};

use crate::{
    emulation::{EmValue, EmulationError},
    interception::InvocationContext,
    metadata::{
        method::{MethodDescriptor, MethodFlags},
        typesig::TypeSig,
    },
    Error, Result,
};

/// Replacement behavior for intercepted calls.
pub trait Substitute: Send + Sync {
    /// Run the substitute for one call.
    ///
    /// # Errors
    /// Whatever the implementation reports; the error surfaces from the intercepted call.
    fn invoke(&self, context: &InvocationContext) -> Result<EmValue>;

    /// The structural signature of the implementation, when it has one. Exact rules with a
    /// signature are validated against their target at registration time.
    fn signature(&self) -> Option<&MethodDescriptor> {
        None
    }
}

/// Conversion from a runtime value into a closure argument.
pub trait FromValue: Sized {
    /// The parameter type the conversion accepts.
    fn type_sig() -> TypeSig;

    /// Convert `value`, which has already been unboxed.
    ///
    /// # Errors
    /// Returns [`EmulationError::InvalidCast`] when `value` has the wrong type.
    fn from_value(value: &EmValue) -> Result<Self>;
}

/// Conversion from a closure result into a runtime value.
pub trait IntoValue {
    /// The return type the conversion produces.
    fn type_sig() -> TypeSig;

    /// Convert the result.
    ///
    /// # Errors
    /// Only fallible for `Result` returns, which pass their error through.
    fn into_value(self) -> Result<EmValue>;
}

fn cast_error(value: &EmValue, to: &TypeSig) -> Error {
    EmulationError::InvalidCast {
        from: value.type_sig().to_string(),
        to: to.to_string(),
    }
    .into()
}

macro_rules! primitive_value {
    ($ty:ty, $sig:expr, $variant:ident, $from:expr) => {
        impl FromValue for $ty {
            fn type_sig() -> TypeSig {
                $sig
            }

            fn from_value(value: &EmValue) -> Result<Self> {
                let convert: fn(&EmValue) -> Option<$ty> = $from;
                convert(value).ok_or_else(|| cast_error(value, &$sig))
            }
        }

        impl IntoValue for $ty {
            fn type_sig() -> TypeSig {
                $sig
            }

            fn into_value(self) -> Result<EmValue> {
                Ok(EmValue::$variant(self))
            }
        }
    };
}

primitive_value!(i32, TypeSig::I4, I32, EmValue::as_i32);
primitive_value!(i64, TypeSig::I8, I64, EmValue::as_i64);
primitive_value!(bool, TypeSig::Boolean, Bool, |value| match value {
    EmValue::Bool(value) => Some(*value),
    EmValue::I32(value) => Some(*value != 0),
    _ => None,
});
primitive_value!(char, TypeSig::Char, Char, |value| match value {
    EmValue::Char(value) => Some(*value),
    EmValue::I32(value) => u32::try_from(*value).ok().and_then(char::from_u32),
    _ => None,
});
primitive_value!(f64, TypeSig::R8, F64, |value| match value {
    EmValue::F64(value) => Some(*value),
    _ => None,
});

impl FromValue for String {
    fn type_sig() -> TypeSig {
        TypeSig::String
    }

    fn from_value(value: &EmValue) -> Result<Self> {
        match value {
            EmValue::Str(value) => Ok(value.to_string()),
            EmValue::Null => Err(EmulationError::NullReference.into()),
            other => Err(cast_error(other, &TypeSig::String)),
        }
    }
}

impl IntoValue for String {
    fn type_sig() -> TypeSig {
        TypeSig::String
    }

    fn into_value(self) -> Result<EmValue> {
        Ok(EmValue::string(&self))
    }
}

impl IntoValue for &'static str {
    fn type_sig() -> TypeSig {
        TypeSig::String
    }

    fn into_value(self) -> Result<EmValue> {
        Ok(EmValue::string(self))
    }
}

impl FromValue for EmValue {
    fn type_sig() -> TypeSig {
        TypeSig::Object
    }

    fn from_value(value: &EmValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl IntoValue for EmValue {
    fn type_sig() -> TypeSig {
        TypeSig::Object
    }

    fn into_value(self) -> Result<EmValue> {
        Ok(self)
    }
}

impl IntoValue for () {
    fn type_sig() -> TypeSig {
        TypeSig::Void
    }

    fn into_value(self) -> Result<EmValue> {
        Ok(EmValue::Void)
    }
}

impl<T: IntoValue> IntoValue for Result<T> {
    fn type_sig() -> TypeSig {
        T::type_sig()
    }

    fn into_value(self) -> Result<EmValue> {
        self?.into_value()
    }
}

type DelegateBody = Arc<dyn Fn(&[EmValue], &[TypeSig]) -> Result<EmValue> + Send + Sync>;

/// A closure with a structural signature.
#[derive(Clone)]
pub struct Delegate {
    signature: MethodDescriptor,
    body: DelegateBody,
}

impl Delegate {
    /// A delegate over already-unboxed argument values, declaring `parameters` and
    /// `return_type` as its signature.
    pub fn raw<F>(parameters: Vec<TypeSig>, return_type: TypeSig, body: F) -> Self
    where
        F: Fn(&[EmValue]) -> Result<EmValue> + Send + Sync + 'static,
    {
        Delegate {
            signature: Self::shape(parameters, return_type),
            body: Arc::new(move |args: &[EmValue], _: &[TypeSig]| body(args)),
        }
    }

    /// A generic delegate with `count` type parameters. `parameters` and `return_type` may
    /// use [`TypeSig::MVar`]; the body receives the type arguments of each call.
    pub fn generic<F>(count: u32, parameters: Vec<TypeSig>, return_type: TypeSig, body: F) -> Self
    where
        F: Fn(&[EmValue], &[TypeSig]) -> Result<EmValue> + Send + Sync + 'static,
    {
        Delegate {
            signature: Self::shape(parameters, return_type).generic(count),
            body: Arc::new(body),
        }
    }

    fn shape(parameters: Vec<TypeSig>, return_type: TypeSig) -> MethodDescriptor {
        MethodDescriptor::new(TypeSig::class("Dotshim.Runtime.Delegate"), "Invoke")
            .with_parameters(parameters)
            .returns(return_type)
            .with_flags(MethodFlags::STATIC)
    }

    /// The structural signature.
    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.signature
    }

    /// Call the closure directly.
    ///
    /// # Errors
    /// Returns [`Error::SignatureMismatch`] when the argument count is wrong, and whatever
    /// the closure or the argument conversions report.
    pub fn call(&self, args: &[EmValue], type_arguments: &[TypeSig]) -> Result<EmValue> {
        if args.len() != self.signature.parameters.len() {
            return Err(Error::SignatureMismatch {
                method: self.signature.name.clone(),
            });
        }
        (self.body)(args, type_arguments)
    }
}

impl Substitute for Delegate {
    fn invoke(&self, context: &InvocationContext) -> Result<EmValue> {
        let args: Vec<EmValue> = context
            .arguments()
            .iter()
            .cloned()
            .map(EmValue::unboxed)
            .collect();

        let result = self.call(&args, context.type_arguments())?;
        Ok(match result {
            EmValue::Void => EmValue::Void,
            other => other.into_object(),
        })
    }

    fn signature(&self) -> Option<&MethodDescriptor> {
        Some(&self.signature)
    }
}

impl fmt::Debug for Delegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delegate")
            .field("signature", &self.signature.to_string())
            .finish_non_exhaustive()
    }
}

/// Conversion of a closure into a [`Delegate`].
///
/// Implemented for closures of up to six arguments whose argument types implement
/// [`FromValue`] and whose return type implements [`IntoValue`].
pub trait IntoDelegate<Args> {
    /// Wrap the closure.
    fn into_delegate(self) -> Delegate;
}

macro_rules! impl_into_delegate {
    ($($arg:ident),*) => {
        impl<F, R, $($arg),*> IntoDelegate<($($arg,)*)> for F
        where
            F: Fn($($arg),*) -> R + Send + Sync + 'static,
            R: IntoValue,
            $($arg: FromValue,)*
        {
            #[allow(non_snake_case, unused_mut, unused_variables)]
            fn into_delegate(self) -> Delegate {
                Delegate::raw(vec![$($arg::type_sig()),*], R::type_sig(), move |args| {
                    let mut values = args.iter();
                    $(
                        let $arg = $arg::from_value(values.next().ok_or(EmulationError::StackUnderflow)?)?;
                    )*
                    (self)($($arg),*).into_value()
                })
            }
        }
    };
}

impl_into_delegate!();
impl_into_delegate!(A1);
impl_into_delegate!(A1, A2);
impl_into_delegate!(A1, A2, A3);
impl_into_delegate!(A1, A2, A3, A4);
impl_into_delegate!(A1, A2, A3, A4, A5);
impl_into_delegate!(A1, A2, A3, A4, A5, A6);

impl IntoDelegate<Delegate> for Delegate {
    fn into_delegate(self) -> Delegate {
        self
    }
}

/// A substitute over the full invocation context.
#[derive(Clone)]
pub struct FnSubstitute {
    body: Arc<dyn Fn(&InvocationContext) -> Result<EmValue> + Send + Sync>,
}

impl FnSubstitute {
    /// Wrap `body`.
    pub fn new<F>(body: F) -> Self
    where
        F: Fn(&InvocationContext) -> Result<EmValue> + Send + Sync + 'static,
    {
        FnSubstitute {
            body: Arc::new(body),
        }
    }
}

impl Substitute for FnSubstitute {
    fn invoke(&self, context: &InvocationContext) -> Result<EmValue> {
        (self.body)(context)
    }
}

impl fmt::Debug for FnSubstitute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnSubstitute")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::StackTrace;

    fn context(arguments: Vec<EmValue>, type_arguments: Vec<TypeSig>) -> InvocationContext {
        let target = MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
            .generic(type_arguments.len() as u32)
            .instantiate(&type_arguments);
        InvocationContext::new(
            EmValue::Null,
            EmValue::Null,
            MethodDescriptor::new(TypeSig::class("Demo.C"), "Do"),
            target,
            Arc::new(StackTrace::default()),
            arguments,
        )
    }

    #[test]
    fn closure_signature() {
        let delegate = (|a: i32, b: String| -> bool { a > 0 && !b.is_empty() }).into_delegate();
        assert_eq!(
            delegate.descriptor().parameters,
            vec![TypeSig::I4, TypeSig::String]
        );
        assert_eq!(delegate.descriptor().return_type, TypeSig::Boolean);

        let unit = (|| {}).into_delegate();
        assert!(unit.descriptor().parameters.is_empty());
        assert_eq!(unit.descriptor().return_type, TypeSig::Void);
    }

    #[test]
    fn invoke_unboxes_and_boxes() {
        let delegate = (|a: i32, b: i32| a + b).into_delegate();
        let result = delegate
            .invoke(&context(
                vec![
                    EmValue::I32(2).box_as(&TypeSig::I4),
                    EmValue::I32(3).box_as(&TypeSig::I4),
                ],
                vec![],
            ))
            .unwrap();
        assert_eq!(result, EmValue::Boxed(Box::new(EmValue::I32(5))));
    }

    #[test]
    fn wrong_argument_type() {
        let delegate = (|a: i32| a).into_delegate();
        assert!(delegate
            .invoke(&context(vec![EmValue::string("x")], vec![]))
            .is_err());
        assert!(matches!(
            delegate.invoke(&context(vec![], vec![])),
            Err(Error::SignatureMismatch { .. })
        ));
    }

    #[test]
    fn result_errors_pass_through() {
        let delegate =
            (|| -> Result<i32> { Err(Error::Substitute("nope".to_string())) }).into_delegate();
        assert_eq!(delegate.descriptor().return_type, TypeSig::I4);
        assert!(matches!(
            delegate.invoke(&context(vec![], vec![])),
            Err(Error::Substitute(_))
        ));
    }

    #[test]
    fn generic_delegate_receives_type_arguments() {
        let delegate = Delegate::generic(1, vec![TypeSig::MVar(0)], TypeSig::MVar(0), |args, types| {
            assert_eq!(types, &[TypeSig::I4]);
            Ok(args[0].clone())
        });
        assert!(delegate.descriptor().is_generic_definition());

        let result = delegate
            .invoke(&context(vec![EmValue::I32(9).box_as(&TypeSig::I4)], vec![TypeSig::I4]))
            .unwrap();
        assert_eq!(result.unboxed(), EmValue::I32(9));
    }

    #[test]
    fn fn_substitute_sees_context() {
        let substitute = FnSubstitute::new(|context| Ok(EmValue::string(&context.to_string())));
        assert!(substitute.signature().is_none());
        let result = substitute
            .invoke(&context(vec![EmValue::string("a")], vec![]))
            .unwrap();
        assert_eq!(result, EmValue::string("Demo.Util.Helper(\"a\")"));
    }
}
