//! The runtime helpers rewritten code calls.
//!
//! Rewritten method bodies reach the interception state only through these methods. The
//! rewriter imports them as member references; the [`Machine`](crate::emulation::Machine)
//! recognizes them by shape and implements them on top of
//! [`Interception`](crate::interception::Interception).
//!
//! | Helper | Signature |
//! |--------|-----------|
//! | `GetProvider` | `static ICallProvider Interceptor::GetProvider(object, Type)` |
//! | `GetMap` | `static CallMap Interceptor::GetMap(ICallProvider, object, MethodBase, MethodBase[], StackTrace)` |
//! | `CaptureStackTrace` | `static StackTrace Interceptor::CaptureStackTrace()` |
//! | `ContainsMapping` | `bool CallMap::ContainsMapping(MethodBase)` |
//! | `GetSubstitute` | `ISubstitute CallMap::GetSubstitute(MethodBase)` |
//! | `Invoke` | `object ISubstitute::Invoke(InvocationContext)` |
//! | `NewInvocationContext` | `InvocationContext::.ctor(object, object, MethodBase, MethodBase, StackTrace, object[])` |
//! | `GetMethodFromHandle` | `static MethodBase MethodBase::GetMethodFromHandle(RuntimeMethodHandle)` |
//! | `GetTypeFromHandle` | `static Type Type::GetTypeFromHandle(RuntimeTypeHandle)` |

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::metadata::{
    method::{MethodDescriptor, MethodSig, CONSTRUCTOR_NAME},
    module::MemberRef,
    typesig::TypeSig,
};

/// Namespace of the interception runtime types.
pub const RUNTIME_NAMESPACE: &str = "Dotshim.Runtime";
/// Static entry points used by method prologues.
pub const INTERCEPTOR_TYPE: &str = "Dotshim.Runtime.Interceptor";
/// The per-host call map.
pub const CALL_MAP_TYPE: &str = "Dotshim.Runtime.CallMap";
/// The provider interface.
pub const PROVIDER_TYPE: &str = "Dotshim.Runtime.ICallProvider";
/// The substitute interface.
pub const SUBSTITUTE_TYPE: &str = "Dotshim.Runtime.ISubstitute";
/// The invocation record.
pub const CONTEXT_TYPE: &str = "Dotshim.Runtime.InvocationContext";

fn method_base() -> TypeSig {
    TypeSig::class("System.Reflection.MethodBase")
}

fn system_type() -> TypeSig {
    TypeSig::class("System.Type")
}

fn stack_trace() -> TypeSig {
    TypeSig::class("System.Diagnostics.StackTrace")
}

/// One runtime helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCount)]
pub enum RuntimeHelper {
    /// Pick the provider for the running instance
    GetProvider,
    /// Fetch (and on first use populate) the host's call map
    GetMap,
    /// Snapshot the call stack
    CaptureStackTrace,
    /// Ask a call map whether it has a substitute
    ContainsMapping,
    /// Take a substitute from a call map
    GetSubstitute,
    /// Run a substitute
    Invoke,
    /// Construct an invocation context
    NewInvocationContext,
    /// Turn an `ldtoken` method handle into a method object
    GetMethodFromHandle,
    /// Turn an `ldtoken` type handle into a type object
    GetTypeFromHandle,
}

impl RuntimeHelper {
    /// The structural descriptor of the helper.
    #[must_use]
    pub fn descriptor(self) -> MethodDescriptor {
        let sig = self.signature();
        sig.to_descriptor(&self.declaring_type(), self.name())
    }

    /// The member reference the rewriter imports for the helper.
    #[must_use]
    pub fn member_ref(self) -> MemberRef {
        MemberRef {
            parent: self.declaring_type(),
            name: self.name().to_string(),
            signature: self.signature(),
        }
    }

    /// The helper a call targets, if it targets one.
    #[must_use]
    pub fn identify(method: &MethodDescriptor) -> Option<RuntimeHelper> {
        RuntimeHelper::iter().find(|helper| {
            if helper.name() != method.name {
                return false;
            }
            let known = helper.descriptor();
            known.lookup_key() == method.lookup_key() && known.is_static() == method.is_static()
        })
    }

    fn declaring_type(self) -> TypeSig {
        match self {
            RuntimeHelper::GetProvider | RuntimeHelper::GetMap | RuntimeHelper::CaptureStackTrace => {
                TypeSig::class(INTERCEPTOR_TYPE)
            }
            RuntimeHelper::ContainsMapping | RuntimeHelper::GetSubstitute => {
                TypeSig::class(CALL_MAP_TYPE)
            }
            RuntimeHelper::Invoke => TypeSig::class(SUBSTITUTE_TYPE),
            RuntimeHelper::NewInvocationContext => TypeSig::class(CONTEXT_TYPE),
            RuntimeHelper::GetMethodFromHandle => method_base(),
            RuntimeHelper::GetTypeFromHandle => system_type(),
        }
    }

    /// The method name of the helper.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            RuntimeHelper::GetProvider => "GetProvider",
            RuntimeHelper::GetMap => "GetMap",
            RuntimeHelper::CaptureStackTrace => "CaptureStackTrace",
            RuntimeHelper::ContainsMapping => "ContainsMapping",
            RuntimeHelper::GetSubstitute => "GetSubstitute",
            RuntimeHelper::Invoke => "Invoke",
            RuntimeHelper::NewInvocationContext => CONSTRUCTOR_NAME,
            RuntimeHelper::GetMethodFromHandle => "GetMethodFromHandle",
            RuntimeHelper::GetTypeFromHandle => "GetTypeFromHandle",
        }
    }

    fn signature(self) -> MethodSig {
        let (has_this, parameters, return_type) = match self {
            RuntimeHelper::GetProvider => (
                false,
                vec![TypeSig::Object, system_type()],
                TypeSig::class(PROVIDER_TYPE),
            ),
            RuntimeHelper::GetMap => (
                false,
                vec![
                    TypeSig::class(PROVIDER_TYPE),
                    TypeSig::Object,
                    method_base(),
                    TypeSig::sz_array(method_base()),
                    stack_trace(),
                ],
                TypeSig::class(CALL_MAP_TYPE),
            ),
            RuntimeHelper::CaptureStackTrace => (false, vec![], stack_trace()),
            RuntimeHelper::ContainsMapping => (true, vec![method_base()], TypeSig::Boolean),
            RuntimeHelper::GetSubstitute => {
                (true, vec![method_base()], TypeSig::class(SUBSTITUTE_TYPE))
            }
            RuntimeHelper::Invoke => (true, vec![TypeSig::class(CONTEXT_TYPE)], TypeSig::Object),
            RuntimeHelper::NewInvocationContext => (
                true,
                vec![
                    TypeSig::Object,
                    TypeSig::Object,
                    method_base(),
                    method_base(),
                    stack_trace(),
                    TypeSig::sz_array(TypeSig::Object),
                ],
                TypeSig::Void,
            ),
            RuntimeHelper::GetMethodFromHandle => (
                false,
                vec![TypeSig::value_type("System.RuntimeMethodHandle")],
                method_base(),
            ),
            RuntimeHelper::GetTypeFromHandle => (
                false,
                vec![TypeSig::value_type("System.RuntimeTypeHandle")],
                system_type(),
            ),
        };
        MethodSig {
            has_this,
            parameters,
            return_type,
            generic_param_count: 0,
        }
    }
}

/// Local types the method prologue adds.
#[must_use]
pub fn call_map_local() -> TypeSig {
    TypeSig::class(CALL_MAP_TYPE)
}

/// Whether `type_name` belongs to the interception runtime.
#[must_use]
pub fn is_runtime_type(type_name: &str) -> bool {
    type_name
        .strip_prefix(RUNTIME_NAMESPACE)
        .is_some_and(|rest| rest.starts_with('.'))
}
