//! The runtime helpers behind rewritten method bodies.

use std::sync::Arc;

use log::trace;

use crate::{
    emulation::{machine::Machine, EmValue, EmulationError, RuntimeHandle},
    interception::{InvocationContext, StackTrace},
    metadata::{method::MethodDescriptor, typesig::TypeResolver},
    rewriter::intrinsics::RuntimeHelper,
    Result,
};

fn mismatch(helper: RuntimeHelper, found: &EmValue) -> crate::Error {
    EmulationError::TypeMismatch {
        operation: helper.name(),
        found: format!("{found:?}"),
    }
    .into()
}

fn argument(args: &[EmValue], index: usize) -> Result<&EmValue> {
    args.get(index).ok_or_else(|| {
        EmulationError::ArgumentIndexOutOfBounds {
            index,
            count: args.len(),
        }
        .into()
    })
}

fn method_handle(helper: RuntimeHelper, value: &EmValue) -> Result<Arc<MethodDescriptor>> {
    match value {
        EmValue::Handle(RuntimeHandle::Method(method)) => Ok(method.clone()),
        other => Err(mismatch(helper, other)),
    }
}

fn stack_trace_handle(helper: RuntimeHelper, value: &EmValue) -> Result<Arc<StackTrace>> {
    match value {
        EmValue::Handle(RuntimeHandle::StackTrace(trace)) => Ok(trace.clone()),
        EmValue::Null => Ok(Arc::new(StackTrace::default())),
        other => Err(mismatch(helper, other)),
    }
}

impl Machine {
    /// Execute a runtime helper. `this` is the receiver for instance helpers.
    pub(super) fn run_helper(
        &mut self,
        helper: RuntimeHelper,
        this: Option<EmValue>,
        args: Vec<EmValue>,
    ) -> Result<EmValue> {
        match helper {
            RuntimeHelper::GetProvider => {
                let instance = argument(&args, 0)?;
                let declaring_type = match argument(&args, 1)? {
                    EmValue::Handle(RuntimeHandle::Type(ty)) => ty,
                    other => return Err(mismatch(helper, other)),
                };
                Ok(self
                    .interception
                    .provider_for(instance, declaring_type)?
                    .map_or(EmValue::Null, |provider| {
                        EmValue::Handle(RuntimeHandle::Provider(provider))
                    }))
            }
            RuntimeHelper::GetMap => {
                let provider = match argument(&args, 0)? {
                    EmValue::Handle(RuntimeHandle::Provider(provider)) => provider.clone(),
                    EmValue::Null => return Ok(EmValue::Null),
                    other => return Err(mismatch(helper, other)),
                };
                let instance = argument(&args, 1)?;
                let host = method_handle(helper, argument(&args, 2)?)?;
                let intercepted = match argument(&args, 3)? {
                    EmValue::ObjectRef(array) => array
                        .elements()?
                        .iter()
                        .map(|element| method_handle(helper, element).map(|method| (*method).clone()))
                        .collect::<Result<Vec<_>>>()?,
                    EmValue::Null => Vec::new(),
                    other => return Err(mismatch(helper, other)),
                };
                let trace = stack_trace_handle(helper, argument(&args, 4)?)?;

                let hierarchy: Arc<dyn TypeResolver + Send + Sync> = self.module.clone();
                let map = self.interception.call_map(
                    provider.as_ref(),
                    instance,
                    &host,
                    &intercepted,
                    &trace,
                    hierarchy,
                )?;
                Ok(EmValue::Handle(RuntimeHandle::CallMap(map)))
            }
            RuntimeHelper::CaptureStackTrace => {
                let frames = self.call_stack.iter().rev().cloned().collect();
                Ok(EmValue::Handle(RuntimeHandle::StackTrace(Arc::new(
                    StackTrace::new(frames),
                ))))
            }
            RuntimeHelper::ContainsMapping | RuntimeHelper::GetSubstitute => {
                let map = match this.as_ref() {
                    Some(EmValue::Handle(RuntimeHandle::CallMap(map))) => map.clone(),
                    Some(EmValue::Null) | None => return Err(EmulationError::NullReference.into()),
                    Some(other) => return Err(mismatch(helper, other)),
                };
                let target = method_handle(helper, argument(&args, 0)?)?;

                if helper == RuntimeHelper::ContainsMapping {
                    return Ok(EmValue::Bool(map.contains_mapping(&target)));
                }
                Ok(map
                    .get_substitute(&target)
                    .map_or(EmValue::Null, |substitute| {
                        EmValue::Handle(RuntimeHandle::Substitute(substitute))
                    }))
            }
            RuntimeHelper::Invoke => {
                let substitute = match this.as_ref() {
                    Some(EmValue::Handle(RuntimeHandle::Substitute(substitute))) => substitute.clone(),
                    Some(EmValue::Null) | None => return Err(EmulationError::NullReference.into()),
                    Some(other) => return Err(mismatch(helper, other)),
                };
                let context = match argument(&args, 0)? {
                    EmValue::Handle(RuntimeHandle::Context(context)) => context.clone(),
                    other => return Err(mismatch(helper, other)),
                };

                trace!("Running substitute for {}", context.target_method().full_name());
                Ok(match substitute.invoke(&context)? {
                    EmValue::Void => EmValue::Null,
                    value => value.into_object(),
                })
            }
            RuntimeHelper::NewInvocationContext => {
                let target = argument(&args, 0)?.clone();
                let calling_instance = argument(&args, 1)?.clone();
                let calling_method = method_handle(helper, argument(&args, 2)?)?;
                let target_method = method_handle(helper, argument(&args, 3)?)?;
                let trace = stack_trace_handle(helper, argument(&args, 4)?)?;
                let arguments = match argument(&args, 5)? {
                    EmValue::ObjectRef(array) => array.elements()?,
                    EmValue::Null => Vec::new(),
                    other => return Err(mismatch(helper, other)),
                };

                let context = InvocationContext::new(
                    target,
                    calling_instance,
                    (*calling_method).clone(),
                    (*target_method).clone(),
                    trace,
                    arguments,
                );
                Ok(EmValue::Handle(RuntimeHandle::Context(Arc::new(context))))
            }
            RuntimeHelper::GetMethodFromHandle | RuntimeHelper::GetTypeFromHandle => {
                Ok(argument(&args, 0)?.clone())
            }
        }
    }
}
