//! The per-call record handed to substitutes.

use std::{fmt, sync::Arc, thread::ThreadId};

use crate::{
    emulation::EmValue,
    metadata::{method::MethodDescriptor, typesig::TypeSig},
};

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// The executing method
    pub method: MethodDescriptor,
    /// Offset of the instruction being executed
    pub il_offset: u32,
}

/// Snapshot of the call stack, innermost frame first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StackTrace {
    frames: Vec<StackFrame>,
}

impl StackTrace {
    /// A trace over `frames`, innermost first.
    #[must_use]
    pub fn new(frames: Vec<StackFrame>) -> Self {
        StackTrace { frames }
    }

    /// All frames, innermost first.
    #[must_use]
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// The innermost frame.
    #[must_use]
    pub fn top(&self) -> Option<&StackFrame> {
        self.frames.first()
    }

    /// Number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether the trace is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for StackTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            writeln!(f, "   at {} [IL_{:04x}]", frame.method.full_name(), frame.il_offset)?;
        }
        Ok(())
    }
}

/// Everything known about one intercepted call.
///
/// Built by the rewritten code right before the substitute runs and never modified
/// afterwards. Value-type arguments arrive boxed; `ref`/`out` arguments arrive as null.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    target: EmValue,
    calling_instance: EmValue,
    calling_method: MethodDescriptor,
    target_method: MethodDescriptor,
    stack_trace: Arc<StackTrace>,
    parameter_types: Vec<TypeSig>,
    type_arguments: Vec<TypeSig>,
    arguments: Vec<EmValue>,
    thread_id: ThreadId,
}

impl InvocationContext {
    /// Record a call of `target_method` made from `calling_method`, on the current thread.
    ///
    /// `target` is the receiver, or null for static calls and constructions.
    #[must_use]
    pub fn new(
        target: EmValue,
        calling_instance: EmValue,
        calling_method: MethodDescriptor,
        target_method: MethodDescriptor,
        stack_trace: Arc<StackTrace>,
        arguments: Vec<EmValue>,
    ) -> Self {
        InvocationContext {
            target,
            calling_instance,
            parameter_types: target_method.parameters.clone(),
            type_arguments: target_method.type_arguments.clone(),
            calling_method,
            target_method,
            stack_trace,
            arguments,
            thread_id: std::thread::current().id(),
        }
    }

    /// The receiver of the call; null for static methods and constructions.
    #[must_use]
    pub fn target(&self) -> &EmValue {
        &self.target
    }

    /// `this` of the method making the call; null when it is static.
    #[must_use]
    pub fn calling_instance(&self) -> &EmValue {
        &self.calling_instance
    }

    /// The method containing the call site.
    #[must_use]
    pub fn calling_method(&self) -> &MethodDescriptor {
        &self.calling_method
    }

    /// The method being called.
    #[must_use]
    pub fn target_method(&self) -> &MethodDescriptor {
        &self.target_method
    }

    /// The stack at the time of the call.
    #[must_use]
    pub fn stack_trace(&self) -> &StackTrace {
        &self.stack_trace
    }

    /// Parameter types of the target as instantiated at the call site.
    #[must_use]
    pub fn parameter_types(&self) -> &[TypeSig] {
        &self.parameter_types
    }

    /// Type arguments of a generic target.
    #[must_use]
    pub fn type_arguments(&self) -> &[TypeSig] {
        &self.type_arguments
    }

    /// Argument values in declaration order.
    #[must_use]
    pub fn arguments(&self) -> &[EmValue] {
        &self.arguments
    }

    /// The thread that made the call.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl fmt::Display for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}(",
            self.target_method.declaring_type, self.target_method.name
        )?;
        for (index, argument) in self.arguments.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{argument}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::method::MethodFlags;

    fn helper() -> MethodDescriptor {
        MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
            .with_parameters(vec![TypeSig::String, TypeSig::I4])
            .with_flags(MethodFlags::STATIC)
    }

    #[test]
    fn display_quotes_strings() {
        let context = InvocationContext::new(
            EmValue::Null,
            EmValue::Null,
            MethodDescriptor::new(TypeSig::class("Demo.C"), "Do"),
            helper(),
            Arc::new(StackTrace::default()),
            vec![EmValue::string("x"), EmValue::I32(2).box_as(&TypeSig::I4)],
        );
        assert_eq!(context.to_string(), "Demo.Util.Helper(\"x\", 2)");
        assert_eq!(context.parameter_types(), &[TypeSig::String, TypeSig::I4]);
        assert_eq!(context.thread_id(), std::thread::current().id());
    }

    #[test]
    fn stack_trace_rendering() {
        let trace = StackTrace::new(vec![
            StackFrame {
                method: helper(),
                il_offset: 0x10,
            },
            StackFrame {
                method: MethodDescriptor::new(TypeSig::class("Demo.C"), "Do"),
                il_offset: 2,
            },
        ]);
        assert_eq!(trace.len(), 2);
        assert_eq!(trace.top().map(|frame| frame.il_offset), Some(0x10));
        assert_eq!(
            trace.to_string(),
            "   at Demo.Util::Helper [IL_0010]\n   at Demo.C::Do [IL_0002]\n"
        );
    }
}
