//! The CIL interpreter.
//!
//! A [`Machine`] executes method bodies of one [`Module`] against one [`Interception`]
//! context. Each call runs in its own frame (arguments, locals, evaluation stack);
//! nested calls recurse. The per-instruction dispatch lives in `handlers`, the runtime
//! helpers rewritten code calls into live in `helpers`.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use dotshim::{
//!     assembly::InstructionAssembler,
//!     emulation::{EmValue, Machine},
//!     interception::Interception,
//!     metadata::{body::MethodBody, method::MethodFlags, module::{MethodDef, TypeDef}, typesig::TypeSig},
//!     Module,
//! };
//!
//! let mut module = Module::new("Demo");
//! let util = module.add_type(TypeDef::class("Demo.Util"));
//!
//! let mut asm = InstructionAssembler::new();
//! asm.ldarg(0)?.ldc_i4(2)?.mul()?.ret()?;
//! let (code, _) = asm.finish()?;
//!
//! let double = module.add_method(
//!     MethodDef::new(util, "Double")
//!         .with_flags(MethodFlags::STATIC)
//!         .with_parameters(vec![TypeSig::I4])
//!         .returns(TypeSig::I4)
//!         .with_body(MethodBody::new(code)),
//! )?;
//!
//! let mut machine = Machine::new(Arc::new(module), Arc::new(Interception::new()));
//! assert_eq!(machine.invoke(double, None, vec![EmValue::I32(21)])?, EmValue::I32(42));
//! # Ok::<(), dotshim::Error>(())
//! ```

mod handlers;
mod helpers;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use log::debug;
use rustc_hash::FxHashMap;

use crate::{
    assembly::{decode_stream, Instruction},
    emulation::{EmValue, EmulationError, HeapObject, NativeCall, Natives},
    interception::{Interception, StackFrame},
    metadata::{
        method::{MethodDescriptor, MethodFlags, CONSTRUCTOR_NAME},
        token::{TableId, Token},
        typesig::{TypeResolver, TypeSig},
    },
    rewriter::intrinsics::RuntimeHelper,
    Module, Result,
};

/// Hierarchy depth after which a virtual dispatch walk gives up.
const MAX_DISPATCH_DEPTH: usize = 64;

/// Execution limits of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineLimits {
    /// Deepest allowed nesting of calls
    pub max_call_depth: usize,
    /// Instructions one top-level invocation may execute
    pub max_instructions: u64,
}

impl Default for MachineLimits {
    fn default() -> Self {
        MachineLimits {
            max_call_depth: 256,
            max_instructions: 10_000_000,
        }
    }
}

/// What the dispatch loop does after an instruction.
#[derive(Debug)]
pub(crate) enum StepResult {
    /// Proceed with the next instruction
    Continue,
    /// Jump to the instruction at this offset
    Branch(u32),
    /// Leave the method with this value
    Return(EmValue),
}

/// A method body decoded once and shared by every execution of the method.
#[derive(Debug)]
pub(crate) struct DecodedBody {
    instructions: Vec<Instruction>,
    offsets: FxHashMap<u32, usize>,
    locals: Vec<TypeSig>,
    max_stack: usize,
}

impl DecodedBody {
    fn index_of(&self, offset: u32) -> Result<usize> {
        self.offsets
            .get(&offset)
            .copied()
            .ok_or_else(|| {
                crate::Error::InvalidBranch(format!("no instruction starts at IL_{offset:04x}"))
            })
    }
}

/// State of one executing method.
#[derive(Debug)]
pub(crate) struct Frame {
    method: MethodDescriptor,
    args: Vec<EmValue>,
    locals: Vec<EmValue>,
    stack: Vec<EmValue>,
    max_stack: usize,
}

impl Frame {
    fn new(method: MethodDescriptor, args: Vec<EmValue>, body: &DecodedBody) -> Self {
        let class_args = class_arguments(&method.declaring_type).to_vec();
        let locals = body
            .locals
            .iter()
            .map(|local| EmValue::default_for(&local.instantiate(&class_args, &method.type_arguments)))
            .collect();
        Frame {
            method,
            args,
            locals,
            stack: Vec::with_capacity(body.max_stack),
            max_stack: body.max_stack,
        }
    }

    fn push(&mut self, value: EmValue) -> Result<()> {
        if self.stack.len() >= self.max_stack {
            return Err(EmulationError::StackOverflow {
                limit: self.max_stack,
            }
            .into());
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<EmValue> {
        self.stack
            .pop()
            .ok_or_else(|| EmulationError::StackUnderflow.into())
    }

    /// Pop `count` values, returned in push order.
    fn pop_n(&mut self, count: usize) -> Result<Vec<EmValue>> {
        if self.stack.len() < count {
            return Err(EmulationError::StackUnderflow.into());
        }
        let split = self.stack.len() - count;
        Ok(self.stack.split_off(split))
    }

    fn peek(&self) -> Result<&EmValue> {
        self.stack
            .last()
            .ok_or_else(|| EmulationError::StackUnderflow.into())
    }

    /// Close a signature over the generic arguments this frame runs with.
    fn close(&self, ty: &TypeSig) -> TypeSig {
        ty.instantiate(
            class_arguments(&self.method.declaring_type),
            &self.method.type_arguments,
        )
    }

    fn close_method(&self, method: MethodDescriptor) -> MethodDescriptor {
        MethodDescriptor {
            declaring_type: self.close(&method.declaring_type),
            parameters: method.parameters.iter().map(|ty| self.close(ty)).collect(),
            return_type: self.close(&method.return_type),
            type_arguments: method.type_arguments.iter().map(|ty| self.close(ty)).collect(),
            ..method
        }
    }
}

fn class_arguments(ty: &TypeSig) -> &[TypeSig] {
    match ty {
        TypeSig::GenericInst(_, args) => args,
        _ => &[],
    }
}

/// Executes the methods of a module.
///
/// The machine owns the static fields of the module and a cache of decoded bodies. It
/// consults [`Interception`] only when executed code calls the runtime helpers, which is
/// what rewritten method bodies do.
pub struct Machine {
    module: Arc<Module>,
    interception: Arc<Interception>,
    natives: Natives,
    limits: MachineLimits,
    statics: FxHashMap<Token, EmValue>,
    bodies: FxHashMap<Token, Arc<DecodedBody>>,
    call_stack: Vec<StackFrame>,
    executed: u64,
}

impl Machine {
    /// A machine over `module` with the default natives and limits.
    #[must_use]
    pub fn new(module: Arc<Module>, interception: Arc<Interception>) -> Self {
        Machine {
            module,
            interception,
            natives: Natives::new(),
            limits: MachineLimits::default(),
            statics: FxHashMap::default(),
            bodies: FxHashMap::default(),
            call_stack: Vec::new(),
            executed: 0,
        }
    }

    /// Replace the execution limits.
    #[must_use]
    pub fn with_limits(mut self, limits: MachineLimits) -> Self {
        self.limits = limits;
        self
    }

    /// The module being executed.
    #[must_use]
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    /// The interception context rewritten code consults.
    #[must_use]
    pub fn interception(&self) -> &Arc<Interception> {
        &self.interception
    }

    /// The host-implemented methods.
    #[must_use]
    pub fn natives(&self) -> &Natives {
        &self.natives
    }

    /// The host-implemented methods, for registering more.
    pub fn natives_mut(&mut self) -> &mut Natives {
        &mut self.natives
    }

    /// Instructions executed by the most recent top-level invocation.
    #[must_use]
    pub fn instructions_executed(&self) -> u64 {
        self.executed
    }

    /// Run the method `token` with `this` (for instance methods) and `args`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Emulation`] for anything that goes wrong while executing and
    /// [`crate::Error::Malformed`] for tokens or bodies the module cannot resolve.
    pub fn invoke(
        &mut self,
        token: Token,
        this: Option<EmValue>,
        args: Vec<EmValue>,
    ) -> Result<EmValue> {
        let method = self.module.method_descriptor(token)?;
        if method.parameters.len() != args.len() {
            return Err(EmulationError::ArgumentIndexOutOfBounds {
                index: args.len(),
                count: method.parameters.len(),
            }
            .into());
        }

        let mut slots = Vec::with_capacity(args.len() + 1);
        if method.has_this() {
            slots.push(this.unwrap_or(EmValue::Null));
        }
        slots.extend(
            args.into_iter()
                .zip(&method.parameters)
                .map(|(arg, ty)| arg.coerce_to(ty)),
        );

        self.executed = 0;
        self.call_stack.clear();
        debug!("Invoking {}", method.full_name());
        self.execute(token, method, slots)
    }

    /// Run the first method called `name` on the type named `type_name`.
    ///
    /// # Errors
    /// Returns [`EmulationError::MissingMethod`] when the module defines no such method,
    /// otherwise see [`Machine::invoke`].
    pub fn invoke_by_name(
        &mut self,
        type_name: &str,
        name: &str,
        this: Option<EmValue>,
        args: Vec<EmValue>,
    ) -> Result<EmValue> {
        let token = self.module.find_method(type_name, name).ok_or_else(|| {
            EmulationError::MissingMethod {
                method: format!("{type_name}::{name}"),
            }
        })?;
        self.invoke(token, this, args)
    }

    /// Construct an instance of `type_name` through its constructor taking `args.len()`
    /// parameters.
    ///
    /// # Errors
    /// Returns [`EmulationError::MissingMethod`] when there is no such constructor,
    /// otherwise see [`Machine::invoke`].
    pub fn new_object(&mut self, type_name: &str, args: Vec<EmValue>) -> Result<EmValue> {
        let missing = || EmulationError::MissingMethod {
            method: format!("{type_name}::{CONSTRUCTOR_NAME}"),
        };
        let owner = self.module.find_type(type_name).ok_or_else(missing)?;
        let ctor = self
            .module
            .methods()
            .find(|(_, def)| {
                def.owner == owner && def.name == CONSTRUCTOR_NAME && def.parameters.len() == args.len()
            })
            .map(|(token, _)| token)
            .ok_or_else(missing)?;

        let class = self.module.type_def(owner)?.signature();
        let object = EmValue::ObjectRef(HeapObject::instance(class));
        self.invoke(ctor, Some(object.clone()), args)?;
        Ok(object)
    }

    /// Current value of a static field.
    ///
    /// # Errors
    /// Returns [`EmulationError::MissingField`] when the module has no such static field.
    pub fn static_field(&self, type_name: &str, field: &str) -> Result<EmValue> {
        let token = self.static_field_token(type_name, field)?;
        let def = self.module.field(token)?;
        Ok(self
            .statics
            .get(&token)
            .cloned()
            .unwrap_or_else(|| EmValue::default_for(&def.field_type)))
    }

    /// Overwrite a static field.
    ///
    /// # Errors
    /// Returns [`EmulationError::MissingField`] when the module has no such static field.
    pub fn set_static_field(&mut self, type_name: &str, field: &str, value: EmValue) -> Result<()> {
        let token = self.static_field_token(type_name, field)?;
        let ty = self.module.field(token)?.field_type.clone();
        self.statics.insert(token, value.coerce_to(&ty));
        Ok(())
    }

    fn static_field_token(&self, type_name: &str, field: &str) -> Result<Token> {
        self.module
            .find_type(type_name)
            .and_then(|owner| self.module.find_field(owner, field))
            .filter(|token| self.module.field(*token).is_ok_and(|def| def.is_static))
            .ok_or_else(|| {
                EmulationError::MissingField {
                    field: format!("{type_name}::{field}"),
                }
                .into()
            })
    }

    /// Run the body of `token` as `method` in a fresh frame.
    fn execute(&mut self, token: Token, method: MethodDescriptor, args: Vec<EmValue>) -> Result<EmValue> {
        if self.call_stack.len() >= self.limits.max_call_depth {
            return Err(EmulationError::CallDepthExceeded {
                limit: self.limits.max_call_depth,
            }
            .into());
        }

        let body = self.body(token, &method)?;
        let mut frame = Frame::new(method, args, &body);
        self.call_stack.push(StackFrame {
            method: frame.method.clone(),
            il_offset: 0,
        });
        let result = self.run_frame(&body, &mut frame);
        self.call_stack.pop();
        result
    }

    fn run_frame(&mut self, body: &DecodedBody, frame: &mut Frame) -> Result<EmValue> {
        let mut index = 0;
        loop {
            let Some(instruction) = body.instructions.get(index) else {
                return Err(EmulationError::FellThrough {
                    method: frame.method.full_name(),
                }
                .into());
            };

            self.executed += 1;
            if self.executed > self.limits.max_instructions {
                return Err(EmulationError::InstructionLimitExceeded {
                    limit: self.limits.max_instructions,
                }
                .into());
            }
            if let Some(current) = self.call_stack.last_mut() {
                current.il_offset = instruction.offset;
            }

            match self.step(frame, instruction)? {
                StepResult::Continue => index += 1,
                StepResult::Branch(target) => index = body.index_of(target)?,
                StepResult::Return(value) => return Ok(value),
            }
        }
    }

    fn body(&mut self, token: Token, method: &MethodDescriptor) -> Result<Arc<DecodedBody>> {
        if let Some(body) = self.bodies.get(&token) {
            return Ok(body.clone());
        }

        let def = self.module.method(token)?;
        let body = def.body.as_ref().ok_or_else(|| EmulationError::NoMethodBody {
            method: method.full_name(),
        })?;
        let instructions = decode_stream(&body.code)?;
        if instructions.is_empty() {
            return Err(EmulationError::NoMethodBody {
                method: method.full_name(),
            }
            .into());
        }

        let decoded = Arc::new(DecodedBody {
            offsets: instructions
                .iter()
                .enumerate()
                .map(|(index, instruction)| (instruction.offset, index))
                .collect(),
            instructions,
            locals: body.locals.clone(),
            max_stack: usize::from(body.max_stack),
        });
        self.bodies.insert(token, decoded.clone());
        Ok(decoded)
    }

    /// Resolve a method operand as seen from `frame`.
    fn resolve_method(&self, frame: &Frame, token: Token) -> Result<MethodDescriptor> {
        let method = self.module.resolve_method(token)?.with_declaring_type_arguments();
        if token.is_table(TableId::MethodDef) {
            Ok(method)
        } else {
            Ok(frame.close_method(method))
        }
    }

    /// Resolve a type operand as seen from `frame`.
    fn resolve_type(&self, frame: &Frame, token: Token) -> Result<TypeSig> {
        Ok(frame.close(&self.module.type_sig(token)?))
    }

    /// Whether the module defines the type `ty` names.
    fn defines(&self, ty: &TypeSig) -> bool {
        self.module.find_type(&ty.type_name()).is_some()
    }

    /// The definition of `method` on exactly the type `ty`.
    fn find_definition(&self, ty: &TypeSig, method: &MethodDescriptor) -> Option<Token> {
        let owner = self.module.find_type(&ty.type_name())?;
        let class_args = class_arguments(ty);

        let candidates: Vec<(Token, bool)> = self
            .module
            .methods()
            .filter(|(_, def)| {
                def.owner == owner
                    && def.name == method.name
                    && def.parameters.len() == method.parameters.len()
                    && def.generic_param_count as usize == method.type_arguments.len()
                    && def.has_this() == method.has_this()
            })
            .map(|(token, def)| {
                let exact = def
                    .parameters
                    .iter()
                    .map(|param| param.instantiate(class_args, &method.type_arguments))
                    .eq(method.parameters.iter().cloned());
                (token, exact)
            })
            .collect();

        match candidates.as_slice() {
            [(token, _)] => Some(*token),
            _ => candidates
                .iter()
                .find(|(_, exact)| *exact)
                .map(|(token, _)| *token),
        }
    }

    /// Call `method`, dispatching virtually on `this` when `virtual_call` is set.
    fn dispatch(
        &mut self,
        method: &MethodDescriptor,
        this: Option<EmValue>,
        args: Vec<EmValue>,
        virtual_call: bool,
    ) -> Result<EmValue> {
        if let Some(helper) = RuntimeHelper::identify(method) {
            return self.run_helper(helper, this, args);
        }

        let runtime_dispatch = virtual_call
            && method.has_this()
            && (method
                .flags
                .intersects(MethodFlags::VIRTUAL | MethodFlags::ABSTRACT)
                || !self.defines(&method.declaring_type));

        let start = match &this {
            Some(receiver) if runtime_dispatch => {
                if receiver.is_null() {
                    return Err(EmulationError::NullReference.into());
                }
                receiver.type_sig()
            }
            Some(receiver) if virtual_call && receiver.is_null() => {
                return Err(EmulationError::NullReference.into());
            }
            _ => method.declaring_type.clone(),
        };

        let mut current = Some(start);
        let mut depth = 0;
        while let Some(ty) = current {
            if depth > MAX_DISPATCH_DEPTH {
                break;
            }
            if let Some(token) = self.find_definition(&ty, method) {
                let mut callee = self.module.method_descriptor(token)?;
                callee.declaring_type = ty;
                let callee = callee
                    .with_declaring_type_arguments()
                    .instantiate(&method.type_arguments);

                let mut slots = Vec::with_capacity(args.len() + 1);
                if callee.has_this() {
                    slots.push(this.unwrap_or(EmValue::Null));
                }
                slots.extend(args);
                return self.execute(token, callee, slots);
            }
            current = self.module.base_type(&ty);
            depth += 1;
        }

        if let Some(native) = self.natives.get(method) {
            return native(&NativeCall {
                method,
                this: this.as_ref(),
                args: &args,
            });
        }

        Err(EmulationError::MissingMethod {
            method: method.full_name(),
        }
        .into())
    }
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("module", &self.module.name)
            .field("limits", &self.limits)
            .field("natives", &self.natives.len())
            .field("call_depth", &self.call_stack.len())
            .field("executed", &self.executed)
            .finish_non_exhaustive()
    }
}

impl TypeResolver for Machine {
    fn base_type(&self, ty: &TypeSig) -> Option<TypeSig> {
        self.module.base_type(ty)
    }

    fn interfaces(&self, ty: &TypeSig) -> Vec<TypeSig> {
        self.module.interfaces(ty)
    }
}
