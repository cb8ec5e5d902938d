//! Emission of the conditional dispatch scaffold.
//!
//! [`CallSiteRewriter`] replaces a method body with three parts:
//!
//! 1. A prologue that asks the runtime for the provider of the running instance and, when
//!    there is one, fetches the host's call map into a new local.
//! 2. The original instruction stream, where every interceptable `call`, `callvirt` and
//!    `newobj` is expanded into a test of the call map, a substitute path and a fallback
//!    path that executes the original instruction.
//! 3. Remapped branch targets and sequence points.
//!
//! Operands of the original call are spilled into fresh locals so both paths can reload
//! them. Branches are always re-emitted in their long form since the scaffold moves
//! targets far beyond the reach of a one-byte displacement.

use std::collections::HashMap;

use log::trace;
use rustc_hash::FxHashMap;
use strum::IntoEnumIterator;

use crate::{
    assembly::{decode_stream, Instruction, InstructionEncoder, Operand},
    metadata::{
        body::MethodBody,
        method::MethodDescriptor,
        module::Module,
        token::Token,
        typesig::TypeSig,
    },
    rewriter::{
        intrinsics::{self, RuntimeHelper},
        MethodBodyRewriter, RewriteOptions,
    },
    Result,
};

/// Stack slots the scaffold needs on top of the original body.
const SCAFFOLD_STACK: u16 = 12;

const NO_PROVIDER: &str = "prologue_no_provider";
const BODY_START: &str = "prologue_done";

fn label(offset: u32) -> String {
    format!("IL_{offset:04x}")
}

fn push_local(locals: &mut Vec<TypeSig>, ty: TypeSig) -> Result<u16> {
    let index = u16::try_from(locals.len())
        .map_err(|_| malformed_error!("Method has more than {} locals", u16::MAX))?;
    locals.push(ty);
    Ok(index)
}

/// An interceptable instruction.
#[derive(Debug)]
struct CallSite {
    token: Token,
    target: MethodDescriptor,
    construct: bool,
}

impl CallSite {
    fn has_receiver(&self) -> bool {
        !self.construct && self.target.has_this()
    }

    fn result_type(&self) -> TypeSig {
        if self.construct {
            self.target.declaring_type.clone()
        } else {
            self.target.return_type.clone()
        }
    }
}

/// Tokens imported into the module before any body is rewritten.
#[derive(Debug)]
struct Imports {
    helpers: FxHashMap<RuntimeHelper, Token>,
    method_base: Token,
    object: Token,
}

/// Facts about the method being rewritten.
struct Host {
    token: Token,
    has_this: bool,
    map_local: u16,
}

/// The [`MethodBodyRewriter`] that redirects call sites through the call map.
///
/// By-ref arguments reach substitutes as `null` and cannot be written back; the fallback
/// path still passes the original addresses.
#[derive(Debug, Default)]
pub struct CallSiteRewriter {
    options: RewriteOptions,
    imports: Option<Imports>,
}

impl CallSiteRewriter {
    /// A rewriter configured by `options`.
    #[must_use]
    pub fn new(options: RewriteOptions) -> Self {
        CallSiteRewriter {
            options,
            imports: None,
        }
    }

    fn imports(&self) -> Result<&Imports> {
        self.imports
            .as_ref()
            .ok_or_else(|| malformed_error!("Runtime references were not imported into the module"))
    }

    fn helper(&self, helper: RuntimeHelper) -> Result<Token> {
        self.imports()?
            .helpers
            .get(&helper)
            .copied()
            .ok_or_else(|| malformed_error!("Runtime helper {} was not imported", helper.name()))
    }

    fn site_for(&self, module: &Module, instruction: &Instruction) -> Result<Option<CallSite>> {
        let construct = instruction.is_newobj();
        if !instruction.is_call() && !construct {
            return Ok(None);
        }
        let token = instruction
            .token()
            .ok_or_else(|| malformed_error!("{} has no method operand", instruction))?;
        let target = module.resolve_method(token)?.with_declaring_type_arguments();

        if intrinsics::is_runtime_type(&target.declaring_type.type_name()) {
            return Ok(None);
        }
        let passthrough = if construct {
            !self.options.intercept_constructions || target.declaring_type == TypeSig::Object
        } else {
            target.is_constructor() || target.is_type_initializer()
        };
        if passthrough {
            return Ok(None);
        }

        Ok(Some(CallSite {
            token,
            target,
            construct,
        }))
    }

    fn load_this(encoder: &mut InstructionEncoder, host: &Host) -> Result<()> {
        if host.has_this {
            encoder.emit_ldarg(0)
        } else {
            encoder.emit_instruction("ldnull", None)
        }
    }

    fn load_method(&self, encoder: &mut InstructionEncoder, method: Token) -> Result<()> {
        encoder.emit_instruction("ldtoken", Some(Operand::Token(method)))?;
        encoder.emit_call("call", self.helper(RuntimeHelper::GetMethodFromHandle)?)
    }

    fn emit_prologue(
        &self,
        encoder: &mut InstructionEncoder,
        host: &Host,
        owner: Token,
        targets: &[Token],
    ) -> Result<()> {
        let imports = self.imports()?;

        Self::load_this(encoder, host)?;
        encoder.emit_instruction("ldtoken", Some(Operand::Token(owner)))?;
        encoder.emit_call("call", self.helper(RuntimeHelper::GetTypeFromHandle)?)?;
        encoder.emit_call("call", self.helper(RuntimeHelper::GetProvider)?)?;
        encoder.emit_instruction("dup", None)?;
        encoder.emit_branch("brfalse", NO_PROVIDER)?;

        Self::load_this(encoder, host)?;
        self.load_method(encoder, host.token)?;
        encoder.emit_ldc_i4(len_i32(targets.len())?)?;
        encoder.emit_instruction("newarr", Some(Operand::Token(imports.method_base)))?;
        for (index, target) in targets.iter().enumerate() {
            encoder.emit_instruction("dup", None)?;
            encoder.emit_ldc_i4(len_i32(index)?)?;
            self.load_method(encoder, *target)?;
            encoder.emit_instruction("stelem.ref", None)?;
        }
        encoder.emit_call("call", self.helper(RuntimeHelper::CaptureStackTrace)?)?;
        encoder.emit_call("call", self.helper(RuntimeHelper::GetMap)?)?;
        encoder.emit_stloc(host.map_local)?;
        encoder.emit_branch("br", BODY_START)?;

        encoder.define_label(NO_PROVIDER)?;
        encoder.emit_instruction("pop", None)?;
        encoder.define_label(BODY_START)
    }

    fn emit_site(
        &self,
        encoder: &mut InstructionEncoder,
        module: &mut Module,
        locals: &mut Vec<TypeSig>,
        host: &Host,
        instruction: &Instruction,
        site: &CallSite,
    ) -> Result<()> {
        let imports = self.imports()?;
        let fallback = format!("site_{:04x}_fallback", instruction.offset);
        let done = format!("site_{:04x}_done", instruction.offset);

        let receiver = if site.has_receiver() {
            Some(push_local(locals, site.target.declaring_type.clone())?)
        } else {
            None
        };
        let arguments = site
            .target
            .parameters
            .iter()
            .map(|ty| push_local(locals, ty.clone()))
            .collect::<Result<Vec<_>>>()?;

        for local in arguments.iter().rev() {
            encoder.emit_stloc(*local)?;
        }
        if let Some(local) = receiver {
            encoder.emit_stloc(local)?;
        }

        encoder.emit_ldloc(host.map_local)?;
        encoder.emit_branch("brfalse", &fallback)?;
        encoder.emit_ldloc(host.map_local)?;
        self.load_method(encoder, site.token)?;
        encoder.emit_call("callvirt", self.helper(RuntimeHelper::ContainsMapping)?)?;
        encoder.emit_branch("brfalse", &fallback)?;

        encoder.emit_ldloc(host.map_local)?;
        self.load_method(encoder, site.token)?;
        encoder.emit_call("callvirt", self.helper(RuntimeHelper::GetSubstitute)?)?;

        match receiver {
            Some(local) => {
                encoder.emit_ldloc(local)?;
                let declaring_type = &site.target.declaring_type;
                if declaring_type.needs_boxing() {
                    let token = module.type_token(declaring_type)?;
                    encoder.emit_instruction("box", Some(Operand::Token(token)))?;
                }
            }
            None => encoder.emit_instruction("ldnull", None)?,
        }
        Self::load_this(encoder, host)?;
        self.load_method(encoder, host.token)?;
        self.load_method(encoder, site.token)?;
        encoder.emit_call("call", self.helper(RuntimeHelper::CaptureStackTrace)?)?;

        encoder.emit_ldc_i4(len_i32(arguments.len())?)?;
        encoder.emit_instruction("newarr", Some(Operand::Token(imports.object)))?;
        for (index, (local, ty)) in arguments.iter().zip(&site.target.parameters).enumerate() {
            encoder.emit_instruction("dup", None)?;
            encoder.emit_ldc_i4(len_i32(index)?)?;
            if ty.is_by_ref() {
                encoder.emit_instruction("ldnull", None)?;
            } else {
                encoder.emit_ldloc(*local)?;
                if ty.needs_boxing() {
                    let token = module.type_token(ty)?;
                    encoder.emit_instruction("box", Some(Operand::Token(token)))?;
                }
            }
            encoder.emit_instruction("stelem.ref", None)?;
        }
        encoder.emit_call("newobj", self.helper(RuntimeHelper::NewInvocationContext)?)?;
        encoder.emit_call("callvirt", self.helper(RuntimeHelper::Invoke)?)?;

        let result = site.result_type();
        if result == TypeSig::Void {
            encoder.emit_instruction("pop", None)?;
        } else {
            let token = module.type_token(&result)?;
            encoder.emit_instruction("unbox.any", Some(Operand::Token(token)))?;
        }
        encoder.emit_branch("br", &done)?;

        encoder.define_label(&fallback)?;
        if let Some(local) = receiver {
            encoder.emit_ldloc(local)?;
        }
        for local in &arguments {
            encoder.emit_ldloc(*local)?;
        }
        encoder.emit_instruction_decoded(instruction)?;
        encoder.define_label(&done)
    }
}

fn len_i32(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| malformed_error!("Count {} does not fit an ldc.i4", value))
}

fn emit_original(encoder: &mut InstructionEncoder, instruction: &Instruction) -> Result<()> {
    if !instruction.is_branch() {
        return encoder.emit_instruction_decoded(instruction);
    }
    let target = instruction
        .branch_target()
        .ok_or_else(|| malformed_error!("{} has no branch target", instruction))?;
    encoder.emit_branch(instruction.info.long_form().mnemonic, &label(target))
}

impl MethodBodyRewriter for CallSiteRewriter {
    fn name(&self) -> &'static str {
        "call-site"
    }

    fn import_references(&mut self, module: &mut Module) -> Result<()> {
        let mut helpers = FxHashMap::default();
        for helper in RuntimeHelper::iter() {
            helpers.insert(helper, module.add_member_ref(helper.member_ref())?);
        }
        let method_base = module.type_token(&TypeSig::class("System.Reflection.MethodBase"))?;
        let object = module.type_token(&TypeSig::Object)?;

        self.imports = Some(Imports {
            helpers,
            method_base,
            object,
        });
        Ok(())
    }

    fn rewrite_method(&mut self, module: &mut Module, method: Token) -> Result<usize> {
        let def = module.method(method)?;
        let Some(body) = def.body.clone() else {
            return Ok(0);
        };
        let owner = def.owner;
        let has_this = def.has_this();

        let instructions = decode_stream(&body.code)?;
        let mut sites = FxHashMap::default();
        let mut targets: Vec<Token> = Vec::new();
        for instruction in &instructions {
            if let Some(site) = self.site_for(module, instruction)? {
                if !targets.contains(&site.token) {
                    targets.push(site.token);
                }
                sites.insert(instruction.offset, site);
            }
        }
        if sites.is_empty() {
            return Ok(0);
        }

        let mut locals = body.locals.clone();
        let host = Host {
            token: method,
            has_this,
            map_local: push_local(&mut locals, intrinsics::call_map_local())?,
        };

        let mut encoder = InstructionEncoder::new();
        self.emit_prologue(&mut encoder, &host, owner, &targets)?;
        for instruction in &instructions {
            encoder.define_label(&label(instruction.offset))?;
            match sites.get(&instruction.offset) {
                Some(site) => {
                    trace!("Intercepting {} at {}", site.target.full_name(), instruction);
                    self.emit_site(&mut encoder, module, &mut locals, &host, instruction, site)?;
                }
                None => emit_original(&mut encoder, instruction)?,
            }
        }
        let (code, labels) = encoder.finalize()?;

        let offsets: HashMap<u32, u32> = instructions
            .iter()
            .filter_map(|instruction| {
                labels
                    .get(&label(instruction.offset))
                    .map(|new| (instruction.offset, *new))
            })
            .collect();

        let rewritten = MethodBody {
            max_stack: body.max_stack.saturating_add(SCAFFOLD_STACK),
            init_locals: true,
            locals,
            code,
            sequence_points: body.sequence_points.remap(&offsets),
        };
        module.method_mut(method)?.body = Some(rewritten);
        Ok(sites.len())
    }
}
