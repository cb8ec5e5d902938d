//! Bytecode rewriting.
//!
//! Every eligible method body of a [`Module`] is rewritten once so that its call sites
//! consult the interception runtime before running. A method is eligible when it has a
//! body, is not abstract, is not a static initializer, is declared by a class (not an
//! interface or the `<Module>` pseudo-type) and was not processed by an earlier pass.
//!
//! The work is split between the [`rewrite_module`] driver, which selects methods and keeps
//! the [`ProcessedSet`], and a [`MethodBodyRewriter`] that transforms one body at a time.
//! [`CallSiteRewriter`] is the implementation that emits the conditional dispatch.
//!
//! # Example
//!
//! ```rust
//! use dotshim::{
//!     rewriter::{rewrite_module, CallSiteRewriter, RewriteOptions},
//!     Module,
//! };
//!
//! let mut module = Module::new("Empty");
//! let mut rewriter = CallSiteRewriter::new(RewriteOptions::default());
//! let report = rewrite_module(&mut module, &mut rewriter, &RewriteOptions::default())?;
//! assert_eq!(report.visited, 0);
//! # Ok::<(), dotshim::Error>(())
//! ```

use log::{debug, info};

use crate::{
    metadata::{
        method::{MethodFlags, TYPE_INITIALIZER_NAME},
        module::{Module, MODULE_TYPE_NAME},
        token::Token,
    },
    Result,
};

mod emitter;
pub mod intrinsics;
mod processed;

pub use emitter::CallSiteRewriter;
pub use processed::ProcessedSet;

/// A transformation applied to method bodies.
pub trait MethodBodyRewriter {
    /// Name used in log output.
    fn name(&self) -> &'static str;

    /// Add the references the rewritten bodies use to `module`. Called once per module
    /// before any [`MethodBodyRewriter::rewrite_method`].
    ///
    /// # Errors
    /// Returns an error if a table of the module is full.
    fn import_references(&mut self, module: &mut Module) -> Result<()>;

    /// Rewrite the body of `method` and return the number of call sites that now
    /// dispatch conditionally. A method without interceptable sites keeps its body.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when the body does not decode or a call operand
    /// does not resolve.
    fn rewrite_method(&mut self, module: &mut Module, method: Token) -> Result<usize>;
}

/// Options of a rewrite pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOptions {
    /// Redirect `newobj` sites as well as calls
    pub intercept_constructions: bool,
    /// Types whose methods are never rewritten, by full name or namespace prefix ending
    /// in `.`
    pub excluded_types: Vec<String>,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        RewriteOptions {
            intercept_constructions: true,
            excluded_types: Vec::new(),
        }
    }
}

impl RewriteOptions {
    fn excludes(&self, type_name: &str) -> bool {
        intrinsics::is_runtime_type(type_name)
            || self.excluded_types.iter().any(|excluded| {
                type_name == excluded
                    || (excluded.ends_with('.') && type_name.starts_with(excluded.as_str()))
            })
    }
}

/// What a rewrite pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RewriteReport {
    /// Eligible methods looked at
    pub visited: usize,
    /// Methods whose body changed
    pub rewritten: usize,
    /// Eligible methods left alone because an earlier pass processed them
    pub skipped: usize,
    /// Call sites that now dispatch conditionally
    pub sites: usize,
}

fn eligible_methods(module: &Module, options: &RewriteOptions) -> Result<Vec<Token>> {
    let mut methods = Vec::new();
    for (token, def) in module.methods() {
        let owner = module.type_def(def.owner)?;
        if owner.is_interface() || owner.name == MODULE_TYPE_NAME || options.excludes(&owner.name) {
            continue;
        }
        if def.body.is_none()
            || def.flags.contains(MethodFlags::ABSTRACT)
            || def.name == TYPE_INITIALIZER_NAME
        {
            continue;
        }
        methods.push(token);
    }
    Ok(methods)
}

/// Run `rewriter` over every eligible method of `module`.
///
/// Each visited method is recorded in the module's processed table, also when it had no
/// call site to rewrite, so running the pass again changes nothing.
///
/// # Errors
/// Stops at the first method that fails to rewrite. The module may then be partially
/// rewritten and should be discarded.
pub fn rewrite_module(
    module: &mut Module,
    rewriter: &mut dyn MethodBodyRewriter,
    options: &RewriteOptions,
) -> Result<RewriteReport> {
    let mut report = RewriteReport::default();
    let mut processed = ProcessedSet::from_module(module);
    let methods = eligible_methods(module, options)?;

    if methods.iter().any(|method| !processed.contains(*method)) {
        rewriter.import_references(module)?;
    }

    for method in methods {
        report.visited += 1;
        if processed.contains(method) {
            report.skipped += 1;
            continue;
        }

        let sites = rewriter.rewrite_method(module, method)?;
        debug!(
            "{}: {} has {} intercepted call sites",
            rewriter.name(),
            module.method_descriptor(method)?.full_name(),
            sites
        );
        if sites > 0 {
            report.rewritten += 1;
            report.sites += sites;
        }
        processed.insert(method);
    }
    processed.persist(module);

    info!(
        "Rewrote {} of {} methods in {} ({} call sites, {} already processed)",
        report.rewritten, report.visited, module.name, report.sites, report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::{
            body::MethodBody,
            method::MethodSig,
            module::{MemberRef, MethodDef, TypeDef},
            typesig::TypeSig,
        },
    };

    fn module_with_calls() -> Module {
        let mut module = Module::new("Demo");
        let util = module.add_type(TypeDef::class("Demo.Util"));
        let contract = module.add_type(TypeDef::interface("Demo.IService"));
        let helper = module
            .add_member_ref(MemberRef {
                parent: TypeSig::class("Demo.External"),
                name: "Helper".to_string(),
                signature: MethodSig {
                    has_this: false,
                    parameters: vec![],
                    return_type: TypeSig::Void,
                    generic_param_count: 0,
                },
            })
            .unwrap();

        let mut asm = InstructionAssembler::new();
        asm.call(helper).unwrap().ret().unwrap();
        let (code, _) = asm.finish().unwrap();

        for name in ["Run", ".cctor"] {
            module
                .add_method(
                    MethodDef::new(util, name)
                        .with_flags(MethodFlags::STATIC)
                        .with_body(MethodBody::new(code.clone())),
                )
                .unwrap();
        }
        module
            .add_method(MethodDef::new(util, "Pure").with_body(MethodBody::new(vec![0x2A])))
            .unwrap();
        module
            .add_method(MethodDef::new(contract, "Serve").with_flags(MethodFlags::ABSTRACT))
            .unwrap();
        module
    }

    #[test]
    fn selects_eligible_methods_and_marks_them() {
        let mut module = module_with_calls();
        let mut rewriter = CallSiteRewriter::default();
        let report = rewrite_module(&mut module, &mut rewriter, &RewriteOptions::default()).unwrap();

        assert_eq!(
            report,
            RewriteReport {
                visited: 2,
                rewritten: 1,
                skipped: 0,
                sites: 1,
            }
        );
        let run = module.find_method("Demo.Util", "Run").unwrap();
        let pure = module.find_method("Demo.Util", "Pure").unwrap();
        let cctor = module.find_method("Demo.Util", ".cctor").unwrap();
        assert!(module.is_processed(run));
        assert!(module.is_processed(pure));
        assert!(!module.is_processed(cctor));
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let mut module = module_with_calls();
        let options = RewriteOptions::default();
        rewrite_module(&mut module, &mut CallSiteRewriter::default(), &options).unwrap();
        let once = module.clone();

        let report = rewrite_module(&mut module, &mut CallSiteRewriter::default(), &options).unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.rewritten, 0);
        assert_eq!(module, once);
    }

    #[test]
    fn excluded_types_are_ignored() {
        let mut module = module_with_calls();
        let options = RewriteOptions {
            excluded_types: vec!["Demo.".to_string()],
            ..RewriteOptions::default()
        };
        let report = rewrite_module(&mut module, &mut CallSiteRewriter::new(options.clone()), &options)
            .unwrap();
        assert_eq!(report, RewriteReport::default());
        assert_eq!(module.processed().count(), 0);
    }
}
