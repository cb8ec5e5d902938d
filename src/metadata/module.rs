//! In-memory model of a CIL module.
//!
//! A [`Module`] is a set of flat tables addressed by [`Token`]s, close to the layout of
//! ECMA-335 metadata but with names and signatures stored inline:
//!
//! | Table | Entry | Contents |
//! |-------|-------|----------|
//! | TypeDef | [`TypeDef`] | Full name, base type, interfaces, flags |
//! | Field | [`FieldDef`] | Owner, name, type, static flag |
//! | MethodDef | [`MethodDef`] | Owner, name, signature, flags, optional [`MethodBody`] |
//! | MemberRef | [`MemberRef`] | Methods of types the module does not define |
//! | MethodSpec | [`MethodSpec`] | Generic method instantiations |
//! | TypeSpec | [`TypeSig`] | Type operands of `box`, `ldtoken`, `newarr`, ... |
//! | UserString | `String` | `ldstr` literals |
//!
//! Next to the tables the module carries the out-of-band set of methods the rewriter has
//! already processed. It is persisted with the module, so a second rewrite pass over a
//! saved module is a no-op.
//!
//! Tables only grow. `add_member_ref`, `add_method_spec`, `add_type_spec` and
//! `add_user_string` return the token of an identical existing row instead of appending a
//! duplicate, which keeps repeated rewriting deterministic.

use std::{collections::BTreeSet, path::Path};

use bitflags::bitflags;
use uguid::Guid;

use crate::{
    metadata::{
        body::MethodBody,
        method::{MethodDescriptor, MethodFlags, MethodSig},
        token::{TableId, Token},
        typesig::{TypeResolver, TypeSig},
    },
    Result,
};

bitflags! {
    /// Attributes of a type definition.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeFlags: u32 {
        /// Interface type
        const INTERFACE = 0x0020;
        /// Cannot be instantiated
        const ABSTRACT = 0x0080;
        /// Cannot be derived from
        const SEALED = 0x0100;
        /// Value type (derives from `System.ValueType`)
        const VALUE_TYPE = 0x1000;
    }
}

/// Name of the pseudo-type holding module-level members.
pub const MODULE_TYPE_NAME: &str = "<Module>";

/// A type defined by the module.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    /// Full name including namespace, e.g. `Demo.Util`
    pub name: String,
    /// Direct base type, `None` for `System.Object` itself and interfaces
    pub base: Option<TypeSig>,
    /// Directly implemented interfaces
    pub interfaces: Vec<TypeSig>,
    /// Type attributes
    pub flags: TypeFlags,
    /// Number of generic parameters
    pub generic_param_count: u32,
}

impl TypeDef {
    /// A class deriving from `System.Object`.
    #[must_use]
    pub fn class(name: impl Into<String>) -> Self {
        TypeDef {
            name: name.into(),
            base: Some(TypeSig::Object),
            interfaces: Vec::new(),
            flags: TypeFlags::empty(),
            generic_param_count: 0,
        }
    }

    /// An interface.
    #[must_use]
    pub fn interface(name: impl Into<String>) -> Self {
        TypeDef {
            name: name.into(),
            base: None,
            interfaces: Vec::new(),
            flags: TypeFlags::INTERFACE | TypeFlags::ABSTRACT,
            generic_param_count: 0,
        }
    }

    /// Replace the base type.
    #[must_use]
    pub fn extends(mut self, base: TypeSig) -> Self {
        self.base = Some(base);
        self
    }

    /// Add an implemented interface.
    #[must_use]
    pub fn implements(mut self, interface: TypeSig) -> Self {
        self.interfaces.push(interface);
        self
    }

    /// Add attributes.
    #[must_use]
    pub fn with_flags(mut self, flags: TypeFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Whether this is an interface.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.flags.contains(TypeFlags::INTERFACE)
    }

    /// The signature other code uses to refer to this type.
    #[must_use]
    pub fn signature(&self) -> TypeSig {
        if self.flags.contains(TypeFlags::VALUE_TYPE) {
            TypeSig::ValueType(self.name.clone())
        } else {
            TypeSig::from_name(&self.name)
        }
    }
}

/// A field defined by the module.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Declaring type (TypeDef token)
    pub owner: Token,
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: TypeSig,
    /// Whether the field is shared by all instances
    pub is_static: bool,
}

/// A method defined by the module.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    /// Declaring type (TypeDef token)
    pub owner: Token,
    /// Method name
    pub name: String,
    /// Attributes
    pub flags: MethodFlags,
    /// Parameter types, without `this`
    pub parameters: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
    /// Number of generic parameters
    pub generic_param_count: u32,
    /// The body, absent for abstract methods
    pub body: Option<MethodBody>,
}

impl MethodDef {
    /// An instance method without parameters returning `void`.
    #[must_use]
    pub fn new(owner: Token, name: impl Into<String>) -> Self {
        MethodDef {
            owner,
            name: name.into(),
            flags: MethodFlags::empty(),
            parameters: Vec::new(),
            return_type: TypeSig::Void,
            generic_param_count: 0,
            body: None,
        }
    }

    /// Replace the parameter list.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Vec<TypeSig>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Replace the return type.
    #[must_use]
    pub fn returns(mut self, return_type: TypeSig) -> Self {
        self.return_type = return_type;
        self
    }

    /// Add attributes.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Declare generic parameters.
    #[must_use]
    pub fn generic(mut self, count: u32) -> Self {
        self.generic_param_count = count;
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether `this` is passed as argument 0.
    #[must_use]
    pub fn has_this(&self) -> bool {
        !self.flags.contains(MethodFlags::STATIC)
    }

    /// Number of argument slots, `this` included.
    #[must_use]
    pub fn argument_count(&self) -> usize {
        self.parameters.len() + usize::from(self.has_this())
    }
}

/// A method of a type outside the module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Declaring type
    pub parent: TypeSig,
    /// Member name
    pub name: String,
    /// Signature
    pub signature: MethodSig,
}

/// An instantiation of a generic method.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSpec {
    /// The generic method (MethodDef or MemberRef token)
    pub method: Token,
    /// Type arguments
    pub instantiation: Vec<TypeSig>,
}

/// Source of method descriptors for the declarative replacement API.
///
/// [`Module`] lists the methods it defines together with those it references, so rules can
/// be written against external types the module only calls into.
pub trait MethodCatalog {
    /// All known methods declared by the type named `type_name`.
    fn methods_of(&self, type_name: &str) -> Vec<MethodDescriptor>;
}

impl MethodCatalog for [MethodDescriptor] {
    fn methods_of(&self, type_name: &str) -> Vec<MethodDescriptor> {
        self.iter()
            .filter(|method| method.declaring_type.type_name() == type_name)
            .cloned()
            .collect()
    }
}

impl MethodCatalog for Vec<MethodDescriptor> {
    fn methods_of(&self, type_name: &str) -> Vec<MethodDescriptor> {
        self.as_slice().methods_of(type_name)
    }
}

/// A CIL module.
///
/// # Examples
///
/// ```rust
/// use dotshim::{
///     assembly::InstructionAssembler,
///     metadata::{body::MethodBody, method::MethodFlags, module::{MethodDef, TypeDef}},
///     Module,
/// };
///
/// let mut module = Module::new("Demo");
/// let util = module.add_type(TypeDef::class("Demo.Util"));
///
/// let mut asm = InstructionAssembler::new();
/// asm.ldc_i4(42)?.ret()?;
/// let (code, _) = asm.finish()?;
///
/// let answer = module.add_method(
///     MethodDef::new(util, "Answer")
///         .with_flags(MethodFlags::STATIC)
///         .returns(dotshim::metadata::typesig::TypeSig::I4)
///         .with_body(MethodBody::new(code)),
/// )?;
///
/// assert_eq!(module.method_descriptor(answer)?.full_name(), "Demo.Util::Answer");
/// # Ok::<(), dotshim::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Module name
    pub name: String,
    /// Module version id
    pub mvid: Guid,
    pub(crate) types: Vec<TypeDef>,
    pub(crate) fields: Vec<FieldDef>,
    pub(crate) methods: Vec<MethodDef>,
    pub(crate) member_refs: Vec<MemberRef>,
    pub(crate) method_specs: Vec<MethodSpec>,
    pub(crate) type_specs: Vec<TypeSig>,
    pub(crate) user_strings: Vec<String>,
    pub(crate) processed: BTreeSet<Token>,
}

fn next_token(table: TableId, len: usize) -> Result<Token> {
    let row = u32::try_from(len + 1)
        .ok()
        .filter(|row| *row <= 0x00FF_FFFF)
        .ok_or_else(|| malformed_error!("Table {} is full", table))?;
    Ok(Token::from_parts(table, row))
}

fn row<T>(table: &[T], token: Token, id: TableId) -> Result<&T> {
    if !token.is_table(id) {
        return Err(malformed_error!("Token {} is not a {} token", token, id));
    }
    token
        .index()
        .and_then(|index| table.get(index))
        .ok_or_else(|| malformed_error!("Token {} does not resolve to a {} row", token, id))
}

impl Module {
    /// An empty module.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Module {
            name: name.into(),
            mvid: Guid::ZERO,
            types: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            member_refs: Vec::new(),
            method_specs: Vec::new(),
            type_specs: Vec::new(),
            user_strings: Vec::new(),
            processed: BTreeSet::new(),
        }
    }

    /// Load a module container from disk.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] for I/O failures and [`crate::Error::Malformed`],
    /// [`crate::Error::OutOfBounds`] or [`crate::Error::NotSupported`] for damaged input.
    pub fn from_file(path: &Path) -> Result<Module> {
        let file = crate::file::File::from_file(path)?;
        crate::metadata::container::read_module(file.data())
    }

    /// Load a module container from a buffer.
    ///
    /// # Errors
    /// See [`Module::from_file`].
    pub fn from_mem(data: Vec<u8>) -> Result<Module> {
        let file = crate::file::File::from_mem(data)?;
        crate::metadata::container::read_module(file.data())
    }

    /// Serialize the module, symbols included.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] when a value cannot be encoded.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        crate::metadata::container::write_module(self)
    }

    /// Serialize the module to `path`.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] for I/O failures.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let data = self.to_bytes()?;
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Append a type definition.
    pub fn add_type(&mut self, def: TypeDef) -> Token {
        self.types.push(def);
        Token::from_parts(TableId::TypeDef, self.types.len() as u32)
    }

    /// Append a field definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the owner is not a type of this module.
    pub fn add_field(&mut self, def: FieldDef) -> Result<Token> {
        row(&self.types, def.owner, TableId::TypeDef)?;
        let token = next_token(TableId::Field, self.fields.len())?;
        self.fields.push(def);
        Ok(token)
    }

    /// Append a method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the owner is not a type of this module.
    pub fn add_method(&mut self, def: MethodDef) -> Result<Token> {
        row(&self.types, def.owner, TableId::TypeDef)?;
        let token = next_token(TableId::MethodDef, self.methods.len())?;
        self.methods.push(def);
        Ok(token)
    }

    /// Token of a member reference, appending it when new.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] once the table is full.
    pub fn add_member_ref(&mut self, member: MemberRef) -> Result<Token> {
        if let Some(index) = self.member_refs.iter().position(|existing| *existing == member) {
            return next_token(TableId::MemberRef, index);
        }
        let token = next_token(TableId::MemberRef, self.member_refs.len())?;
        self.member_refs.push(member);
        Ok(token)
    }

    /// Token of a method instantiation, appending it when new.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if `spec.method` is not a method token.
    pub fn add_method_spec(&mut self, spec: MethodSpec) -> Result<Token> {
        if !(spec.method.is_table(TableId::MethodDef) || spec.method.is_table(TableId::MemberRef))
        {
            return Err(malformed_error!(
                "MethodSpec must refer to a MethodDef or MemberRef, got {}",
                spec.method
            ));
        }
        if let Some(index) = self.method_specs.iter().position(|existing| *existing == spec) {
            return next_token(TableId::MethodSpec, index);
        }
        let token = next_token(TableId::MethodSpec, self.method_specs.len())?;
        self.method_specs.push(spec);
        Ok(token)
    }

    /// Token of a type specification, appending it when new.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] once the table is full.
    pub fn add_type_spec(&mut self, sig: TypeSig) -> Result<Token> {
        if let Some(index) = self.type_specs.iter().position(|existing| *existing == sig) {
            return next_token(TableId::TypeSpec, index);
        }
        let token = next_token(TableId::TypeSpec, self.type_specs.len())?;
        self.type_specs.push(sig);
        Ok(token)
    }

    /// Token of a user string, appending it when new.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] once the heap is full.
    pub fn add_user_string(&mut self, value: impl Into<String>) -> Result<Token> {
        let value = value.into();
        if let Some(index) = self.user_strings.iter().position(|existing| *existing == value) {
            return next_token(TableId::UserString, index);
        }
        let token = next_token(TableId::UserString, self.user_strings.len())?;
        self.user_strings.push(value);
        Ok(token)
    }

    /// Token usable as the operand of `box`, `unbox.any`, `ldtoken` etc. for `sig`: the
    /// TypeDef when the module defines the type, a TypeSpec otherwise.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] once the TypeSpec table is full.
    pub fn type_token(&mut self, sig: &TypeSig) -> Result<Token> {
        if let TypeSig::Class(name) | TypeSig::ValueType(name) = sig {
            if let Some(token) = self.find_type(name) {
                return Ok(token);
            }
        }
        self.add_type_spec(sig.clone())
    }

    /// All type definitions with their tokens.
    pub fn types(&self) -> impl Iterator<Item = (Token, &TypeDef)> {
        self.types.iter().enumerate().map(|(index, def)| {
            (Token::from_parts(TableId::TypeDef, index as u32 + 1), def)
        })
    }

    /// All method definitions with their tokens.
    pub fn methods(&self) -> impl Iterator<Item = (Token, &MethodDef)> {
        self.methods.iter().enumerate().map(|(index, def)| {
            (Token::from_parts(TableId::MethodDef, index as u32 + 1), def)
        })
    }

    /// All field definitions with their tokens.
    pub fn fields(&self) -> impl Iterator<Item = (Token, &FieldDef)> {
        self.fields.iter().enumerate().map(|(index, def)| {
            (Token::from_parts(TableId::Field, index as u32 + 1), def)
        })
    }

    /// Number of method definitions.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// The user strings, in token order.
    #[must_use]
    pub fn user_strings(&self) -> &[String] {
        &self.user_strings
    }

    /// The member references, in token order.
    #[must_use]
    pub fn member_refs(&self) -> &[MemberRef] {
        &self.member_refs
    }

    /// A type definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn type_def(&self, token: Token) -> Result<&TypeDef> {
        row(&self.types, token, TableId::TypeDef)
    }

    /// A field definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn field(&self, token: Token) -> Result<&FieldDef> {
        row(&self.fields, token, TableId::Field)
    }

    /// A method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn method(&self, token: Token) -> Result<&MethodDef> {
        row(&self.methods, token, TableId::MethodDef)
    }

    /// A mutable method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn method_mut(&mut self, token: Token) -> Result<&mut MethodDef> {
        if !token.is_table(TableId::MethodDef) {
            return Err(malformed_error!("Token {} is not a MethodDef token", token));
        }
        token
            .index()
            .and_then(|index| self.methods.get_mut(index))
            .ok_or_else(|| malformed_error!("Token {} does not resolve to a MethodDef row", token))
    }

    /// A member reference.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn member_ref(&self, token: Token) -> Result<&MemberRef> {
        row(&self.member_refs, token, TableId::MemberRef)
    }

    /// A method instantiation.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn method_spec(&self, token: Token) -> Result<&MethodSpec> {
        row(&self.method_specs, token, TableId::MethodSpec)
    }

    /// A user string.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn user_string(&self, token: Token) -> Result<&str> {
        row(&self.user_strings, token, TableId::UserString).map(String::as_str)
    }

    /// The type a TypeDef or TypeSpec token denotes.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for other tables or dangling tokens.
    pub fn type_sig(&self, token: Token) -> Result<TypeSig> {
        match token.table_id() {
            Some(TableId::TypeDef) => Ok(self.type_def(token)?.signature()),
            Some(TableId::TypeSpec) => {
                row(&self.type_specs, token, TableId::TypeSpec).map(Clone::clone)
            }
            _ => Err(malformed_error!("Token {} does not denote a type", token)),
        }
    }

    /// Token of the type definition named `name`.
    #[must_use]
    pub fn find_type(&self, name: &str) -> Option<Token> {
        self.types()
            .find(|(_, def)| def.name == name)
            .map(|(token, _)| token)
    }

    /// Token of the first method called `name` on the type named `type_name`.
    #[must_use]
    pub fn find_method(&self, type_name: &str, name: &str) -> Option<Token> {
        let owner = self.find_type(type_name)?;
        self.methods()
            .find(|(_, def)| def.owner == owner && def.name == name)
            .map(|(token, _)| token)
    }

    /// Token of the field called `name` declared by `owner`.
    #[must_use]
    pub fn find_field(&self, owner: Token, name: &str) -> Option<Token> {
        self.fields()
            .find(|(_, def)| def.owner == owner && def.name == name)
            .map(|(token, _)| token)
    }

    /// Descriptor of a method definition.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the token does not resolve.
    pub fn method_descriptor(&self, token: Token) -> Result<MethodDescriptor> {
        let def = self.method(token)?;
        let owner = self.type_def(def.owner)?;
        Ok(MethodDescriptor {
            declaring_type: owner.signature(),
            name: def.name.clone(),
            parameters: def.parameters.clone(),
            return_type: def.return_type.clone(),
            generic_param_count: def.generic_param_count,
            type_arguments: Vec::new(),
            flags: def.flags,
        })
    }

    /// Resolve the operand of `call`, `callvirt`, `newobj` or `ldtoken` to a descriptor.
    ///
    /// MethodDef, MemberRef and MethodSpec tokens are accepted; a MethodSpec yields the
    /// instantiated generic method.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for any other token or a dangling reference.
    pub fn resolve_method(&self, token: Token) -> Result<MethodDescriptor> {
        match token.table_id() {
            Some(TableId::MethodDef) => self.method_descriptor(token),
            Some(TableId::MemberRef) => {
                let member = self.member_ref(token)?;
                Ok(member.signature.to_descriptor(&member.parent, &member.name))
            }
            Some(TableId::MethodSpec) => {
                let spec = self.method_spec(token)?;
                if spec.method.is_table(TableId::MethodSpec) {
                    return Err(malformed_error!("MethodSpec {} refers to a MethodSpec", token));
                }
                let generic = self.resolve_method(spec.method)?;
                if generic.generic_param_count as usize != spec.instantiation.len() {
                    return Err(malformed_error!(
                        "MethodSpec {} supplies {} type arguments for {}",
                        token,
                        spec.instantiation.len(),
                        generic
                    ));
                }
                Ok(generic.instantiate(&spec.instantiation))
            }
            _ => Err(malformed_error!(
                "Token {} does not refer to a method",
                token
            )),
        }
    }

    /// Whether the rewriter already processed `method`.
    #[must_use]
    pub fn is_processed(&self, method: Token) -> bool {
        self.processed.contains(&method)
    }

    /// Record that the rewriter processed `method`.
    pub fn mark_processed(&mut self, method: Token) {
        self.processed.insert(method);
    }

    /// The processed methods, in token order.
    pub fn processed(&self) -> impl Iterator<Item = Token> + '_ {
        self.processed.iter().copied()
    }
}

impl TypeResolver for Module {
    fn base_type(&self, ty: &TypeSig) -> Option<TypeSig> {
        let (name, args) = match ty {
            TypeSig::Class(name) | TypeSig::ValueType(name) => (name.as_str(), &[][..]),
            TypeSig::GenericInst(base, args) => match base.as_ref() {
                TypeSig::Class(name) | TypeSig::ValueType(name) => (name.as_str(), args.as_slice()),
                _ => return None,
            },
            _ => return None,
        };
        let token = self.find_type(name)?;
        let def = self.type_def(token).ok()?;
        def.base.as_ref().map(|base| base.instantiate(args, &[]))
    }

    fn interfaces(&self, ty: &TypeSig) -> Vec<TypeSig> {
        let name = ty.type_name();
        self.find_type(&name)
            .and_then(|token| self.type_def(token).ok())
            .map(|def| def.interfaces.clone())
            .unwrap_or_default()
    }
}

impl MethodCatalog for Module {
    fn methods_of(&self, type_name: &str) -> Vec<MethodDescriptor> {
        let mut found: Vec<MethodDescriptor> = Vec::new();

        if let Some(owner) = self.find_type(type_name) {
            for (token, def) in self.methods() {
                if def.owner == owner {
                    if let Ok(descriptor) = self.method_descriptor(token) {
                        found.push(descriptor);
                    }
                }
            }
        }

        for member in &self.member_refs {
            if member.parent.type_name() == type_name {
                let descriptor = member.signature.to_descriptor(&member.parent, &member.name);
                if !found.contains(&descriptor) {
                    found.push(descriptor);
                }
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (Module, Token, Token) {
        let mut module = Module::new("Demo");
        let base = module.add_type(TypeDef::class("Demo.Base"));
        let derived = module.add_type(TypeDef::class("Demo.Derived").extends(TypeSig::class("Demo.Base")));
        let _ = module
            .add_method(MethodDef::new(base, "Run").with_parameters(vec![TypeSig::I4]))
            .unwrap();
        (module, base, derived)
    }

    #[test]
    fn resolves_defs_refs_and_specs() {
        let (mut module, _, _) = sample();

        let run = module.resolve_method(Token::new(0x0600_0001)).unwrap();
        assert_eq!(run.full_name(), "Demo.Base::Run");
        assert!(run.has_this());

        let helper = module
            .add_member_ref(MemberRef {
                parent: TypeSig::class("Demo.Util"),
                name: "Echo".to_string(),
                signature: MethodSig {
                    has_this: false,
                    parameters: vec![TypeSig::MVar(0)],
                    return_type: TypeSig::MVar(0),
                    generic_param_count: 1,
                },
            })
            .unwrap();
        let spec = module
            .add_method_spec(MethodSpec {
                method: helper,
                instantiation: vec![TypeSig::String],
            })
            .unwrap();

        let closed = module.resolve_method(spec).unwrap();
        assert!(closed.is_static());
        assert_eq!(closed.parameters, vec![TypeSig::String]);
        assert_eq!(closed.type_arguments, vec![TypeSig::String]);
    }

    #[test]
    fn rejects_non_method_tokens() {
        let (module, _, _) = sample();
        assert!(module.resolve_method(Token::new(0x0200_0001)).is_err());
        assert!(module.resolve_method(Token::new(0x0600_0009)).is_err());
        assert!(module.resolve_method(Token::new(0x0A00_0001)).is_err());
    }

    #[test]
    fn deduplicates_references() {
        let (mut module, _, _) = sample();
        let first = module.add_user_string("hello").unwrap();
        let second = module.add_user_string("hello").unwrap();
        assert_eq!(first, second);
        assert_eq!(module.user_string(first).unwrap(), "hello");

        let spec = module.add_type_spec(TypeSig::sz_array(TypeSig::Object)).unwrap();
        assert_eq!(module.add_type_spec(TypeSig::sz_array(TypeSig::Object)).unwrap(), spec);
        assert_eq!(module.type_token(&TypeSig::class("Demo.Base")).unwrap(), Token::new(0x0200_0001));
    }

    #[test]
    fn hierarchy_drives_assignability() {
        let (module, _, _) = sample();
        let base = TypeSig::class("Demo.Base");
        let derived = TypeSig::class("Demo.Derived");

        assert!(base.is_assignable_from(&derived, &module));
        assert!(!derived.is_assignable_from(&base, &module));
        assert!(TypeSig::Object.is_assignable_from(&derived, &module));
    }

    #[test]
    fn catalog_lists_defined_and_referenced_methods() {
        let (mut module, _, _) = sample();
        let _ = module
            .add_member_ref(MemberRef {
                parent: TypeSig::class("Demo.Base"),
                name: "Extra".to_string(),
                signature: MethodSig {
                    has_this: true,
                    parameters: Vec::new(),
                    return_type: TypeSig::Void,
                    generic_param_count: 0,
                },
            })
            .unwrap();

        let names: Vec<String> = module
            .methods_of("Demo.Base")
            .into_iter()
            .map(|method| method.name)
            .collect();
        assert_eq!(names, vec!["Run".to_string(), "Extra".to_string()]);
    }

    #[test]
    fn processed_set() {
        let (mut module, _, _) = sample();
        let run = Token::new(0x0600_0001);
        assert!(!module.is_processed(run));
        module.mark_processed(run);
        assert!(module.is_processed(run));
        assert_eq!(module.processed().collect::<Vec<_>>(), vec![run]);
    }
}
