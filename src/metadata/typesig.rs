//! Type signatures and assignability.
//!
//! [`TypeSig`] describes the type of a parameter, return value, local, field or array
//! element. Named types are identified by their full name rather than by a token, which
//! keeps signatures comparable across modules: a descriptor built by test code and one
//! decoded from a rewritten module refer to `Demo.Util` the same way.
//!
//! Assignability ([`TypeSig::is_assignable_from`]) follows the CLI rules closely enough for
//! signature matching: identity, `System.Object` accepts everything, reference types accept
//! their subclasses and implementers as reported by a [`TypeResolver`], and generic
//! parameters act as wildcards.
//!
//! # Binary Encoding
//!
//! Signatures are serialized with ECMA-335 element type bytes, with class and value type
//! names inlined as length-prefixed UTF-8 strings instead of coded tokens.

use std::fmt;

use crate::{file::writer::Writer, Parser, Result};

const ELEMENT_TYPE_VOID: u8 = 0x01;
const ELEMENT_TYPE_BOOLEAN: u8 = 0x02;
const ELEMENT_TYPE_CHAR: u8 = 0x03;
const ELEMENT_TYPE_I4: u8 = 0x08;
const ELEMENT_TYPE_I8: u8 = 0x0A;
const ELEMENT_TYPE_R8: u8 = 0x0D;
const ELEMENT_TYPE_STRING: u8 = 0x0E;
const ELEMENT_TYPE_BYREF: u8 = 0x10;
const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
const ELEMENT_TYPE_CLASS: u8 = 0x12;
const ELEMENT_TYPE_VAR: u8 = 0x13;
const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
const ELEMENT_TYPE_OBJECT: u8 = 0x1C;
const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
const ELEMENT_TYPE_MVAR: u8 = 0x1E;

/// Maximum nesting accepted while decoding a signature.
const MAX_NESTING: usize = 32;

/// Hierarchy depth after which an ancestor walk gives up.
const MAX_HIERARCHY_DEPTH: usize = 64;

/// A type as it appears in a method, field or local signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeSig {
    /// `System.Void`, only valid as a return type
    Void,
    /// `System.Boolean`
    Boolean,
    /// `System.Char`
    Char,
    /// `System.Int32`
    I4,
    /// `System.Int64`
    I8,
    /// `System.Double`
    R8,
    /// `System.String`
    String,
    /// `System.Object`
    Object,
    /// A reference type, by full name
    Class(String),
    /// A user-defined value type, by full name
    ValueType(String),
    /// An instantiated generic type
    GenericInst(Box<TypeSig>, Vec<TypeSig>),
    /// Generic parameter of the declaring type (`!n`)
    Var(u32),
    /// Generic parameter of the method (`!!n`)
    MVar(u32),
    /// Managed reference, used for `ref`/`out` parameters
    ByRef(Box<TypeSig>),
    /// Single-dimensional, zero-based array
    SzArray(Box<TypeSig>),
}

/// Source of class hierarchy information used by [`TypeSig::is_assignable_from`].
///
/// [`crate::Module`] implements this for the types it defines. Types the resolver knows
/// nothing about are treated as having no base type beyond `System.Object`.
pub trait TypeResolver {
    /// The direct base type of `ty`, if known.
    fn base_type(&self, ty: &TypeSig) -> Option<TypeSig>;

    /// The interfaces `ty` declares directly.
    fn interfaces(&self, ty: &TypeSig) -> Vec<TypeSig>;
}

/// A resolver with no hierarchy knowledge.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl TypeResolver for NoResolver {
    fn base_type(&self, _ty: &TypeSig) -> Option<TypeSig> {
        None
    }

    fn interfaces(&self, _ty: &TypeSig) -> Vec<TypeSig> {
        Vec::new()
    }
}

impl TypeSig {
    /// A reference type by full name.
    #[must_use]
    pub fn class(name: impl Into<String>) -> Self {
        TypeSig::Class(name.into())
    }

    /// A value type by full name.
    #[must_use]
    pub fn value_type(name: impl Into<String>) -> Self {
        TypeSig::ValueType(name.into())
    }

    /// A generic instantiation of `base`.
    #[must_use]
    pub fn generic_inst(base: TypeSig, args: Vec<TypeSig>) -> Self {
        TypeSig::GenericInst(Box::new(base), args)
    }

    /// A managed reference to `inner`.
    #[must_use]
    pub fn by_ref(inner: TypeSig) -> Self {
        TypeSig::ByRef(Box::new(inner))
    }

    /// A single-dimensional array of `element`.
    #[must_use]
    pub fn sz_array(element: TypeSig) -> Self {
        TypeSig::SzArray(Box::new(element))
    }

    /// Map a well-known full name onto its primitive signature; anything else becomes a
    /// [`TypeSig::Class`].
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "System.Void" => TypeSig::Void,
            "System.Boolean" => TypeSig::Boolean,
            "System.Char" => TypeSig::Char,
            "System.Int32" => TypeSig::I4,
            "System.Int64" => TypeSig::I8,
            "System.Double" => TypeSig::R8,
            "System.String" => TypeSig::String,
            "System.Object" => TypeSig::Object,
            other => TypeSig::Class(other.to_string()),
        }
    }

    /// Name of the type definition behind this signature, without generic arguments.
    ///
    /// ```rust
    /// use dotshim::metadata::typesig::TypeSig;
    ///
    /// let list = TypeSig::generic_inst(TypeSig::class("Demo.Box`1"), vec![TypeSig::I4]);
    /// assert_eq!(list.type_name(), "Demo.Box`1");
    /// assert_eq!(TypeSig::I4.type_name(), "System.Int32");
    /// ```
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            TypeSig::Void => "System.Void".to_string(),
            TypeSig::Boolean => "System.Boolean".to_string(),
            TypeSig::Char => "System.Char".to_string(),
            TypeSig::I4 => "System.Int32".to_string(),
            TypeSig::I8 => "System.Int64".to_string(),
            TypeSig::R8 => "System.Double".to_string(),
            TypeSig::String => "System.String".to_string(),
            TypeSig::Object => "System.Object".to_string(),
            TypeSig::Class(name) | TypeSig::ValueType(name) => name.clone(),
            TypeSig::GenericInst(base, _) => base.type_name(),
            TypeSig::Var(_) | TypeSig::MVar(_) | TypeSig::ByRef(_) | TypeSig::SzArray(_) => {
                self.to_string()
            }
        }
    }

    /// Whether values of this type live inline and need boxing to become objects.
    #[must_use]
    pub fn is_value_type(&self) -> bool {
        match self {
            TypeSig::Boolean
            | TypeSig::Char
            | TypeSig::I4
            | TypeSig::I8
            | TypeSig::R8
            | TypeSig::ValueType(_) => true,
            TypeSig::GenericInst(base, _) => base.is_value_type(),
            _ => false,
        }
    }

    /// Whether this is a generic parameter of a type or method.
    #[must_use]
    pub fn is_generic_parameter(&self) -> bool {
        matches!(self, TypeSig::Var(_) | TypeSig::MVar(_))
    }

    /// Whether this is a managed reference.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        matches!(self, TypeSig::ByRef(_))
    }

    /// Whether a value of this type has to be boxed before it can be stored as an object.
    #[must_use]
    pub fn needs_boxing(&self) -> bool {
        self.is_value_type() || self.is_generic_parameter()
    }

    /// Whether any generic parameter appears anywhere inside this signature.
    #[must_use]
    pub fn contains_generic_parameters(&self) -> bool {
        match self {
            TypeSig::Var(_) | TypeSig::MVar(_) => true,
            TypeSig::GenericInst(base, args) => {
                base.contains_generic_parameters()
                    || args.iter().any(TypeSig::contains_generic_parameters)
            }
            TypeSig::ByRef(inner) | TypeSig::SzArray(inner) => inner.contains_generic_parameters(),
            _ => false,
        }
    }

    /// Replace `!n` with `type_args[n]` and `!!n` with `method_args[n]`.
    ///
    /// Parameters without a corresponding argument are left in place.
    ///
    /// ```rust
    /// use dotshim::metadata::typesig::TypeSig;
    ///
    /// let open = TypeSig::sz_array(TypeSig::MVar(0));
    /// assert_eq!(
    ///     open.instantiate(&[], &[TypeSig::I4]),
    ///     TypeSig::sz_array(TypeSig::I4)
    /// );
    /// ```
    #[must_use]
    pub fn instantiate(&self, type_args: &[TypeSig], method_args: &[TypeSig]) -> TypeSig {
        match self {
            TypeSig::Var(index) => type_args
                .get(*index as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            TypeSig::MVar(index) => method_args
                .get(*index as usize)
                .cloned()
                .unwrap_or_else(|| self.clone()),
            TypeSig::GenericInst(base, args) => TypeSig::GenericInst(
                Box::new(base.instantiate(type_args, method_args)),
                args.iter()
                    .map(|arg| arg.instantiate(type_args, method_args))
                    .collect(),
            ),
            TypeSig::ByRef(inner) => {
                TypeSig::ByRef(Box::new(inner.instantiate(type_args, method_args)))
            }
            TypeSig::SzArray(inner) => {
                TypeSig::SzArray(Box::new(inner.instantiate(type_args, method_args)))
            }
            _ => self.clone(),
        }
    }

    /// Whether a value of type `source` can be stored in a location of type `self`.
    ///
    /// Generic parameters on either side match any non-void, non-reference type, which is
    /// what lets an open generic signature line up with its closed instantiations.
    ///
    /// ```rust
    /// use dotshim::metadata::typesig::{NoResolver, TypeSig};
    ///
    /// assert!(TypeSig::Object.is_assignable_from(&TypeSig::String, &NoResolver));
    /// assert!(TypeSig::Object.is_assignable_from(&TypeSig::I4, &NoResolver));
    /// assert!(!TypeSig::String.is_assignable_from(&TypeSig::Object, &NoResolver));
    /// assert!(TypeSig::MVar(0).is_assignable_from(&TypeSig::I4, &NoResolver));
    /// ```
    pub fn is_assignable_from(&self, source: &TypeSig, resolver: &dyn TypeResolver) -> bool {
        if self == source {
            return true;
        }

        match self {
            TypeSig::Void => false,
            TypeSig::Var(_) | TypeSig::MVar(_) => !matches!(source, TypeSig::Void | TypeSig::ByRef(_)),
            TypeSig::Object => !matches!(source, TypeSig::Void | TypeSig::ByRef(_)),
            TypeSig::ByRef(inner) => match source {
                TypeSig::ByRef(other) => {
                    inner.is_generic_parameter() || other.is_generic_parameter() || inner == other
                }
                _ => false,
            },
            TypeSig::SzArray(element) => match source {
                TypeSig::SzArray(other) => {
                    !element.is_value_type()
                        && !other.is_value_type()
                        && element.is_assignable_from(other, resolver)
                }
                TypeSig::Var(_) | TypeSig::MVar(_) => true,
                _ => false,
            },
            _ => {
                if source.is_generic_parameter() {
                    return true;
                }
                if self.is_value_type() || source.is_value_type() {
                    return false;
                }
                Self::ancestors(source, resolver).iter().any(|ancestor| ancestor == self)
            }
        }
    }

    /// All base types and implemented interfaces of `ty`, nearest first.
    fn ancestors(ty: &TypeSig, resolver: &dyn TypeResolver) -> Vec<TypeSig> {
        let mut found: Vec<TypeSig> = Vec::new();
        let mut pending = vec![ty.clone()];

        while let Some(current) = pending.pop() {
            if found.len() > MAX_HIERARCHY_DEPTH {
                break;
            }

            let base = match &current {
                TypeSig::String | TypeSig::SzArray(_) => Some(TypeSig::Object),
                _ => resolver.base_type(&current),
            };

            for next in base.into_iter().chain(resolver.interfaces(&current)) {
                if !found.contains(&next) {
                    found.push(next.clone());
                    pending.push(next);
                }
            }
        }

        found
    }

    /// Serialize this signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if a name or argument list is too long to encode.
    pub fn encode(&self, writer: &mut Writer) -> Result<()> {
        match self {
            TypeSig::Void => writer.write_le::<u8>(ELEMENT_TYPE_VOID),
            TypeSig::Boolean => writer.write_le::<u8>(ELEMENT_TYPE_BOOLEAN),
            TypeSig::Char => writer.write_le::<u8>(ELEMENT_TYPE_CHAR),
            TypeSig::I4 => writer.write_le::<u8>(ELEMENT_TYPE_I4),
            TypeSig::I8 => writer.write_le::<u8>(ELEMENT_TYPE_I8),
            TypeSig::R8 => writer.write_le::<u8>(ELEMENT_TYPE_R8),
            TypeSig::String => writer.write_le::<u8>(ELEMENT_TYPE_STRING),
            TypeSig::Object => writer.write_le::<u8>(ELEMENT_TYPE_OBJECT),
            TypeSig::Class(name) => {
                writer.write_le::<u8>(ELEMENT_TYPE_CLASS);
                writer.write_prefixed_string_utf8(name)?;
            }
            TypeSig::ValueType(name) => {
                writer.write_le::<u8>(ELEMENT_TYPE_VALUETYPE);
                writer.write_prefixed_string_utf8(name)?;
            }
            TypeSig::GenericInst(base, args) => {
                writer.write_le::<u8>(ELEMENT_TYPE_GENERICINST);
                base.encode(writer)?;
                writer.write_length(args.len())?;
                for arg in args {
                    arg.encode(writer)?;
                }
            }
            TypeSig::Var(index) => {
                writer.write_le::<u8>(ELEMENT_TYPE_VAR);
                writer.write_compressed_uint(*index)?;
            }
            TypeSig::MVar(index) => {
                writer.write_le::<u8>(ELEMENT_TYPE_MVAR);
                writer.write_compressed_uint(*index)?;
            }
            TypeSig::ByRef(inner) => {
                writer.write_le::<u8>(ELEMENT_TYPE_BYREF);
                inner.encode(writer)?;
            }
            TypeSig::SzArray(inner) => {
                writer.write_le::<u8>(ELEMENT_TYPE_SZARRAY);
                inner.encode(writer)?;
            }
        }
        Ok(())
    }

    /// Deserialize a signature.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown element types or excessive nesting,
    /// and [`crate::Error::OutOfBounds`] for truncated input.
    pub fn decode(parser: &mut Parser) -> Result<TypeSig> {
        Self::decode_nested(parser, 0)
    }

    fn decode_nested(parser: &mut Parser, depth: usize) -> Result<TypeSig> {
        if depth > MAX_NESTING {
            return Err(malformed_error!(
                "Type signature nesting exceeds {}",
                MAX_NESTING
            ));
        }

        let element = parser.read_le::<u8>()?;
        let sig = match element {
            ELEMENT_TYPE_VOID => TypeSig::Void,
            ELEMENT_TYPE_BOOLEAN => TypeSig::Boolean,
            ELEMENT_TYPE_CHAR => TypeSig::Char,
            ELEMENT_TYPE_I4 => TypeSig::I4,
            ELEMENT_TYPE_I8 => TypeSig::I8,
            ELEMENT_TYPE_R8 => TypeSig::R8,
            ELEMENT_TYPE_STRING => TypeSig::String,
            ELEMENT_TYPE_OBJECT => TypeSig::Object,
            ELEMENT_TYPE_CLASS => TypeSig::Class(parser.read_prefixed_string_utf8()?),
            ELEMENT_TYPE_VALUETYPE => TypeSig::ValueType(parser.read_prefixed_string_utf8()?),
            ELEMENT_TYPE_GENERICINST => {
                let base = Self::decode_nested(parser, depth + 1)?;
                let count = parser.read_length()?;
                let mut args = Vec::with_capacity(count);
                for _ in 0..count {
                    args.push(Self::decode_nested(parser, depth + 1)?);
                }
                TypeSig::GenericInst(Box::new(base), args)
            }
            ELEMENT_TYPE_VAR => TypeSig::Var(parser.read_compressed_uint()?),
            ELEMENT_TYPE_MVAR => TypeSig::MVar(parser.read_compressed_uint()?),
            ELEMENT_TYPE_BYREF => TypeSig::ByRef(Box::new(Self::decode_nested(parser, depth + 1)?)),
            ELEMENT_TYPE_SZARRAY => {
                TypeSig::SzArray(Box::new(Self::decode_nested(parser, depth + 1)?))
            }
            other => {
                return Err(malformed_error!(
                    "Unknown element type 0x{:02x} at offset {}",
                    other,
                    parser.pos() - 1
                ))
            }
        };

        Ok(sig)
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::GenericInst(base, args) => {
                write!(f, "{base}<")?;
                for (index, arg) in args.iter().enumerate() {
                    if index > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ">")
            }
            TypeSig::Var(index) => write!(f, "!{index}"),
            TypeSig::MVar(index) => write!(f, "!!{index}"),
            TypeSig::ByRef(inner) => write!(f, "{inner}&"),
            TypeSig::SzArray(inner) => write!(f, "{inner}[]"),
            other => write!(f, "{}", other.type_name()),
        }
    }
}
