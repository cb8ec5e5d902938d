//! Structural method descriptors.
//!
//! A [`MethodDescriptor`] names a callable unit by its shape: declaring type, name,
//! parameter types, return type, generic arity and a handful of flags. Descriptors carry no
//! identity; two descriptors are equal when every field is equal, and the fuzzy comparison
//! used for interception lives in [`crate::interception::matcher`].

use std::fmt;

use bitflags::bitflags;

use crate::metadata::typesig::TypeSig;

bitflags! {
    /// Attributes of a method that matter for rewriting and dispatch.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct MethodFlags: u16 {
        /// No implicit `this` argument
        const STATIC = 0x0001;
        /// Dispatched through the receiver's runtime type
        const VIRTUAL = 0x0002;
        /// Declared without a body
        const ABSTRACT = 0x0004;
        /// Name has special meaning (accessors, constructors)
        const SPECIAL_NAME = 0x0008;
        /// Instance constructor (`.ctor`)
        const CONSTRUCTOR = 0x0010;
        /// Static initializer (`.cctor`)
        const TYPE_INITIALIZER = 0x0020;
    }
}

impl Default for MethodFlags {
    fn default() -> Self {
        MethodFlags::empty()
    }
}

/// Name of instance constructors.
pub const CONSTRUCTOR_NAME: &str = ".ctor";
/// Name of static initializers.
pub const TYPE_INITIALIZER_NAME: &str = ".cctor";

/// Identifies a callable unit structurally.
///
/// # Examples
///
/// ```rust
/// use dotshim::metadata::{method::{MethodDescriptor, MethodFlags}, typesig::TypeSig};
///
/// let helper = MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
///     .with_parameters(vec![TypeSig::String])
///     .with_flags(MethodFlags::STATIC);
///
/// assert!(helper.is_static());
/// assert_eq!(helper.to_string(), "System.Void Demo.Util::Helper(System.String)");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodDescriptor {
    /// The type that declares the method
    pub declaring_type: TypeSig,
    /// Simple name, `.ctor` for constructors
    pub name: String,
    /// Parameter types in declaration order, without `this`
    pub parameters: Vec<TypeSig>,
    /// Return type, `Void` for constructors
    pub return_type: TypeSig,
    /// Number of generic parameters the method declares
    pub generic_param_count: u32,
    /// Type arguments; non-empty only for an instantiated generic method
    pub type_arguments: Vec<TypeSig>,
    /// Static/constructor/virtual flags
    pub flags: MethodFlags,
}

impl MethodDescriptor {
    /// A non-generic instance method returning `void` with no parameters; refine with the
    /// `with_*` builders.
    #[must_use]
    pub fn new(declaring_type: TypeSig, name: impl Into<String>) -> Self {
        MethodDescriptor {
            declaring_type,
            name: name.into(),
            parameters: Vec::new(),
            return_type: TypeSig::Void,
            generic_param_count: 0,
            type_arguments: Vec::new(),
            flags: MethodFlags::empty(),
        }
    }

    /// An instance constructor of `declaring_type`.
    #[must_use]
    pub fn constructor(declaring_type: TypeSig, parameters: Vec<TypeSig>) -> Self {
        MethodDescriptor::new(declaring_type, CONSTRUCTOR_NAME)
            .with_parameters(parameters)
            .with_flags(MethodFlags::CONSTRUCTOR | MethodFlags::SPECIAL_NAME)
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

    /// Add flags.
    #[must_use]
    pub fn with_flags(mut self, flags: MethodFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Declare `count` generic parameters.
    #[must_use]
    pub fn generic(mut self, count: u32) -> Self {
        self.generic_param_count = count;
        self
    }

    /// Close a generic method definition over `type_arguments`, substituting `!!n` in the
    /// parameter and return types.
    ///
    /// ```rust
    /// use dotshim::metadata::{method::MethodDescriptor, typesig::TypeSig};
    ///
    /// let echo = MethodDescriptor::new(TypeSig::class("Demo.Util"), "Echo")
    ///     .generic(1)
    ///     .with_parameters(vec![TypeSig::MVar(0)])
    ///     .returns(TypeSig::MVar(0));
    ///
    /// let closed = echo.instantiate(&[TypeSig::I4]);
    /// assert_eq!(closed.parameters, vec![TypeSig::I4]);
    /// assert_eq!(closed.return_type, TypeSig::I4);
    /// assert_eq!(closed.type_arguments, vec![TypeSig::I4]);
    /// ```
    #[must_use]
    pub fn instantiate(&self, type_arguments: &[TypeSig]) -> Self {
        let mut closed = self.clone();
        closed.parameters = self
            .parameters
            .iter()
            .map(|param| param.instantiate(&[], type_arguments))
            .collect();
        closed.return_type = self.return_type.instantiate(&[], type_arguments);
        closed.type_arguments = type_arguments.to_vec();
        closed
    }

    /// Substitute the declaring type's generic arguments (`!n`) throughout the signature.
    #[must_use]
    pub fn with_declaring_type_arguments(mut self) -> Self {
        if let TypeSig::GenericInst(_, args) = &self.declaring_type {
            let args = args.clone();
            self.parameters = self
                .parameters
                .iter()
                .map(|param| param.instantiate(&args, &[]))
                .collect();
            self.return_type = self.return_type.instantiate(&args, &[]);
        }
        self
    }

    /// Whether the method has no `this` argument.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    /// Whether the method receives `this`.
    #[must_use]
    pub fn has_this(&self) -> bool {
        !self.is_static()
    }

    /// Whether this is an instance constructor.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.flags.contains(MethodFlags::CONSTRUCTOR) || self.name == CONSTRUCTOR_NAME
    }

    /// Whether this is a static initializer.
    #[must_use]
    pub fn is_type_initializer(&self) -> bool {
        self.flags.contains(MethodFlags::TYPE_INITIALIZER) || self.name == TYPE_INITIALIZER_NAME
    }

    /// Whether this is a generic method definition that has not been instantiated.
    #[must_use]
    pub fn is_generic_definition(&self) -> bool {
        self.generic_param_count > 0 && self.type_arguments.is_empty()
    }

    /// The type a caller receives: the declaring type for constructors, the return type
    /// otherwise.
    #[must_use]
    pub fn effective_return_type(&self) -> TypeSig {
        if self.is_constructor() {
            self.declaring_type.clone()
        } else {
            self.return_type.clone()
        }
    }

    /// Number of values `call`/`callvirt` consume from the evaluation stack, `this`
    /// included. `newobj` consumes only the parameters.
    #[must_use]
    pub fn stack_arguments(&self) -> usize {
        self.parameters.len() + usize::from(self.has_this())
    }

    /// `Type::Name`, used in diagnostics.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }

    /// The exact-match key: declaring type definition name, member name and arity.
    #[must_use]
    pub fn lookup_key(&self) -> (String, String, usize) {
        (
            self.declaring_type.type_name(),
            self.name.clone(),
            self.parameters.len(),
        )
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}::{}",
            self.return_type, self.declaring_type, self.name
        )?;

        if !self.type_arguments.is_empty() {
            write!(f, "<")?;
            for (index, arg) in self.type_arguments.iter().enumerate() {
                if index > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{arg}")?;
            }
            write!(f, ">")?;
        } else if self.generic_param_count > 0 {
            write!(f, "`{}", self.generic_param_count)?;
        }

        write!(f, "(")?;
        for (index, param) in self.parameters.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{param}")?;
        }
        write!(f, ")")
    }
}

/// A method signature as stored in a member reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSig {
    /// Whether the method takes `this`
    pub has_this: bool,
    /// Parameter types in declaration order
    pub parameters: Vec<TypeSig>,
    /// Return type
    pub return_type: TypeSig,
    /// Number of generic parameters
    pub generic_param_count: u32,
}

impl MethodSig {
    /// Build the descriptor this signature describes when declared by `parent` as `name`.
    #[must_use]
    pub fn to_descriptor(&self, parent: &TypeSig, name: &str) -> MethodDescriptor {
        let mut flags = MethodFlags::empty();
        if !self.has_this {
            flags |= MethodFlags::STATIC;
        }
        if name == CONSTRUCTOR_NAME {
            flags |= MethodFlags::CONSTRUCTOR | MethodFlags::SPECIAL_NAME;
        } else if name == TYPE_INITIALIZER_NAME {
            flags |= MethodFlags::TYPE_INITIALIZER | MethodFlags::SPECIAL_NAME;
        }

        MethodDescriptor {
            declaring_type: parent.clone(),
            name: name.to_string(),
            parameters: self.parameters.clone(),
            return_type: self.return_type.clone(),
            generic_param_count: self.generic_param_count,
            type_arguments: Vec::new(),
            flags,
        }
        .with_declaring_type_arguments()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_shape() {
        let ctor = MethodDescriptor::constructor(TypeSig::class("Demo.C"), vec![TypeSig::I4]);
        assert!(ctor.is_constructor());
        assert!(ctor.has_this());
        assert_eq!(ctor.effective_return_type(), TypeSig::class("Demo.C"));
        assert_eq!(ctor.stack_arguments(), 2);
    }

    #[test]
    fn instance_call_counts_receiver() {
        let method = MethodDescriptor::new(TypeSig::class("Demo.C"), "Run")
            .with_parameters(vec![TypeSig::I4, TypeSig::String]);
        assert_eq!(method.stack_arguments(), 3);
        assert_eq!(
            method.lookup_key(),
            ("Demo.C".to_string(), "Run".to_string(), 2)
        );
    }

    #[test]
    fn generic_display() {
        let echo = MethodDescriptor::new(TypeSig::class("Demo.Util"), "Echo")
            .generic(1)
            .with_parameters(vec![TypeSig::MVar(0)])
            .returns(TypeSig::MVar(0))
            .with_flags(MethodFlags::STATIC);

        assert!(echo.is_generic_definition());
        assert_eq!(echo.to_string(), "!!0 Demo.Util::Echo`1(!!0)");

        let closed = echo.instantiate(&[TypeSig::String]);
        assert!(!closed.is_generic_definition());
        assert_eq!(
            closed.to_string(),
            "System.String Demo.Util::Echo<System.String>(System.String)"
        );
    }

    #[test]
    fn member_signature_substitutes_parent_arguments() {
        let parent = TypeSig::generic_inst(TypeSig::class("Demo.Box`1"), vec![TypeSig::I4]);
        let sig = MethodSig {
            has_this: true,
            parameters: vec![TypeSig::Var(0)],
            return_type: TypeSig::Var(0),
            generic_param_count: 0,
        };

        let descriptor = sig.to_descriptor(&parent, "Swap");
        assert_eq!(descriptor.parameters, vec![TypeSig::I4]);
        assert_eq!(descriptor.return_type, TypeSig::I4);
        assert_eq!(descriptor.lookup_key().0, "Demo.Box`1");
    }

    #[test]
    fn member_signature_flags() {
        let sig = MethodSig {
            has_this: false,
            parameters: vec![],
            return_type: TypeSig::Void,
            generic_param_count: 0,
        };
        let cctor = sig.to_descriptor(&TypeSig::class("Demo.C"), ".cctor");
        assert!(cctor.is_static());
        assert!(cctor.is_type_initializer());
    }
}
