//! Declarative rule registration.
//!
//! [`Replace`] selects the methods to take over and the selector's `with*` methods
//! register the replacement with an [`Interception`] context:
//!
//! ```rust
//! use std::sync::Arc;
//! use dotshim::{
//!     emulation::EmValue,
//!     interception::{FnSubstitute, Interception, Replace},
//!     metadata::{method::{MethodDescriptor, MethodFlags}, typesig::TypeSig},
//! };
//!
//! let catalog = vec![
//!     MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
//!         .with_parameters(vec![TypeSig::String])
//!         .with_flags(MethodFlags::STATIC),
//! ];
//! let interception = Interception::new();
//!
//! Replace::method(&catalog, "Demo.Util", "Helper", &[TypeSig::String])?
//!     .with(&interception, |_text: String| {})?;
//!
//! Replace::methods(|method| method.name.starts_with("Log"))
//!     .with(&interception, Arc::new(FnSubstitute::new(|_| Ok(EmValue::Void))))?;
//!
//! assert_eq!(interception.binders().len()?, 2);
//! # Ok::<(), dotshim::Error>(())
//! ```

use std::sync::Arc;

use crate::{
    interception::{
        CallTarget, Delegate, Interception, IntoDelegate, MatchQuery, MethodFilter,
        SignatureMatcher, Substitute,
    },
    metadata::{
        method::MethodDescriptor,
        module::MethodCatalog,
        typesig::{NoResolver, TypeSig},
    },
    Error, Result,
};

/// Entry point of the selector API.
#[derive(Debug, Clone, Copy)]
pub struct Replace;

impl Replace {
    /// The method `type_name::name` with exactly `parameters`.
    ///
    /// # Errors
    /// Returns [`Error::MemberNotFound`] when the catalog has no such method.
    pub fn method<C>(
        catalog: &C,
        type_name: &str,
        name: &str,
        parameters: &[TypeSig],
    ) -> Result<MethodSelector>
    where
        C: MethodCatalog + ?Sized,
    {
        catalog
            .methods_of(type_name)
            .into_iter()
            .find(|method| method.name == name && method.parameters == parameters)
            .map(MethodSelector::new)
            .ok_or_else(|| {
                let list: Vec<String> = parameters.iter().map(ToString::to_string).collect();
                Error::MemberNotFound(format!("{}::{}({})", type_name, name, list.join(", ")))
            })
    }

    /// A method known by its descriptor.
    #[must_use]
    pub fn exact(method: MethodDescriptor) -> MethodSelector {
        MethodSelector::new(method)
    }

    /// Every method `filter` accepts.
    pub fn methods<F>(filter: F) -> FilterSelector
    where
        F: Fn(&MethodDescriptor) -> bool + Send + Sync + 'static,
    {
        FilterSelector {
            filter: Arc::new(filter),
        }
    }

    /// Every method declared by `type_name` that `filter` accepts.
    pub fn methods_of<F>(type_name: &str, filter: F) -> FilterSelector
    where
        F: Fn(&MethodDescriptor) -> bool + Send + Sync + 'static,
    {
        let type_name = type_name.to_string();
        FilterSelector {
            filter: Arc::new(move |method: &MethodDescriptor| {
                filter(method) && method.declaring_type.type_name() == type_name
            }),
        }
    }

    /// Constructions of `type_name`.
    ///
    /// # Errors
    /// Returns [`Error::MemberNotFound`] when the catalog lists no constructor.
    pub fn constructor_call_on<C>(catalog: &C, type_name: &str) -> Result<ConstructorSelector>
    where
        C: MethodCatalog + ?Sized,
    {
        let constructors: Vec<MethodDescriptor> = catalog
            .methods_of(type_name)
            .into_iter()
            .filter(MethodDescriptor::is_constructor)
            .collect();
        if constructors.is_empty() {
            return Err(Error::MemberNotFound(format!("{type_name}::.ctor")));
        }
        Ok(ConstructorSelector {
            type_name: type_name.to_string(),
            constructors,
        })
    }

    /// The property `type_name::name`, through its `get_`/`set_` accessors.
    ///
    /// # Errors
    /// Returns [`Error::MemberNotFound`] when neither accessor exists.
    pub fn property<C>(catalog: &C, type_name: &str, name: &str) -> Result<PropertySelector>
    where
        C: MethodCatalog + ?Sized,
    {
        let methods = catalog.methods_of(type_name);
        let getter_name = format!("get_{name}");
        let setter_name = format!("set_{name}");

        let getter = methods
            .iter()
            .find(|method| method.name == getter_name && method.parameters.is_empty())
            .cloned();
        let setter = methods
            .iter()
            .find(|method| method.name == setter_name && method.parameters.len() == 1)
            .cloned();

        if getter.is_none() && setter.is_none() {
            return Err(Error::MemberNotFound(format!("{type_name}::{name}")));
        }
        Ok(PropertySelector {
            name: name.to_string(),
            getter,
            setter,
        })
    }
}

/// One selected method.
#[derive(Debug, Clone)]
pub struct MethodSelector {
    target: MethodDescriptor,
}

impl MethodSelector {
    fn new(target: MethodDescriptor) -> Self {
        MethodSelector { target }
    }

    /// The selected method.
    #[must_use]
    pub fn target(&self) -> &MethodDescriptor {
        &self.target
    }

    /// Replace the method with a closure whose signature must fit it.
    ///
    /// # Errors
    /// Returns [`Error::SignatureMismatch`] when it does not.
    pub fn with<Args>(
        self,
        interception: &Interception,
        implementation: impl IntoDelegate<Args>,
    ) -> Result<()> {
        interception.add_rule(
            CallTarget::Exact(self.target),
            Arc::new(implementation.into_delegate()),
        )
    }

    /// Replace every call to a method declared by a type of the same name with a
    /// compatible signature.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn with_substitute(
        self,
        interception: &Interception,
        substitute: Arc<dyn Substitute>,
    ) -> Result<()> {
        let target = self.target;
        let owner = target.declaring_type.type_name();
        let filter = move |method: &MethodDescriptor| {
            method.declaring_type.type_name() == owner
                && SignatureMatcher::new(&NoResolver).is_compatible(method, &target)
        };
        interception.add_rule(CallTarget::filter(filter), substitute)
    }
}

/// Every method a predicate accepts.
#[derive(Clone)]
pub struct FilterSelector {
    filter: MethodFilter,
}

impl FilterSelector {
    /// Replace the selected methods with `substitute`.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn with(self, interception: &Interception, substitute: Arc<dyn Substitute>) -> Result<()> {
        interception.add_rule(CallTarget::Filter(self.filter), substitute)
    }

    /// Whether `method` is selected.
    #[must_use]
    pub fn selects(&self, method: &MethodDescriptor) -> bool {
        (self.filter)(method)
    }
}

impl std::fmt::Debug for FilterSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FilterSelector")
    }
}

/// The constructors of one type.
#[derive(Debug, Clone)]
pub struct ConstructorSelector {
    type_name: String,
    constructors: Vec<MethodDescriptor>,
}

impl ConstructorSelector {
    /// Replace the constructor that best fits `factory`'s parameters with it.
    ///
    /// # Errors
    /// Returns [`Error::NoCompatibleConstructor`] when no constructor fits.
    pub fn with<Args>(self, interception: &Interception, factory: impl IntoDelegate<Args>) -> Result<()> {
        let factory: Delegate = factory.into_delegate();

        let mut query = MatchQuery::for_method(factory.descriptor()).any_return();
        query.name = None;
        let constructor = SignatureMatcher::new(&NoResolver)
            .best_match(&self.constructors, &query)
            .map(|best| best.candidate.clone())
            .ok_or_else(|| Error::NoCompatibleConstructor(self.type_name.clone()))?;

        interception.add_rule(CallTarget::Exact(constructor), Arc::new(factory))
    }

    /// The candidate constructors.
    #[must_use]
    pub fn constructors(&self) -> &[MethodDescriptor] {
        &self.constructors
    }
}

/// The accessors of one property.
#[derive(Debug, Clone)]
pub struct PropertySelector {
    name: String,
    getter: Option<MethodDescriptor>,
    setter: Option<MethodDescriptor>,
}

impl PropertySelector {
    /// Replace the getter.
    ///
    /// # Errors
    /// Returns [`Error::MissingAccessor`] without a getter, or [`Error::SignatureMismatch`].
    pub fn with_getter<Args>(
        &self,
        interception: &Interception,
        getter: impl IntoDelegate<Args>,
    ) -> Result<()> {
        let target = self.getter.clone().ok_or_else(|| Error::MissingAccessor {
            property: self.name.clone(),
            accessor: "getter",
        })?;
        interception.add_rule(CallTarget::Exact(target), Arc::new(getter.into_delegate()))
    }

    /// Replace the setter.
    ///
    /// # Errors
    /// Returns [`Error::MissingAccessor`] without a setter, or [`Error::SignatureMismatch`].
    pub fn with_setter<Args>(
        &self,
        interception: &Interception,
        setter: impl IntoDelegate<Args>,
    ) -> Result<()> {
        let target = self.setter.clone().ok_or_else(|| Error::MissingAccessor {
            property: self.name.clone(),
            accessor: "setter",
        })?;
        interception.add_rule(CallTarget::Exact(target), Arc::new(setter.into_delegate()))
    }

    /// Replace both accessors.
    ///
    /// # Errors
    /// Fails like [`with_getter`](Self::with_getter) and [`with_setter`](Self::with_setter).
    pub fn with<G, S>(
        &self,
        interception: &Interception,
        getter: impl IntoDelegate<G>,
        setter: impl IntoDelegate<S>,
    ) -> Result<()> {
        self.with_getter(interception, getter)?;
        self.with_setter(interception, setter)
    }
}
