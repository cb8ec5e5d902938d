//! Name-keyed substitute collections.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use rustc_hash::FxHashMap;

use crate::{
    interception::{
        CallMap, CallProvider, Delegate, IntoDelegate, MatchQuery, PopulateRequest,
        SignatureMatcher,
    },
    metadata::{method::MethodDescriptor, typesig::TypeSig},
    Error, Result,
};

/// A provider that maps calls onto delegates by method name.
///
/// Each called method is compared against the delegates registered under its name; the
/// delegate whose signature fits best replaces it. Instance delegates only replace instance
/// methods, static delegates only static ones, and constructor delegates replace
/// constructions of any type whose constructor they fit.
///
/// ```rust
/// use dotshim::interception::MethodBag;
///
/// let mut bag = MethodBag::new();
/// bag.add_static_method("Now", || 42i64);
/// bag.add_method("Send", |_message: String| true);
/// assert_eq!(bag.len(), 2);
/// ```
#[derive(Clone, Default)]
pub struct MethodBag {
    instance_methods: FxHashMap<String, Vec<Delegate>>,
    static_methods: FxHashMap<String, Vec<Delegate>>,
    constructors: Vec<Delegate>,
}

impl MethodBag {
    /// An empty bag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace instance methods called `name` with `implementation`.
    pub fn add_method<Args>(&mut self, name: &str, implementation: impl IntoDelegate<Args>) {
        self.instance_methods
            .entry(name.to_string())
            .or_default()
            .push(implementation.into_delegate());
    }

    /// Replace static methods called `name` with `implementation`.
    pub fn add_static_method<Args>(&mut self, name: &str, implementation: impl IntoDelegate<Args>) {
        self.static_methods
            .entry(name.to_string())
            .or_default()
            .push(implementation.into_delegate());
    }

    /// Replace constructions with `factory`, which receives the constructor arguments.
    pub fn add_constructor<Args>(&mut self, factory: impl IntoDelegate<Args>) {
        self.constructors.push(factory.into_delegate());
    }

    /// Number of registered delegates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instance_methods.values().map(Vec::len).sum::<usize>()
            + self.static_methods.values().map(Vec::len).sum::<usize>()
            + self.constructors.len()
    }

    /// Whether the bag holds no delegates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entry for every method in `called` that one of the delegates fits.
    fn map_calls(&self, called: &[&MethodDescriptor], map: &mut CallMap) {
        let mut bound: Vec<(MethodDescriptor, Delegate)> = Vec::new();
        {
            let matcher = SignatureMatcher::new(map.resolver());
            for method in called {
                let candidates = if method.is_constructor() {
                    Some(&self.constructors)
                } else if method.is_static() {
                    self.static_methods.get(&method.name)
                } else {
                    self.instance_methods.get(&method.name)
                };
                let Some(candidates) = candidates else {
                    continue;
                };

                let mut query = MatchQuery::for_method(method);
                query.name = None;
                if let Some(best) = matcher.best_match(candidates, &query) {
                    bound.push(((*method).clone(), best.candidate.clone()));
                }
            }
        }

        for (method, delegate) in bound {
            map.add_exact(method, Arc::new(delegate));
        }
    }
}

impl CallProvider for MethodBag {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        let called: Vec<&MethodDescriptor> = request.intercepted.iter().collect();
        self.map_calls(&called, map);
        Ok(())
    }
}

impl fmt::Debug for MethodBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut instance: Vec<&String> = self.instance_methods.keys().collect();
        let mut statics: Vec<&String> = self.static_methods.keys().collect();
        instance.sort();
        statics.sort();
        f.debug_struct("MethodBag")
            .field("instance_methods", &instance)
            .field("static_methods", &statics)
            .field("constructors", &self.constructors.len())
            .finish()
    }
}

/// A [`MethodBag`] that insists every external call is mocked.
///
/// Calls into the type under test and into `System.Object` are left alone. Any other call
/// the host makes that ends up without a substitute fails the population of the host's
/// call map with [`Error::MissingMock`].
///
/// ```rust
/// use dotshim::{interception::ExternalCallMocker, metadata::typesig::TypeSig};
///
/// let mut mocker = ExternalCallMocker::new(TypeSig::class("Demo.Service"));
/// mocker.add_static_method("ReadSetting", |_key: String| "on".to_string());
/// assert_eq!(mocker.len(), 1);
/// ```
#[derive(Clone, Debug)]
pub struct ExternalCallMocker {
    type_under_test: TypeSig,
    bag: MethodBag,
}

impl ExternalCallMocker {
    /// A strict mocker for code in `type_under_test`.
    #[must_use]
    pub fn new(type_under_test: TypeSig) -> Self {
        ExternalCallMocker {
            type_under_test,
            bag: MethodBag::new(),
        }
    }

    /// The type whose own methods are never mocked.
    #[must_use]
    pub fn type_under_test(&self) -> &TypeSig {
        &self.type_under_test
    }

    fn is_external(&self, method: &MethodDescriptor) -> bool {
        let owner = method.declaring_type.type_name();
        owner != self.type_under_test.type_name() && method.declaring_type != TypeSig::Object
    }
}

impl Deref for ExternalCallMocker {
    type Target = MethodBag;

    fn deref(&self) -> &MethodBag {
        &self.bag
    }
}

impl DerefMut for ExternalCallMocker {
    fn deref_mut(&mut self) -> &mut MethodBag {
        &mut self.bag
    }
}

impl CallProvider for ExternalCallMocker {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        let external: Vec<&MethodDescriptor> = request
            .intercepted
            .iter()
            .filter(|method| self.is_external(method))
            .collect();

        self.bag.map_calls(&external, map);

        match external.iter().find(|method| !map.contains_mapping(method)) {
            Some(missing) => Err(Error::MissingMock {
                type_name: missing.declaring_type.to_string(),
                method: missing.name.clone(),
            }),
            None => Ok(()),
        }
    }
}
