//! Call providers.
//!
//! A [`CallProvider`] fills the [`CallMap`] of a host method the first time that method
//! runs. It sees the calling instance, the host method, the list of methods the host calls
//! (its intercepted methods) and the stack at that moment, and adds entries for the calls
//! it wants to take over.
//!
//! # Providers
//!
//! - [`SingleMethodBinder`] binds one substitute to the intercepted method that best
//!   matches its target
//! - [`FilterBinder`] binds one substitute to every call a predicate accepts
//! - [`CompositeProvider`] runs a list of providers in order
//!
//! [`MethodBag`](crate::interception::MethodBag) and
//! [`ExternalCallMocker`](crate::interception::ExternalCallMocker) are name-keyed providers
//! built on the same trait.

use std::{fmt, sync::Arc};

use log::debug;

use crate::{
    emulation::EmValue,
    interception::{
        CallMap, MatchQuery, MethodFilter, SignatureMatcher, StackTrace, Substitute,
    },
    metadata::method::MethodDescriptor,
    Result,
};

/// The situation a provider populates a call map for.
#[derive(Clone, Copy)]
pub struct PopulateRequest<'a> {
    /// `this` of the host method; null when it is static
    pub calling_instance: &'a EmValue,
    /// The method whose call sites the map serves
    pub host_method: &'a MethodDescriptor,
    /// Every method the host calls or constructs, in call-site order
    pub intercepted: &'a [MethodDescriptor],
    /// The stack when the host first ran
    pub stack_trace: &'a StackTrace,
}

impl fmt::Debug for PopulateRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PopulateRequest")
            .field("host_method", &self.host_method.to_string())
            .field("intercepted", &self.intercepted.len())
            .finish_non_exhaustive()
    }
}

/// Source of call map entries.
pub trait CallProvider: Send + Sync {
    /// Add entries for the calls of `request.host_method` this provider handles.
    ///
    /// # Errors
    /// Providers may refuse a host outright; the error surfaces from the host's call.
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()>;
}

/// Binds a substitute to the intercepted method that best fits one target.
///
/// The member name only breaks ties between signature-compatible candidates. A rule for
/// `Util::Helper(string)` therefore binds to `Util::Other(string)` when the host calls
/// `Other` but never `Helper`. Register a filter on the name when that is not wanted.
#[derive(Clone)]
pub struct SingleMethodBinder {
    target: MethodDescriptor,
    substitute: Arc<dyn Substitute>,
}

impl SingleMethodBinder {
    /// Bind `substitute` to calls of `target`.
    pub fn new(target: MethodDescriptor, substitute: Arc<dyn Substitute>) -> Self {
        SingleMethodBinder { target, substitute }
    }

    /// The method this binder replaces.
    #[must_use]
    pub fn target(&self) -> &MethodDescriptor {
        &self.target
    }
}

impl CallProvider for SingleMethodBinder {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        let resolver = map.resolver();
        let candidates: Vec<&MethodDescriptor> = request
            .intercepted
            .iter()
            .filter(|method| {
                method.declaring_type.type_name() == self.target.declaring_type.type_name()
                    || self
                        .target
                        .declaring_type
                        .is_assignable_from(&method.declaring_type, resolver)
            })
            .collect();

        let matcher = SignatureMatcher::new(resolver);
        let Some(best) = matcher.best_match(&candidates, &MatchQuery::for_method(&self.target))
        else {
            return Ok(());
        };
        let bound = (*best.candidate).clone();

        if let Some(signature) = self.substitute.signature() {
            if !matcher.is_compatible(signature, &bound) {
                debug!(
                    "Skipping {} in {}: substitute signature {} does not fit",
                    bound, request.host_method, signature
                );
                return Ok(());
            }
        }

        map.add_exact(bound, self.substitute.clone());
        Ok(())
    }
}

impl fmt::Debug for SingleMethodBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleMethodBinder")
            .field("target", &self.target.to_string())
            .finish_non_exhaustive()
    }
}

/// Binds a substitute to every call a predicate accepts.
#[derive(Clone)]
pub struct FilterBinder {
    filter: MethodFilter,
    substitute: Arc<dyn Substitute>,
}

impl FilterBinder {
    /// Bind `substitute` to calls `filter` accepts.
    pub fn new(filter: MethodFilter, substitute: Arc<dyn Substitute>) -> Self {
        FilterBinder { filter, substitute }
    }
}

impl CallProvider for FilterBinder {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        if request.intercepted.iter().any(|method| (self.filter)(method)) {
            map.add_filter(self.filter.clone(), self.substitute.clone());
        }
        Ok(())
    }
}

impl fmt::Debug for FilterBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FilterBinder")
    }
}

/// Runs several providers against the same map, in order.
#[derive(Clone, Default)]
pub struct CompositeProvider {
    providers: Vec<Arc<dyn CallProvider>>,
}

impl CompositeProvider {
    /// A composite over `providers`.
    #[must_use]
    pub fn new(providers: Vec<Arc<dyn CallProvider>>) -> Self {
        CompositeProvider { providers }
    }

    /// Number of providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the composite has no providers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl CallProvider for CompositeProvider {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        for provider in &self.providers {
            provider.add_method_calls(request, map)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CompositeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeProvider")
            .field("providers", &self.providers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        interception::{FnSubstitute, IntoDelegate},
        metadata::{
            method::MethodFlags,
            typesig::{NoResolver, TypeSig},
        },
    };

    fn util(name: &str, params: Vec<TypeSig>) -> MethodDescriptor {
        MethodDescriptor::new(TypeSig::class("Demo.Util"), name)
            .with_parameters(params)
            .with_flags(MethodFlags::STATIC)
    }

    fn populate(provider: &dyn CallProvider, intercepted: &[MethodDescriptor]) -> CallMap {
        let host = MethodDescriptor::new(TypeSig::class("Demo.C"), "Do");
        let trace = StackTrace::default();
        let request = PopulateRequest {
            calling_instance: &EmValue::Null,
            host_method: &host,
            intercepted,
            stack_trace: &trace,
        };
        let mut map = CallMap::new(Arc::new(NoResolver));
        provider.add_method_calls(&request, &mut map).unwrap();
        map
    }

    #[test]
    fn single_binder_picks_overload() {
        let binder = SingleMethodBinder::new(
            util("Helper", vec![TypeSig::String]),
            Arc::new((|_: String| {}).into_delegate()),
        );
        let intercepted = vec![
            util("Helper", vec![TypeSig::I4]),
            util("Helper", vec![TypeSig::String]),
        ];

        let map = populate(&binder, &intercepted);
        assert_eq!(map.exact_len(), 1);
        assert!(map.contains_mapping(&intercepted[1]));
        assert!(!map.contains_mapping(&intercepted[0]));
    }

    #[test]
    fn single_binder_prefers_name_but_falls_back_to_signature() {
        let binder = SingleMethodBinder::new(
            util("Helper", vec![TypeSig::String]),
            Arc::new((|_: String| {}).into_delegate()),
        );
        let other = util("Other", vec![TypeSig::String]);
        let helper = util("Helper", vec![TypeSig::String]);

        let map = populate(&binder, &[other.clone(), helper.clone()]);
        assert!(map.contains_mapping(&helper));
        assert!(!map.contains_mapping(&other));

        let map = populate(&binder, &[other.clone()]);
        assert!(map.contains_mapping(&other));
    }

    #[test]
    fn single_binder_ignores_other_types() {
        let binder = SingleMethodBinder::new(
            util("Helper", vec![TypeSig::String]),
            Arc::new((|_: String| {}).into_delegate()),
        );
        let elsewhere = MethodDescriptor::new(TypeSig::class("Demo.Other"), "Helper")
            .with_parameters(vec![TypeSig::String])
            .with_flags(MethodFlags::STATIC);

        assert!(populate(&binder, &[elsewhere]).is_empty());
    }

    #[test]
    fn single_binder_skips_incompatible_substitute() {
        let binder = SingleMethodBinder::new(
            util("Helper", vec![TypeSig::String]),
            Arc::new((|_: i32, _: i32| {}).into_delegate()),
        );
        assert!(populate(&binder, &[util("Helper", vec![TypeSig::String])]).is_empty());
    }

    #[test]
    fn single_binder_binds_generic_instantiation() {
        let open = util("Echo", vec![TypeSig::MVar(0)])
            .returns(TypeSig::MVar(0))
            .generic(1);
        let closed = open.instantiate(&[TypeSig::I4]);
        let binder = SingleMethodBinder::new(
            open,
            Arc::new(FnSubstitute::new(|_| Ok(EmValue::Null))),
        );

        let map = populate(&binder, std::slice::from_ref(&closed));
        assert!(map.contains_mapping(&closed));
    }

    #[test]
    fn filter_binder_only_when_used() {
        let binder = FilterBinder::new(
            Arc::new(|method: &MethodDescriptor| method.name == "Helper"),
            Arc::new(FnSubstitute::new(|_| Ok(EmValue::Void))),
        );

        assert!(populate(&binder, &[util("Other", vec![])]).is_empty());
        assert_eq!(populate(&binder, &[util("Helper", vec![])]).filter_len(), 1);
    }

    #[test]
    fn composite_runs_all() {
        let composite = CompositeProvider::new(vec![
            Arc::new(SingleMethodBinder::new(
                util("A", vec![]),
                Arc::new((|| {}).into_delegate()),
            )),
            Arc::new(SingleMethodBinder::new(
                util("B", vec![]),
                Arc::new((|| {}).into_delegate()),
            )),
        ]);
        assert_eq!(composite.len(), 2);

        let map = populate(&composite, &[util("A", vec![]), util("B", vec![])]);
        assert_eq!(map.exact_len(), 2);
    }
}
