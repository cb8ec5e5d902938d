//! Per-host-method substitute tables.
//!
//! A [`CallMap`] belongs to one host method. It is filled once by the active
//! [`CallProvider`](crate::interception::CallProvider)s, published as an `Arc`, and only read
//! afterwards. Every call site of the host asks it two questions: is there a substitute for
//! this target ([`CallMap::contains_mapping`]), and which one ([`CallMap::get_substitute`]).
//!
//! # Lookup Order
//!
//! Three kinds of entries can claim a target:
//!
//! - exact entries whose declaring type name, member name and arity equal the target's,
//!   ranked by the [`SignatureMatcher`]
//! - exact entries with the target's name declared by a base type or interface of the
//!   target's declaring type, ranked the same way
//! - filter entries that accept the target
//!
//! Each kind nominates its best entry, and the nominee registered first wins. Equally
//! ranked exact entries also resolve to the one registered first.

use std::{fmt, sync::Arc};

use rustc_hash::FxHashMap;

use crate::{
    interception::{MatchQuery, SignatureMatcher, Substitute},
    metadata::{method::MethodDescriptor, typesig::TypeResolver},
};

/// Predicate selecting target methods.
pub type MethodFilter = Arc<dyn Fn(&MethodDescriptor) -> bool + Send + Sync>;

/// What an interception rule applies to.
#[derive(Clone)]
pub enum CallTarget {
    /// Calls structurally matching one method
    Exact(MethodDescriptor),
    /// Calls to every method the predicate accepts
    Filter(MethodFilter),
}

impl CallTarget {
    /// A filter target over a closure.
    pub fn filter<F>(filter: F) -> Self
    where
        F: Fn(&MethodDescriptor) -> bool + Send + Sync + 'static,
    {
        CallTarget::Filter(Arc::new(filter))
    }
}

impl fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallTarget::Exact(method) => write!(f, "Exact({method})"),
            CallTarget::Filter(_) => f.write_str("Filter"),
        }
    }
}

struct ExactEntry {
    sequence: usize,
    method: MethodDescriptor,
    substitute: Arc<dyn Substitute>,
}

struct FilterEntry {
    sequence: usize,
    filter: MethodFilter,
    substitute: Arc<dyn Substitute>,
}

/// Substitutes for the call sites of one host method.
pub struct CallMap {
    resolver: Arc<dyn TypeResolver + Send + Sync>,
    exact: Vec<ExactEntry>,
    filters: Vec<FilterEntry>,
    index: FxHashMap<(String, String, usize), Vec<usize>>,
}

impl CallMap {
    /// An empty map that resolves class hierarchies through `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<dyn TypeResolver + Send + Sync>) -> Self {
        CallMap {
            resolver,
            exact: Vec::new(),
            filters: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// The hierarchy source used for matching.
    #[must_use]
    pub fn resolver(&self) -> &(dyn TypeResolver + Send + Sync) {
        self.resolver.as_ref()
    }

    /// Map calls matching `method` to `substitute`.
    pub fn add_exact(&mut self, method: MethodDescriptor, substitute: Arc<dyn Substitute>) {
        self.index
            .entry(method.lookup_key())
            .or_default()
            .push(self.exact.len());
        self.exact.push(ExactEntry {
            sequence: self.registered(),
            method,
            substitute,
        });
    }

    /// Map calls to every method `filter` accepts to `substitute`.
    pub fn add_filter(&mut self, filter: MethodFilter, substitute: Arc<dyn Substitute>) {
        self.filters.push(FilterEntry {
            sequence: self.registered(),
            filter,
            substitute,
        });
    }

    fn registered(&self) -> usize {
        self.exact.len() + self.filters.len()
    }

    /// Whether a substitute is registered for `target`.
    #[must_use]
    pub fn contains_mapping(&self, target: &MethodDescriptor) -> bool {
        self.get_substitute(target).is_some()
    }

    /// The substitute for `target`, if any.
    #[must_use]
    pub fn get_substitute(&self, target: &MethodDescriptor) -> Option<Arc<dyn Substitute>> {
        let query = MatchQuery::for_method(target);

        let direct = self
            .index
            .get(&target.lookup_key())
            .and_then(|positions| self.rank(positions, &query));

        let inherited: Vec<usize> = self
            .exact
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.method.name == target.name
                    && entry.method.declaring_type != target.declaring_type
                    && entry
                        .method
                        .declaring_type
                        .is_assignable_from(&target.declaring_type, self.resolver.as_ref())
            })
            .map(|(position, _)| position)
            .collect();
        let inherited = self.rank(&inherited, &query);

        let filtered = self
            .filters
            .iter()
            .find(|entry| (entry.filter)(target))
            .map(|entry| (entry.sequence, &entry.substitute));

        [direct, inherited, filtered]
            .into_iter()
            .flatten()
            .min_by_key(|(sequence, _)| *sequence)
            .map(|(_, substitute)| substitute.clone())
    }

    fn rank(
        &self,
        positions: &[usize],
        query: &MatchQuery,
    ) -> Option<(usize, &Arc<dyn Substitute>)> {
        let candidates: Vec<&MethodDescriptor> = positions
            .iter()
            .filter_map(|position| self.exact.get(*position))
            .map(|entry| &entry.method)
            .collect();

        let best = SignatureMatcher::new(self.resolver.as_ref()).best_match(&candidates, query)?;
        positions
            .get(best.index)
            .and_then(|position| self.exact.get(*position))
            .map(|entry| (entry.sequence, &entry.substitute))
    }

    /// Number of exact entries.
    #[must_use]
    pub fn exact_len(&self) -> usize {
        self.exact.len()
    }

    /// Number of filter entries.
    #[must_use]
    pub fn filter_len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the map has no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.filters.is_empty()
    }

    /// The methods of the exact entries, in registration order.
    pub fn mapped_methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.exact.iter().map(|entry| &entry.method)
    }
}

impl fmt::Debug for CallMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMap")
            .field(
                "exact",
                &self
                    .exact
                    .iter()
                    .map(|entry| entry.method.to_string())
                    .collect::<Vec<_>>(),
            )
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        emulation::EmValue,
        interception::FnSubstitute,
        metadata::{
            method::MethodFlags,
            typesig::{NoResolver, TypeSig},
        },
        Result,
    };

    struct Returns(i32);

    impl Substitute for Returns {
        fn invoke(&self, _: &crate::interception::InvocationContext) -> Result<EmValue> {
            Ok(EmValue::I32(self.0))
        }
    }

    fn id_of(substitute: &Arc<dyn Substitute>) -> i32 {
        let context = crate::interception::InvocationContext::new(
            EmValue::Null,
            EmValue::Null,
            MethodDescriptor::new(TypeSig::class("Demo.C"), "Do"),
            MethodDescriptor::new(TypeSig::class("Demo.C"), "Do"),
            Arc::default(),
            Vec::new(),
        );
        match substitute.invoke(&context).unwrap() {
            EmValue::I32(value) => value,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn helper(params: Vec<TypeSig>) -> MethodDescriptor {
        MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
            .with_parameters(params)
            .with_flags(MethodFlags::STATIC)
    }

    #[test]
    fn exact_overloads() {
        let mut map = CallMap::new(Arc::new(NoResolver));
        map.add_exact(helper(vec![TypeSig::I4]), Arc::new(Returns(1)));
        map.add_exact(helper(vec![TypeSig::String]), Arc::new(Returns(2)));

        let found = map.get_substitute(&helper(vec![TypeSig::String])).unwrap();
        assert_eq!(id_of(&found), 2);
        assert!(!map.contains_mapping(&helper(vec![])));
        assert_eq!(map.exact_len(), 2);
    }

    #[test]
    fn first_registered_wins() {
        let mut map = CallMap::new(Arc::new(NoResolver));
        map.add_exact(helper(vec![TypeSig::String]), Arc::new(Returns(1)));
        map.add_exact(helper(vec![TypeSig::String]), Arc::new(Returns(2)));

        let found = map.get_substitute(&helper(vec![TypeSig::String])).unwrap();
        assert_eq!(id_of(&found), 1);
    }

    #[test]
    fn earlier_filter_beats_later_exact() {
        let mut map = CallMap::new(Arc::new(NoResolver));
        map.add_filter(
            Arc::new(|method: &MethodDescriptor| method.name == "Helper"),
            Arc::new(Returns(7)),
        );
        map.add_exact(helper(vec![TypeSig::String]), Arc::new(Returns(1)));

        assert_eq!(
            id_of(&map.get_substitute(&helper(vec![TypeSig::String])).unwrap()),
            7
        );
    }

    #[test]
    fn earlier_exact_beats_later_filter() {
        let mut map = CallMap::new(Arc::new(NoResolver));
        map.add_exact(helper(vec![TypeSig::String]), Arc::new(Returns(1)));
        map.add_filter(Arc::new(|_: &MethodDescriptor| true), Arc::new(Returns(7)));

        assert_eq!(
            id_of(&map.get_substitute(&helper(vec![TypeSig::String])).unwrap()),
            1
        );
        // The filter still claims what no exact entry matches.
        assert_eq!(id_of(&map.get_substitute(&helper(vec![])).unwrap()), 7);
    }

    #[test]
    fn filters_in_order() {
        let mut map = CallMap::new(Arc::new(NoResolver));
        map.add_filter(
            Arc::new(|method: &MethodDescriptor| method.name == "Missing"),
            Arc::new(Returns(1)),
        );
        map.add_filter(
            Arc::new(|method: &MethodDescriptor| method.name == "Helper"),
            Arc::new(Returns(2)),
        );
        map.add_filter(Arc::new(|_: &MethodDescriptor| true), Arc::new(Returns(3)));

        assert_eq!(id_of(&map.get_substitute(&helper(vec![])).unwrap()), 2);
        assert_eq!(map.filter_len(), 3);
    }

    #[test]
    fn inherited_entries() {
        struct Hierarchy;
        impl TypeResolver for Hierarchy {
            fn base_type(&self, ty: &TypeSig) -> Option<TypeSig> {
                (ty.type_name() == "Demo.Derived").then(|| TypeSig::class("Demo.Base"))
            }
            fn interfaces(&self, _: &TypeSig) -> Vec<TypeSig> {
                Vec::new()
            }
        }

        let base = MethodDescriptor::new(TypeSig::class("Demo.Base"), "Run");
        let derived = MethodDescriptor::new(TypeSig::class("Demo.Derived"), "Run");
        let other = MethodDescriptor::new(TypeSig::class("Demo.Other"), "Run");

        let mut map = CallMap::new(Arc::new(Hierarchy));
        map.add_exact(base, Arc::new(FnSubstitute::new(|_| Ok(EmValue::I32(4)))));

        assert_eq!(id_of(&map.get_substitute(&derived).unwrap()), 4);
        assert!(!map.contains_mapping(&other));
    }
}
