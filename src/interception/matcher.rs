//! Structural signature matching.
//!
//! Interception never compares methods by identity. A call site, a rule target and a
//! substitute's own signature are all [`MethodDescriptor`]s, and the [`SignatureMatcher`]
//! decides which candidate fits a query best:
//!
//! | Criterion | Kind |
//! |-----------|------|
//! | Generic arity equals the number of query type arguments (when the query has any) | critical |
//! | Parameter count equals the query's | critical |
//! | Each candidate parameter is assignable from the query argument at that position | critical |
//! | Candidate return type is assignable from the query's return type | critical |
//! | Name equals the query's name | optional, weight 1 |
//!
//! A candidate failing any critical criterion is rejected. Among the rest the highest
//! score wins and ties go to the earliest candidate. Generic method definitions are closed
//! over the query's type arguments before their parameters are compared, and the winner is
//! returned instantiated.
//!
//! # Examples
//!
//! ```rust
//! use dotshim::{
//!     interception::{MatchQuery, SignatureMatcher},
//!     metadata::{method::MethodDescriptor, typesig::{NoResolver, TypeSig}},
//! };
//!
//! let util = TypeSig::class("Demo.Util");
//! let candidates = vec![
//!     MethodDescriptor::new(util.clone(), "Helper").with_parameters(vec![TypeSig::I4]),
//!     MethodDescriptor::new(util.clone(), "Helper").with_parameters(vec![TypeSig::String]),
//! ];
//!
//! let query = MatchQuery::for_method(
//!     &MethodDescriptor::new(util, "Helper").with_parameters(vec![TypeSig::String]),
//! );
//! let best = SignatureMatcher::new(&NoResolver).best_match(&candidates, &query).unwrap();
//! assert_eq!(best.index, 1);
//! ```

use crate::{
    interception::Delegate,
    metadata::{
        method::MethodDescriptor,
        typesig::{TypeResolver, TypeSig},
    },
};

/// Anything that can be ranked by the matcher.
pub trait Signature {
    /// The structural signature to compare.
    fn signature(&self) -> &MethodDescriptor;
}

impl Signature for MethodDescriptor {
    fn signature(&self) -> &MethodDescriptor {
        self
    }
}

impl Signature for Delegate {
    fn signature(&self) -> &MethodDescriptor {
        self.descriptor()
    }
}

impl<T: Signature + ?Sized> Signature for &T {
    fn signature(&self) -> &MethodDescriptor {
        (**self).signature()
    }
}

/// How a criterion influences ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriteriaType {
    /// Failing rejects the candidate
    Critical,
    /// Passing adds the weight to the candidate's score
    Optional(u32),
}

/// What a candidate is matched against.
///
/// `None` parameter slots and a `None` return type match anything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchQuery {
    /// Preferred member name
    pub name: Option<String>,
    /// Argument types by position
    pub parameters: Vec<Option<TypeSig>>,
    /// Type arguments of a generic method call
    pub type_arguments: Vec<TypeSig>,
    /// Type the caller expects back
    pub return_type: Option<TypeSig>,
}

impl MatchQuery {
    /// The query describing a call to `method`.
    #[must_use]
    pub fn for_method(method: &MethodDescriptor) -> Self {
        MatchQuery {
            name: Some(method.name.clone()),
            parameters: method.parameters.iter().cloned().map(Some).collect(),
            type_arguments: method.type_arguments.clone(),
            return_type: Some(method.effective_return_type()),
        }
    }

    /// Stop matching on the return type.
    #[must_use]
    pub fn any_return(mut self) -> Self {
        self.return_type = None;
        self
    }
}

/// The winning candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct BestMatch<'a, S> {
    /// Position of the winner in the candidate list
    pub index: usize,
    /// The winner as supplied
    pub candidate: &'a S,
    /// The winner's signature, closed over the query's type arguments when generic
    pub instantiated: MethodDescriptor,
    /// Sum of the optional weights the winner satisfied
    pub score: u32,
}

struct Criterion<'q> {
    kind: CriteriaType,
    check: Box<dyn Fn(&MethodDescriptor) -> bool + 'q>,
}

/// Ranks candidate signatures against a query.
pub struct SignatureMatcher<'r> {
    resolver: &'r dyn TypeResolver,
}

impl<'r> SignatureMatcher<'r> {
    /// A matcher that consults `resolver` for class hierarchies.
    #[must_use]
    pub fn new(resolver: &'r dyn TypeResolver) -> Self {
        SignatureMatcher { resolver }
    }

    /// The best candidate for `query`, or `None` when every candidate fails a critical
    /// criterion.
    pub fn best_match<'a, S: Signature>(
        &self,
        candidates: &'a [S],
        query: &MatchQuery,
    ) -> Option<BestMatch<'a, S>> {
        let criteria = self.criteria(query);
        let mut best: Option<BestMatch<'a, S>> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(instantiated) = Self::instantiate(candidate.signature(), query) else {
                continue;
            };

            let mut score = 0;
            let mut rejected = false;
            for criterion in &criteria {
                let passed = (criterion.check)(&instantiated);
                match criterion.kind {
                    CriteriaType::Critical if !passed => {
                        rejected = true;
                        break;
                    }
                    CriteriaType::Optional(weight) if passed => score += weight,
                    _ => {}
                }
            }
            if rejected {
                continue;
            }

            if best.as_ref().map_or(true, |current| score > current.score) {
                best = Some(BestMatch {
                    index,
                    candidate,
                    instantiated,
                    score,
                });
            }
        }

        best
    }

    /// Whether `candidate` could stand in for calls to `target`.
    pub fn is_compatible<S: Signature>(&self, candidate: &S, target: &MethodDescriptor) -> bool {
        self.best_match(std::slice::from_ref(candidate), &MatchQuery::for_method(target))
            .is_some()
    }

    /// Close `candidate` over the query's type arguments; `None` when the generic arity
    /// does not fit.
    fn instantiate(candidate: &MethodDescriptor, query: &MatchQuery) -> Option<MethodDescriptor> {
        if query.type_arguments.is_empty() {
            return Some(candidate.clone());
        }

        if candidate.generic_param_count as usize != query.type_arguments.len() {
            return None;
        }

        if candidate.is_generic_definition() {
            Some(candidate.instantiate(&query.type_arguments))
        } else if candidate.type_arguments == query.type_arguments {
            Some(candidate.clone())
        } else {
            None
        }
    }

    fn criteria<'q>(&'q self, query: &'q MatchQuery) -> Vec<Criterion<'q>> {
        let mut criteria = Vec::with_capacity(query.parameters.len() + 3);

        if let Some(name) = &query.name {
            criteria.push(Criterion {
                kind: CriteriaType::Optional(1),
                check: Box::new(move |method| method.name == *name),
            });
        }

        let arity = query.parameters.len();
        criteria.push(Criterion {
            kind: CriteriaType::Critical,
            check: Box::new(move |method| method.parameters.len() == arity),
        });

        for (position, argument) in query.parameters.iter().enumerate() {
            let Some(argument) = argument else {
                continue;
            };
            criteria.push(Criterion {
                kind: CriteriaType::Critical,
                check: Box::new(move |method| {
                    method
                        .parameters
                        .get(position)
                        .is_some_and(|parameter| parameter.is_assignable_from(argument, self.resolver))
                }),
            });
        }

        if let Some(expected) = &query.return_type {
            criteria.push(Criterion {
                kind: CriteriaType::Critical,
                check: Box::new(move |method| {
                    let actual = method.effective_return_type();
                    actual == *expected || actual.is_assignable_from(expected, self.resolver)
                }),
            });
        }

        criteria
    }
}
