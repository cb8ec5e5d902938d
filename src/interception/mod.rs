//! Call interception.
//!
//! This module holds everything between a rule and a rewritten call site:
//!
//! - [`matcher`] ranks methods by structural signature
//! - [`substitute`] defines replacement behavior ([`Delegate`], [`FnSubstitute`])
//! - [`callmap`] stores the substitutes of one host method
//! - [`provider`] and [`methodbag`] populate call maps
//! - [`registry`] keeps the rule list and the call map cache
//! - [`replace`] is the declarative registration API
//! - [`runtime`] ties the pieces into the [`Interception`] context rewritten code consults
//!
//! # Lifecycle
//!
//! 1. Register rules on an [`Interception`], directly or through [`Replace`]
//! 2. Run rewritten code; the first execution of each host method asks
//!    [`Interception::provider_for`] for a provider and [`Interception::call_map`] for the
//!    host's map, which is populated exactly once
//! 3. Every call site of the host consults the map and either runs the substitute or the
//!    original call
//! 4. [`Interception::reset`] at the end of the run

pub mod callmap;
pub mod context;
pub mod matcher;
pub mod methodbag;
pub mod provider;
pub mod registry;
pub mod replace;
pub mod runtime;
pub mod substitute;

pub use callmap::{CallMap, CallTarget, MethodFilter};
pub use context::{InvocationContext, StackFrame, StackTrace};
pub use matcher::{BestMatch, CriteriaType, MatchQuery, Signature, SignatureMatcher};
pub use methodbag::{ExternalCallMocker, MethodBag};
pub use provider::{
    CallProvider, CompositeProvider, FilterBinder, PopulateRequest, SingleMethodBinder,
};
pub use registry::{BinderRegistry, CallMapRegistry};
pub use replace::{
    ConstructorSelector, FilterSelector, MethodSelector, PropertySelector, Replace,
};
pub use runtime::{Interception, ProviderResolver};
pub use substitute::{Delegate, FnSubstitute, FromValue, IntoDelegate, IntoValue, Substitute};
