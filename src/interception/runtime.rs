//! The interception context shared by rule registration and rewritten code.

use std::{
    fmt,
    sync::{Arc, RwLock},
};

use log::debug;

use crate::{
    emulation::EmValue,
    interception::{
        BinderRegistry, CallMap, CallMapRegistry, CallProvider, CallTarget, PopulateRequest,
        StackTrace, Substitute,
    },
    metadata::{
        method::MethodDescriptor,
        typesig::{TypeResolver, TypeSig},
    },
    Result,
};

/// Chooses a provider for a calling instance and the type declaring the host method.
pub type ProviderResolver =
    Arc<dyn Fn(&EmValue, &TypeSig) -> Option<Arc<dyn CallProvider>> + Send + Sync>;

/// Everything rewritten code consults at run time.
///
/// Create one per test run, register rules, run the rewritten code against it, and
/// [`reset`](Interception::reset) it afterwards. Registration and execution may happen on
/// different threads.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use dotshim::{
///     interception::{CallTarget, Interception, IntoDelegate},
///     metadata::{method::{MethodDescriptor, MethodFlags}, typesig::TypeSig},
/// };
///
/// let interception = Interception::new();
/// let helper = MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
///     .with_parameters(vec![TypeSig::String])
///     .with_flags(MethodFlags::STATIC);
///
/// interception.add_rule(
///     CallTarget::Exact(helper),
///     Arc::new((|_text: String| {}).into_delegate()),
/// )?;
/// assert_eq!(interception.binders().len()?, 1);
/// # Ok::<(), dotshim::Error>(())
/// ```
#[derive(Default)]
pub struct Interception {
    binders: BinderRegistry,
    maps: CallMapRegistry,
    resolver: RwLock<Option<ProviderResolver>>,
}

impl Interception {
    /// A context with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule. See [`BinderRegistry::add_rule`].
    ///
    /// # Errors
    /// Returns [`crate::Error::SignatureMismatch`] for incompatible exact rules.
    pub fn add_rule(&self, target: CallTarget, substitute: Arc<dyn Substitute>) -> Result<()> {
        self.binders.add_rule(target, substitute)
    }

    /// Register a provider.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] on a poisoned lock.
    pub fn add_provider(&self, provider: Arc<dyn CallProvider>) -> Result<()> {
        self.binders.add_provider(provider)
    }

    /// Install a resolver consulted before the registered providers.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] on a poisoned lock.
    pub fn set_resolver<F>(&self, resolver: F) -> Result<()>
    where
        F: Fn(&EmValue, &TypeSig) -> Option<Arc<dyn CallProvider>> + Send + Sync + 'static,
    {
        *write_lock!(self.resolver) = Some(Arc::new(resolver));
        Ok(())
    }

    /// The provider for code running on `calling_instance` inside `declaring_type`.
    ///
    /// The resolver wins when it returns a provider. Otherwise the registered providers are
    /// snapshotted into one; with none registered there is no provider at all and
    /// rewritten code takes the original calls.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] on a poisoned lock.
    pub fn provider_for(
        &self,
        calling_instance: &EmValue,
        declaring_type: &TypeSig,
    ) -> Result<Option<Arc<dyn CallProvider>>> {
        let resolver = read_lock!(self.resolver).clone();
        if let Some(resolver) = resolver {
            if let Some(provider) = resolver(calling_instance, declaring_type) {
                return Ok(Some(provider));
            }
        }

        if self.binders.is_empty()? {
            return Ok(None);
        }
        Ok(Some(Arc::new(self.binders.composite()?)))
    }

    /// The call map of `host`, populated by `provider` on first use.
    ///
    /// # Errors
    /// Returns the provider's error when population fails; nothing is cached then.
    pub fn call_map(
        &self,
        provider: &dyn CallProvider,
        calling_instance: &EmValue,
        host: &MethodDescriptor,
        intercepted: &[MethodDescriptor],
        stack_trace: &StackTrace,
        hierarchy: Arc<dyn TypeResolver + Send + Sync>,
    ) -> Result<Arc<CallMap>> {
        self.maps.get_or_create(host, || {
            let mut map = CallMap::new(hierarchy);
            let request = PopulateRequest {
                calling_instance,
                host_method: host,
                intercepted,
                stack_trace,
            };
            provider.add_method_calls(&request, &mut map)?;
            Ok(map)
        })
    }

    /// The registered providers.
    #[must_use]
    pub fn binders(&self) -> &BinderRegistry {
        &self.binders
    }

    /// The call map cache.
    #[must_use]
    pub fn maps(&self) -> &CallMapRegistry {
        &self.maps
    }

    /// Drop every rule, cached map and resolver.
    ///
    /// # Errors
    /// Returns [`crate::Error::LockError`] on a poisoned lock.
    pub fn reset(&self) -> Result<()> {
        self.binders.clear()?;
        self.maps.clear();
        *write_lock!(self.resolver) = None;
        debug!("Interception state reset");
        Ok(())
    }
}

impl fmt::Debug for Interception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interception")
            .field("binders", &self.binders)
            .field("maps", &self.maps)
            .finish_non_exhaustive()
    }
}
