//! Process-wide interception state: the rule list and the call map cache.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use log::debug;

use crate::{
    interception::{
        CallMap, CallProvider, CallTarget, CompositeProvider, FilterBinder, SignatureMatcher,
        SingleMethodBinder, Substitute,
    },
    metadata::{method::MethodDescriptor, typesig::NoResolver},
    Error, Result,
};

type Slot = Arc<Mutex<Option<Arc<CallMap>>>>;

/// Cache of populated call maps, one per host method.
///
/// Population runs at most once per host. Concurrent first callers of the same host
/// serialize on that host's slot; the loser of the race finds the published map. A failed
/// population removes the slot, so the next call tries again and [`len`](Self::len) only
/// counts hosts that were populated or are being populated.
#[derive(Default)]
pub struct CallMapRegistry {
    maps: DashMap<MethodDescriptor, Slot>,
}

impl CallMapRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The map of `host`, running `populate` to build it if it was never published.
    ///
    /// # Errors
    /// Returns whatever `populate` fails with, or [`Error::LockError`] on a poisoned slot.
    pub fn get_or_create<F>(&self, host: &MethodDescriptor, populate: F) -> Result<Arc<CallMap>>
    where
        F: FnOnce() -> Result<CallMap>,
    {
        let slot = self.maps.entry(host.clone()).or_default().value().clone();

        let mut published = lock!(slot);
        if let Some(map) = published.as_ref() {
            return Ok(map.clone());
        }

        let map = match populate() {
            Ok(map) => Arc::new(map),
            Err(error) => {
                drop(published);
                self.maps.remove_if(host, |_, current| Arc::ptr_eq(current, &slot));
                return Err(error);
            }
        };
        debug!(
            "Populated call map for {}: {} exact, {} filters",
            host,
            map.exact_len(),
            map.filter_len()
        );
        *published = Some(map.clone());
        drop(published);
        // A waiter may have populated a slot that a failed run already dropped.
        self.maps.entry(host.clone()).or_insert(slot);
        Ok(map)
    }

    /// The published map of `host`.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned slot.
    pub fn get(&self, host: &MethodDescriptor) -> Result<Option<Arc<CallMap>>> {
        let Some(slot) = self.maps.get(host).map(|entry| entry.value().clone()) else {
            return Ok(None);
        };
        let published = lock!(slot);
        Ok(published.clone())
    }

    /// Whether a map for `host` has been published.
    #[must_use]
    pub fn contains(&self, host: &MethodDescriptor) -> bool {
        matches!(self.get(host), Ok(Some(_)))
    }

    /// Number of hosts with a published or in-flight map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether the registry holds no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Drop every cached map.
    pub fn clear(&self) {
        self.maps.clear();
    }
}

impl fmt::Debug for CallMapRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallMapRegistry")
            .field("hosts", &self.maps.len())
            .finish()
    }
}

/// The ordered list of active providers.
#[derive(Default)]
pub struct BinderRegistry {
    providers: Mutex<Vec<Arc<dyn CallProvider>>>,
}

impl BinderRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule replacing calls selected by `target` with `substitute`.
    ///
    /// An exact target whose substitute declares a signature is checked against that
    /// signature right away.
    ///
    /// # Errors
    /// Returns [`Error::SignatureMismatch`] when the substitute cannot stand in for the
    /// target, or [`Error::LockError`].
    pub fn add_rule(&self, target: CallTarget, substitute: Arc<dyn Substitute>) -> Result<()> {
        let provider: Arc<dyn CallProvider> = match target {
            CallTarget::Exact(method) => {
                if let Some(signature) = substitute.signature() {
                    if !SignatureMatcher::new(&NoResolver).is_compatible(signature, &method) {
                        return Err(Error::SignatureMismatch {
                            method: method.name.clone(),
                        });
                    }
                }
                Arc::new(SingleMethodBinder::new(method, substitute))
            }
            CallTarget::Filter(filter) => Arc::new(FilterBinder::new(filter, substitute)),
        };
        self.add_provider(provider)
    }

    /// Append a provider.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn add_provider(&self, provider: Arc<dyn CallProvider>) -> Result<()> {
        lock!(self.providers).push(provider);
        Ok(())
    }

    /// Remove every provider.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn clear(&self) -> Result<()> {
        lock!(self.providers).clear();
        Ok(())
    }

    /// A snapshot of the current providers as one provider.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn composite(&self) -> Result<CompositeProvider> {
        Ok(CompositeProvider::new(lock!(self.providers).clone()))
    }

    /// Number of providers.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn len(&self) -> Result<usize> {
        Ok(lock!(self.providers).len())
    }

    /// Whether no provider is registered.
    ///
    /// # Errors
    /// Returns [`Error::LockError`] on a poisoned lock.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(lock!(self.providers).is_empty())
    }
}

impl fmt::Debug for BinderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinderRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
    };

    use super::*;
    use crate::{
        emulation::EmValue,
        interception::{FnSubstitute, IntoDelegate},
        metadata::{method::MethodFlags, typesig::TypeSig},
    };

    fn helper() -> MethodDescriptor {
        MethodDescriptor::new(TypeSig::class("Demo.Util"), "Helper")
            .with_parameters(vec![TypeSig::String])
            .with_flags(MethodFlags::STATIC)
    }

    #[test]
    fn rejects_mismatched_delegate() {
        let registry = BinderRegistry::new();
        let result = registry.add_rule(
            CallTarget::Exact(helper()),
            Arc::new((|_: String, _: String| {}).into_delegate()),
        );
        assert!(matches!(result, Err(Error::SignatureMismatch { method }) if method == "Helper"));
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn accepts_rules_in_order() {
        let registry = BinderRegistry::new();
        registry
            .add_rule(
                CallTarget::Exact(helper()),
                Arc::new((|_: String| {}).into_delegate()),
            )
            .unwrap();
        registry
            .add_rule(
                CallTarget::filter(|_| true),
                Arc::new(FnSubstitute::new(|_| Ok(EmValue::Void))),
            )
            .unwrap();
        assert_eq!(registry.len().unwrap(), 2);
        assert_eq!(registry.composite().unwrap().len(), 2);

        registry.clear().unwrap();
        assert!(registry.composite().unwrap().is_empty());
    }

    #[test]
    fn populates_once() {
        let registry = Arc::new(CallMapRegistry::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let host = helper();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let runs = runs.clone();
                let host = host.clone();
                thread::spawn(move || {
                    registry
                        .get_or_create(&host, || {
                            runs.fetch_add(1, Ordering::SeqCst);
                            Ok(CallMap::new(Arc::new(NoResolver)))
                        })
                        .unwrap()
                })
            })
            .collect();

        let maps: Vec<Arc<CallMap>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(maps.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert!(registry.contains(&host));
    }

    #[test]
    fn failed_population_retries() {
        let registry = CallMapRegistry::new();
        let host = helper();

        let failed = registry.get_or_create(&host, || Err(Error::Substitute("no".to_string())));
        assert!(failed.is_err());
        assert!(!registry.contains(&host));
        assert!(registry.is_empty());

        registry
            .get_or_create(&host, || Ok(CallMap::new(Arc::new(NoResolver))))
            .unwrap();
        assert!(registry.contains(&host));
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
    }
}
