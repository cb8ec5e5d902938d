//! Tracking of methods the rewriter already handled.

use std::collections::BTreeSet;

use crate::metadata::{module::Module, token::Token};

/// The methods a rewrite pass must leave alone.
///
/// Seeded from the module's out-of-band processed table when the pass starts and written
/// back when it ends, so the marker survives saving and reloading the module.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessedSet {
    methods: BTreeSet<Token>,
}

impl ProcessedSet {
    /// The set recorded in `module`.
    #[must_use]
    pub fn from_module(module: &Module) -> Self {
        ProcessedSet {
            methods: module.processed().collect(),
        }
    }

    /// Whether `method` was processed.
    #[must_use]
    pub fn contains(&self, method: Token) -> bool {
        self.methods.contains(&method)
    }

    /// Record `method`. Returns `false` if it was already recorded.
    pub fn insert(&mut self, method: Token) -> bool {
        self.methods.insert(method)
    }

    /// Number of recorded methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Write every recorded method into the module's processed table.
    pub fn persist(&self, module: &mut Module) {
        for method in &self.methods {
            module.mark_processed(*method);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::module::{MethodDef, TypeDef};

    #[test]
    fn seeded_from_and_persisted_into_module() {
        let mut module = Module::new("Demo");
        let owner = module.add_type(TypeDef::class("Demo.Util"));
        let first = module.add_method(MethodDef::new(owner, "First")).unwrap();
        let second = module.add_method(MethodDef::new(owner, "Second")).unwrap();
        module.mark_processed(first);

        let mut set = ProcessedSet::from_module(&module);
        assert!(set.contains(first));
        assert!(!set.contains(second));
        assert!(!set.insert(first));
        assert!(set.insert(second));
        assert_eq!(set.len(), 2);

        set.persist(&mut module);
        assert!(module.is_processed(second));
    }
}
