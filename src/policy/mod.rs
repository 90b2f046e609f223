//! Policy subsystem (spec §4.8): a compiled-rule store, a minimal
//! declarative condition language for operator-authored policies, five
//! always-loaded built-in policies, and an evaluator that aggregates
//! violations across whichever subset is enabled.

pub mod builtins;
pub mod compiler;
pub mod evaluator;
pub mod model;
pub mod rule;
pub mod store;

pub use compiler::{CompiledPolicy, NativeRule, RuleKind};
pub use evaluator::PolicyEvaluator;
pub use model::{Policy, PolicyContext, PolicyInput, PolicyResult, PolicyViolation, Severity};
pub use store::PolicyStore;

use std::sync::Arc;

/// Builds a fresh store with the five built-in policies already loaded
/// (spec §4.8 "Five policies are always loaded at construction time").
pub fn new_store_with_builtins() -> Arc<PolicyStore> {
    let store = Arc::new(PolicyStore::new());
    for policy in builtins::builtin_policies() {
        store.insert(policy);
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_store_loads_five_builtins() {
        let store = new_store_with_builtins();
        assert_eq!(store.list().len(), 5);
        assert_eq!(store.enabled().len(), 5);
    }
}
