//! Wires the scheduler (C8) to the provider registry and runtime (C4, C3),
//! so a live run actually calls into a guest instead of a test double (spec
//! §30 core control flow: "C8 drives execution, calling C3 per unit, which
//! calls C2 into the guest"). Grounded on the same capability-interface
//! shape the teacher's `EchoDispatch`-style demo stub models, but backed by
//! a real `ProviderRegistry` instead of echoing the unit back.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::model::{Operation, PlanUnit};
use crate::provider::enforcer::CapabilityEnforcer;
use crate::provider::registry::ProviderRegistry;
use crate::scheduler::ProviderDispatch;

/// Maps a plan-unit operation to the guest entrypoint that implements it
/// (spec: apply for create/update, read for read, destroy for delete).
/// `Noop` carries no mutation, so it is dispatched the same way `Read` is —
/// it observes state without changing it.
fn entrypoint_for(operation: Operation) -> &'static str {
    match operation {
        Operation::Create | Operation::Update => "provider_apply",
        Operation::Read | Operation::Noop => "provider_read",
        Operation::Delete => "provider_destroy",
    }
}

/// Production `ProviderDispatch`: resolves a unit's provider through the
/// registry, grants exactly the capabilities its manifest declares, and
/// calls the entrypoint matching the unit's operation.
pub struct RegistryDispatch {
    registry: Arc<ProviderRegistry>,
    temp_root: PathBuf,
}

impl RegistryDispatch {
    pub fn new(registry: Arc<ProviderRegistry>, temp_root: PathBuf) -> Self {
        Self { registry, temp_root }
    }
}

#[async_trait::async_trait]
impl ProviderDispatch for RegistryDispatch {
    async fn dispatch(&self, unit: &PlanUnit) -> Result<Value> {
        let version_constraint = unit.provider_version.as_deref().unwrap_or("latest");
        let manifest = self.registry.manifest(&unit.provider, version_constraint)?;

        // The registry already rejected this manifest at `register` time if
        // it asked for a capability outside the deployment allow-list, so
        // granting exactly what it declares here is safe.
        let enforcer = Arc::new(CapabilityEnforcer::new(
            manifest.metadata.required_capabilities.clone(),
            self.temp_root.join(manifest.key()),
        ));
        let handle = self.registry.get(&unit.provider, version_constraint, enforcer).await?;

        let entrypoint = entrypoint_for(unit.operation);
        let mut runtime = handle.lock().await;
        runtime.call(entrypoint, &unit.desired_state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::manifest::ProviderManifest;
    use std::time::Duration;

    fn manifest_yaml(name: &str) -> String {
        format!(
            r#"
metadata:
  name: {name}
  version: 1.0.0
  author: test
  license: MIT
  required_capabilities: []
schema:
  version: "1"
  resource_types: {{}}
entrypoint: provider.wasm
"#
        )
    }

    /// `provider_apply`/`provider_read`/`provider_destroy` all alias the
    /// same echo function, so this exercises routing through the registry
    /// end to end without depending on which entrypoint got picked.
    const ECHO_WAT: &str = r#"
(module
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const 1024))
  (func $malloc (export "malloc") (param $len i32) (result i32)
    (local $p i32)
    (local.set $p (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (local.get $p))
  (func (export "free") (param i32))
  (func $echo (param $ptr i32) (param $len i32) (result i64)
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $ptr)) (i64.const 32))
      (i64.extend_i32_u (local.get $len))))
  (export "provider_init" (func $echo))
  (export "provider_read" (func $echo))
  (export "provider_plan" (func $echo))
  (export "provider_apply" (func $echo))
  (export "provider_destroy" (func $echo))
  (export "provider_validate" (func $echo))
  (export "provider_schema" (func $echo))
  (export "provider_metadata" (func $echo)))
"#;

    #[tokio::test]
    async fn dispatch_resolves_provider_and_calls_the_operation_mapped_entrypoint() {
        let registry = Arc::new(ProviderRegistry::new(vec![], 16, Duration::from_secs(5)));
        let manifest = ProviderManifest::from_yaml(&manifest_yaml("echo")).unwrap();
        let wasm = wat::parse_str(ECHO_WAT).unwrap();
        registry.register(manifest, wasm).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dispatch = RegistryDispatch::new(registry, dir.path().to_path_buf());

        let mut unit = PlanUnit::new("u1", "res-1", Operation::Create, "echo");
        unit.desired_state = serde_json::json!({"k": "v"});

        let response = dispatch.dispatch(&unit).await.unwrap();
        assert_eq!(response, serde_json::json!({"k": "v"}));
    }

    #[tokio::test]
    async fn unregistered_provider_fails_before_touching_the_runtime() {
        let registry = Arc::new(ProviderRegistry::new(vec![], 16, Duration::from_secs(5)));
        let dir = tempfile::tempdir().unwrap();
        let dispatch = RegistryDispatch::new(registry, dir.path().to_path_buf());

        let unit = PlanUnit::new("u1", "res-1", Operation::Create, "missing");
        assert!(dispatch.dispatch(&unit).await.is_err());
    }
}
