//! End-to-end provider host tests against real `wasmtime` instances (spec
//! §8 end-to-end scenario 5: "a provider without `secrets:read` calls
//! `decrypt_secret` and the unit fails with a capability error").
//!
//! The guest modules here are hand-written WAT, not real provider
//! artifacts: a bump-allocator `malloc`, a no-op `free`, and just enough
//! entrypoint logic to prove the bridge's marshaling and the enforcer's
//! capability gate both work through a live `Store`/`Linker`/`Instance`.

use std::sync::Arc;
use std::time::Duration;

use openfroyo_core::provider::{CapabilityEnforcer, ProviderManifest, ProviderRegistry, ProviderRuntime};
use serde_json::{json, Value};

/// Echoes `provider_apply`'s input straight back out; every other required
/// entrypoint aliases the same function. No host imports.
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

/// `provider_apply` forwards its input to `env.decrypt_secret`. If the host
/// call comes back with a zero-length payload (the enforcer's capability
/// denial path, see `host_error_packed`), it returns a fixed
/// `{"error":"denied"}` literal baked into the data segment instead of
/// whatever garbage the packed error code would otherwise unpack to.
const DECRYPT_WAT: &str = r#"
(module
  (import "env" "decrypt_secret" (func $decrypt_secret (param i32 i32) (result i64)))
  (memory (export "memory") 2)
  (data (i32.const 0) "{\"error\":\"denied\"}")
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
  (func $provider_apply (export "provider_apply") (param $ptr i32) (param $len i32) (result i64)
    (local $res i64)
    (local.set $res (call $decrypt_secret (local.get $ptr) (local.get $len)))
    (if (result i64)
      (i32.eqz (i32.wrap_i64 (local.get $res)))
      (then (i64.const 18))
      (else (local.get $res))))
  (export "provider_init" (func $echo))
  (export "provider_read" (func $echo))
  (export "provider_plan" (func $echo))
  (export "provider_destroy" (func $echo))
  (export "provider_validate" (func $echo))
  (export "provider_schema" (func $echo))
  (export "provider_metadata" (func $echo)))
"#;

fn enforcer(caps: &[&str], dir: &tempfile::TempDir) -> Arc<CapabilityEnforcer> {
    Arc::new(CapabilityEnforcer::new(caps.iter().map(|s| s.to_string()), dir.path().to_path_buf()))
}

#[tokio::test]
async fn echo_round_trip_through_real_wasmtime_instance() {
    let wasm = wat::parse_str(ECHO_WAT).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = ProviderRuntime::instantiate(&wasm, 16, Duration::from_secs(5), enforcer(&[], &dir)).await.unwrap();

    let request = json!({"resource_id": "vpc-1", "cidr": "10.0.0.0/16"});
    let response: Value = runtime.call("provider_apply", &request).await.unwrap();
    assert_eq!(response, request);

    runtime.close().unwrap();
}

#[tokio::test]
async fn empty_request_round_trips_to_empty_object() {
    let wasm = wat::parse_str(ECHO_WAT).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = ProviderRuntime::instantiate(&wasm, 16, Duration::from_secs(5), enforcer(&[], &dir)).await.unwrap();

    // An empty JSON object serializes to two bytes, well above the bridge's
    // zero-length shortcut, so this is still an exercised round trip.
    let response: Value = runtime.call("provider_metadata", &json!({})).await.unwrap();
    assert_eq!(response, json!({}));
}

#[tokio::test]
async fn decrypt_secret_succeeds_when_capability_granted() {
    let wasm = wat::parse_str(DECRYPT_WAT).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut runtime =
        ProviderRuntime::instantiate(&wasm, 16, Duration::from_secs(5), enforcer(&["secrets:read"], &dir)).await.unwrap();

    let secret = "super-secret-value".to_string();
    let response: String = runtime.call("provider_apply", &secret).await.unwrap();
    assert_eq!(response, secret);
}

#[tokio::test]
async fn decrypt_secret_denied_without_capability_surfaces_error_payload() {
    let wasm = wat::parse_str(DECRYPT_WAT).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut runtime = ProviderRuntime::instantiate(&wasm, 16, Duration::from_secs(5), enforcer(&[], &dir)).await.unwrap();

    let response: Value = runtime.call("provider_apply", &"super-secret-value".to_string()).await.unwrap();
    assert_eq!(response, json!({"error": "denied"}));
}

#[tokio::test]
async fn instantiate_rejects_guest_missing_an_entrypoint() {
    let wasm = wat::parse_str(
        r#"(module
             (memory (export "memory") 1)
             (func (export "malloc") (param i32) (result i32) (i32.const 0))
             (func (export "free") (param i32)))"#,
    )
    .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let result = ProviderRuntime::instantiate(&wasm, 16, Duration::from_secs(5), enforcer(&[], &dir)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn registry_registers_and_lazily_instantiates_a_runtime() {
    let registry = Arc::new(ProviderRegistry::new(vec![], 16, Duration::from_secs(5)));
    let manifest = ProviderManifest::from_yaml(
        r#"
metadata:
  name: echo
  version: 1.0.0
  author: test
  license: MIT
  required_capabilities: []
schema:
  version: "1"
  resource_types: {}
entrypoint: provider.wasm
"#,
    )
    .unwrap();
    let wasm = wat::parse_str(ECHO_WAT).unwrap();
    registry.register(manifest, wasm).unwrap();

    let dir = tempfile::tempdir().unwrap();
    registry.get("echo", "latest", enforcer(&[], &dir)).await.unwrap();
    // A second resolve against the same cached runtime must not error either.
    registry.get("echo", "1.0.0", enforcer(&[], &dir)).await.unwrap();

    assert_eq!(registry.list(), vec!["echo@1.0.0".to_string()]);
    registry.close().unwrap();
}
