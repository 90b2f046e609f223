//! Provider Registry (C4, spec §4.4).
//!
//! Keys providers `name@version`, lazily instantiates a [`ProviderRuntime`]
//! on first `get`, and caches it. Grounded on the teacher's
//! `ServiceRegistry` (`RwLock<HashMap<...>>`, create-on-first-resolve) and
//! `PluginManager`-style manifest bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OpError, Result};
use crate::provider::enforcer::CapabilityEnforcer;
use crate::provider::manifest::ProviderManifest;
use crate::provider::runtime::ProviderRuntime;

/// A live, instantiated runtime shared across every caller resolving the
/// same provider key. Calls are serialized through the mutex — a
/// `wasmtime::Store` is not safe to drive from two callers at once (spec
/// §56 Ownership summary: "handed-out provider references are shared").
pub type ProviderHandle = Arc<Mutex<ProviderRuntime>>;

struct RegisteredProvider {
    manifest: ProviderManifest,
    wasm_bytes: Vec<u8>,
    runtime: Option<ProviderHandle>,
}

/// Registers, resolves, and caches provider runtimes (spec §4.4, §5
/// "Provider registry" concurrency notes).
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, RegisteredProvider>>,
    capability_allow_list: Vec<String>,
    memory_limit_pages: u32,
    call_timeout: Duration,
}

impl ProviderRegistry {
    pub fn new(capability_allow_list: Vec<String>, memory_limit_pages: u32, call_timeout: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capability_allow_list,
            memory_limit_pages,
            call_timeout,
        }
    }

    /// Rejects a manifest if it requests a capability outside the
    /// deployment's allow-list (spec §4.4 "Capability allow-list").
    pub fn validate_capabilities(&self, caps: &[String]) -> Result<()> {
        for cap in caps {
            if !self.capability_allow_list.contains(cap) {
                return Err(OpError::capability_denied(
                    format!("capability '{cap}' is not in the deployment allow-list"),
                    None,
                ));
            }
        }
        Ok(())
    }

    pub fn register(&self, manifest: ProviderManifest, wasm_bytes: Vec<u8>) -> Result<()> {
        self.validate_capabilities(&manifest.metadata.required_capabilities)?;
        let key = manifest.key();
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return Err(OpError::validation(format!("provider '{key}' is already registered"), None));
        }
        entries.insert(
            key.clone(),
            RegisteredProvider {
                manifest,
                wasm_bytes,
                runtime: None,
            },
        );
        info!(provider = %key, "registered provider");
        Ok(())
    }

    /// Reads a manifest + wasm artifact from `manifest_path`'s sibling
    /// entrypoint file, verifying the checksum before registration (spec
    /// §4.4 "Checksum gate").
    pub fn register_from_path(&self, manifest_path: impl AsRef<std::path::Path>) -> Result<()> {
        let manifest_path = manifest_path.as_ref();
        let raw = std::fs::read_to_string(manifest_path)?;
        let manifest = ProviderManifest::from_yaml(&raw)?;
        let wasm_path = manifest_path
            .parent()
            .unwrap_or_else(|| std::path::Path::new("."))
            .join(&manifest.entrypoint);
        let wasm_bytes = std::fs::read(&wasm_path)?;
        manifest.verify_checksum(&wasm_bytes)?;
        self.register(manifest, wasm_bytes)
    }

    /// Registers every `*.yaml`/`*.yml` manifest found directly under `dir`.
    pub fn scan_directory(&self, dir: impl AsRef<std::path::Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut registered = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_manifest = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml"));
            if !is_manifest {
                continue;
            }
            match self.register_from_path(&path) {
                Ok(()) => registered += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "skipping invalid provider manifest"),
            }
        }
        Ok(registered)
    }

    pub fn unregister(&self, name: &str, version: &str) -> Result<()> {
        let key = format!("{name}@{version}");
        let mut entries = self.entries.write();
        entries
            .remove(&key)
            .ok_or_else(|| OpError::validation(format!("provider '{key}' is not registered"), None))?;
        info!(provider = %key, "unregistered provider");
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    /// Resolves a `name`/constraint pair to the single matching key,
    /// implementing the four constraint forms of spec §4.4. Versions are
    /// compared with `semver` when every candidate parses as one, falling
    /// back to lexicographic order otherwise (spec §4.4 permits either).
    fn resolve_key(&self, name: &str, version_constraint: &str) -> Result<String> {
        let entries = self.entries.read();
        let mut candidates: Vec<&str> = entries
            .keys()
            .filter_map(|k| {
                let (n, v) = k.split_once('@')?;
                (n == name).then_some(v)
            })
            .collect();
        sort_versions(&mut candidates);

        let matched = if version_constraint.is_empty() || version_constraint == "latest" {
            candidates.last().copied()
        } else if let Some(rest) = version_constraint.strip_prefix('~') {
            let prefix = minor_prefix(rest);
            max_version(candidates.into_iter().filter(|v| v.starts_with(&prefix)).collect())
        } else if let Some(rest) = version_constraint.strip_prefix('^') {
            let prefix = major_prefix(rest);
            max_version(candidates.into_iter().filter(|v| v.starts_with(&prefix)).collect())
        } else {
            candidates.into_iter().find(|v| *v == version_constraint)
        };

        matched
            .map(|v| format!("{name}@{v}"))
            .ok_or_else(|| OpError::validation(format!("no provider matches '{name}' @ '{version_constraint}'"), None))
    }

    /// Returns the (possibly newly instantiated) runtime handle for `name`
    /// under `version_constraint`, caching it for subsequent calls (spec
    /// §4.4 "Lazy instantiation") and handing out a clone of the same
    /// `Arc<Mutex<..>>` to every caller, so they share the one live
    /// instance rather than each paying for their own (spec §56 Ownership
    /// summary).
    pub async fn get(self: &Arc<Self>, name: &str, version_constraint: &str, enforcer: Arc<CapabilityEnforcer>) -> Result<ProviderHandle> {
        let key = self.resolve_key(name, version_constraint)?;
        {
            let entries = self.entries.read();
            if let Some(handle) = entries.get(&key).and_then(|e| e.runtime.clone()) {
                return Ok(handle);
            }
        }
        let wasm_bytes = {
            let entries = self.entries.read();
            entries
                .get(&key)
                .ok_or_else(|| OpError::validation(format!("provider '{key}' is not registered"), None))?
                .wasm_bytes
                .clone()
        };
        let runtime = ProviderRuntime::instantiate(&wasm_bytes, self.memory_limit_pages, self.call_timeout, enforcer).await?;
        let handle: ProviderHandle = Arc::new(Mutex::new(runtime));

        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&key)
            .ok_or_else(|| OpError::validation(format!("provider '{key}' is not registered"), None))?;
        // Another task may have instantiated and cached a runtime while we
        // were awaiting instantiation; keep whichever handle got there
        // first so every caller ends up sharing exactly one runtime.
        if let Some(existing) = entry.runtime.clone() {
            return Ok(existing);
        }
        entry.runtime = Some(handle.clone());
        debug!(provider = %key, "instantiated and cached provider runtime");
        Ok(handle)
    }

    pub fn manifest(&self, name: &str, version_constraint: &str) -> Result<ProviderManifest> {
        let key = self.resolve_key(name, version_constraint)?;
        let entries = self.entries.read();
        entries
            .get(&key)
            .map(|e| e.manifest.clone())
            .ok_or_else(|| OpError::validation(format!("provider '{key}' is not registered"), None))
    }

    /// Best-effort shutdown: a handle still shared with an in-flight caller
    /// is left for that caller to drop, and simply skipped here.
    pub fn close(&self) -> Result<()> {
        let mut entries = self.entries.write();
        for (key, entry) in entries.drain() {
            if let Some(handle) = entry.runtime {
                match Arc::try_unwrap(handle) {
                    Ok(mutex) => {
                        if let Err(e) = mutex.into_inner().close() {
                            warn!(provider = %key, error = %e, "error closing provider runtime");
                        }
                    }
                    Err(_) => {
                        warn!(provider = %key, "provider runtime still has outstanding references; skipping close");
                    }
                }
            }
        }
        Ok(())
    }
}

fn sort_versions(versions: &mut [&str]) {
    if versions.iter().all(|v| semver::Version::parse(v).is_ok()) {
        versions.sort_by_key(|v| semver::Version::parse(v).unwrap());
    } else {
        versions.sort();
    }
}

fn max_version(mut versions: Vec<&str>) -> Option<&str> {
    sort_versions(&mut versions);
    versions.last().copied()
}

fn minor_prefix(version: &str) -> String {
    let parts: Vec<&str> = version.splitn(3, '.').collect();
    match parts.as_slice() {
        [maj, min, ..] => format!("{maj}.{min}."),
        [maj] => format!("{maj}."),
        [] => String::new(),
    }
}

fn major_prefix(version: &str) -> String {
    let major = version.split('.').next().unwrap_or(version);
    format!("{major}.")
}
