//! Policy Store (C5, spec §4.8 "Compiled policies live in a
//! concurrent-read-safe store").
//!
//! Grounded on the teacher's `ServiceRegistry` (`RwLock<HashMap<...>>`,
//! exclusive write on mutation, shared read on lookup) and on `PluginManager`
//! for the load-from-paths/reload/enable/disable lifecycle surface.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{OpError, Result};
use crate::policy::compiler::CompiledPolicy;
use crate::policy::model::Policy;

/// Read-only during `evaluate*`; `reload`/`load_from_paths` take exclusive
/// access, rebuild, then release (spec §5 "Policy store").
pub struct PolicyStore {
    policies: RwLock<HashMap<String, CompiledPolicy>>,
    watch_paths: RwLock<Vec<PathBuf>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self {
            policies: RwLock::new(HashMap::new()),
            watch_paths: RwLock::new(Vec::new()),
        }
    }

    pub fn insert(&self, compiled: CompiledPolicy) {
        let name = compiled.policy.name.clone();
        self.policies.write().insert(name, compiled);
    }

    pub fn list(&self) -> Vec<Policy> {
        self.policies.read().values().map(|c| c.policy.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<CompiledPolicy> {
        self.policies.read().get(name).cloned()
    }

    pub fn enabled(&self) -> Vec<CompiledPolicy> {
        self.policies.read().values().filter(|c| c.policy.enabled).cloned().collect()
    }

    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut policies = self.policies.write();
        let compiled = policies
            .get_mut(name)
            .ok_or_else(|| OpError::validation(format!("policy '{name}' is not registered"), None))?;
        compiled.policy.enabled = enabled;
        Ok(())
    }

    /// Re-parses every declarative policy's rule body in place and
    /// re-scans the configured watch paths. Enabled/disabled state is
    /// preserved unless `load-from-paths` reintroduces the policy from
    /// disk with a different default.
    pub fn reload(&self) -> Result<usize> {
        let paths: Vec<PathBuf> = self.watch_paths.read().clone();
        let mut total = 0;
        for path in paths {
            total += self.load_from_paths(&[path])?;
        }
        Ok(total)
    }

    /// Scans files ending in `.rego`/`.rule` (declarative rule extension)
    /// or `.json` (policy-definition extension), compiling each into the
    /// store (spec §4.8 "load-from-paths").
    pub fn load_from_paths(&self, paths: &[impl AsRef<Path>]) -> Result<usize> {
        let mut loaded = 0;
        let mut watch_paths = self.watch_paths.write();
        for path in paths {
            let path = path.as_ref();
            if !watch_paths.contains(&path.to_path_buf()) {
                watch_paths.push(path.to_path_buf());
            }
            if path.is_dir() {
                for entry in std::fs::read_dir(path)? {
                    let entry = entry?;
                    if let Some(policy) = load_one(&entry.path())? {
                        let prior_enabled = self.policies.read().get(&policy.name).map(|c| c.policy.enabled);
                        let mut policy = policy;
                        if let Some(enabled) = prior_enabled {
                            policy.enabled = enabled;
                        }
                        self.insert(CompiledPolicy::compile(policy)?);
                        loaded += 1;
                    }
                }
            } else if let Some(policy) = load_one(path)? {
                self.insert(CompiledPolicy::compile(policy)?);
                loaded += 1;
            }
        }
        Ok(loaded)
    }

    /// Spawns a filesystem watcher with a 500 ms debounce that reloads the
    /// store on any change under a watched path (spec §4.8 "watching is
    /// implemented via filesystem notifications with a 500 ms debounce").
    pub fn watch(self: &Arc<Self>, debounce: Duration) -> Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| OpError::internal(format!("failed to start policy file watcher: {e}"), false))?;

        for path in self.watch_paths.read().iter() {
            if let Err(e) = watcher.watch(path, RecursiveMode::NonRecursive) {
                warn!(path = %path.display(), error = %e, "failed to watch policy path");
            }
        }

        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let Some(_first) = rx.recv().await else { break };
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                match store.reload() {
                    Ok(n) => info!(reloaded = n, "policy store reloaded after filesystem change"),
                    Err(e) => warn!(error = %e, "policy reload failed"),
                }
            }
        });

        Ok(watcher)
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn load_one(path: &Path) -> Result<Option<Policy>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "rego" | "rule" => {
            let body = std::fs::read_to_string(path)?;
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("unnamed").to_string();
            debug!(path = %path.display(), "loading declarative policy file");
            Ok(Some(Policy::new(name, body, crate::policy::model::Severity::Warning)))
        }
        "json" => {
            let raw = std::fs::read_to_string(path)?;
            let policy: Policy = serde_json::from_str(&raw)?;
            debug!(path = %path.display(), "loading JSON policy definition");
            Ok(Some(policy))
        }
        _ => Ok(None),
    }
}
