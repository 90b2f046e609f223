//! Orchestrator configuration (§9.3, ambient stack).
//!
//! Loaded the way the teacher's server binary loads its own config: a
//! `Default` impl carrying every numeric default the spec names, optionally
//! overridden by a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default worker pool size when `ScheduleOptions::max_parallel` is unset or ≤0.
    pub max_parallel: usize,
    pub default_unit_timeout_secs: u64,
    pub default_max_retries: u32,
    pub backoff_cap_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            default_unit_timeout_secs: 300,
            default_max_retries: 0,
            backoff_cap_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderHostConfig {
    /// Linear memory page limit, default 256 * 64 KiB (spec §4.5).
    pub memory_limit_pages: u32,
    pub default_call_timeout_secs: u64,
    pub capability_allow_list: Vec<String>,
}

impl Default for ProviderHostConfig {
    fn default() -> Self {
        Self {
            memory_limit_pages: 256,
            default_call_timeout_secs: 30,
            capability_allow_list: vec![
                "net:outbound".into(),
                "fs:temp".into(),
                "fs:read".into(),
                "fs:write".into(),
                "env:read".into(),
                "secrets:read".into(),
                "exec:micro-runner".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub policy_dirs: Vec<String>,
    pub watch_debounce_ms: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            policy_dirs: Vec::new(),
            watch_debounce_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub scheduler: SchedulerConfig,
    pub provider_host: ProviderHostConfig,
    pub policy: PolicyConfig,
}

impl OrchestratorConfig {
    /// Loads config from a TOML file if it exists, falling back to defaults.
    /// Mirrors the teacher's `main.rs`: config lives in a file next to the
    /// binary's working directory and missing-file is not an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw).map_err(|e| {
            crate::error::OpError::validation(format!("invalid config file {}: {e}", path.display()), None)
        })?;
        Ok(cfg)
    }
}

impl SchedulerConfig {
    pub fn default_unit_timeout(&self) -> Duration {
        Duration::from_secs(self.default_unit_timeout_secs)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.scheduler.max_parallel, 10);
        assert_eq!(cfg.provider_host.memory_limit_pages, 256);
        assert_eq!(cfg.scheduler.backoff_cap_secs, 60);
        assert_eq!(cfg.policy.watch_debounce_ms, 500);
    }

    #[test]
    fn missing_file_falls_back_to_default() {
        let cfg = OrchestratorConfig::load("/nonexistent/openfroyo.toml").unwrap();
        assert_eq!(cfg.scheduler.max_parallel, 10);
    }

    #[test]
    fn load_overrides_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("openfroyo.toml");
        std::fs::write(&path, "[scheduler]\nmax_parallel = 4\n").unwrap();
        let cfg = OrchestratorConfig::load(&path).unwrap();
        assert_eq!(cfg.scheduler.max_parallel, 4);
        assert_eq!(cfg.scheduler.default_max_retries, 0);
    }
}
