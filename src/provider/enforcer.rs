//! Capability Enforcer (C1, spec §4.7).
//!
//! Owns the granted capability set and the resources privileged host
//! functions need (HTTP client, temp directory, secret decryptor). Every
//! privileged primitive consults `has(cap)` before any side effect, and
//! additionally applies fixed deny-lists regardless of capability.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::error::{OpError, Result};

/// Pluggable HTTP transport so tests never touch the network; production
/// wiring supplies a real client (spec §4.7: "HTTP client with timeout").
pub type HttpClient = Arc<dyn Fn(&str, &str) -> Result<Vec<u8>> + Send + Sync>;

/// The fixed set of capability tokens a provider may be bound to (spec §3).
pub const ALL_CAPABILITIES: &[&str] = &[
    "net:outbound",
    "fs:temp",
    "fs:read",
    "fs:write",
    "env:read",
    "secrets:read",
    "exec:micro-runner",
];

const SENSITIVE_READ_SUBSTRINGS: &[&str] = &[
    "/etc/shadow",
    "/etc/passwd",
    "/root/.ssh",
    "/.aws/credentials",
    "/.kube/config",
];

const SENSITIVE_WRITE_PREFIXES: &[&str] = &["/etc", "/root", "/sys", "/proc", "/dev"];

const SENSITIVE_ENV_SUBSTRINGS: &[&str] = &[
    "SECRET",
    "TOKEN",
    "PASSWORD",
    "API_KEY",
    "AWS_SECRET_ACCESS_KEY",
    "GITHUB_TOKEN",
    "GITLAB_TOKEN",
    "SSH_PRIVATE_KEY",
    "DATABASE_PASSWORD",
    "AWS_SESSION_TOKEN",
];

/// Capability-gated enforcer bound to one provider instance. Stateless
/// beyond its capability set and temp directory; safe for concurrent
/// host-function calls (spec §5).
pub struct CapabilityEnforcer {
    granted: HashSet<String>,
    temp_dir: PathBuf,
    http_client: Option<HttpClient>,
}

impl CapabilityEnforcer {
    pub fn new(granted: impl IntoIterator<Item = String>, temp_dir: PathBuf) -> Self {
        Self {
            granted: granted.into_iter().collect(),
            temp_dir,
            http_client: None,
        }
    }

    pub fn with_http_client(mut self, client: HttpClient) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn has(&self, cap: &str) -> bool {
        self.granted.contains(cap)
    }

    fn require(&self, cap: &str) -> Result<()> {
        if !self.has(cap) {
            return Err(OpError::capability_denied(
                format!("capability '{cap}' not granted to this provider instance"),
                None,
            ));
        }
        Ok(())
    }

    /// Resolves a requested temp-file name to a canonical path and rejects
    /// any attempt to escape the enforcer's temp directory.
    fn resolve_temp_path(&self, name: &str) -> Result<PathBuf> {
        let candidate = self.temp_dir.join(name);
        let canonical_dir = dunce_canonicalize(&self.temp_dir)?;
        // The file need not exist yet for a write; canonicalize its parent
        // and re-join the file name to get a stable, comparable path.
        let canonical = match std::fs::canonicalize(&candidate) {
            Ok(p) => p,
            Err(_) => {
                let parent = candidate.parent().unwrap_or(&self.temp_dir).to_path_buf();
                let canonical_parent = dunce_canonicalize(&parent)?;
                canonical_parent.join(candidate.file_name().unwrap_or_default())
            }
        };
        if !canonical.starts_with(&canonical_dir) {
            return Err(OpError::capability_denied(
                format!("temp path '{name}' escapes the sandboxed temp directory"),
                None,
            ));
        }
        Ok(canonical)
    }

    pub fn write_temp_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.require("fs:temp")?;
        let path = self.resolve_temp_path(name)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn read_temp_file(&self, name: &str) -> Result<Vec<u8>> {
        self.require("fs:temp")?;
        let path = self.resolve_temp_path(name)?;
        Ok(std::fs::read(path)?)
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        self.require("fs:read")?;
        if SENSITIVE_READ_SUBSTRINGS.iter().any(|s| path.contains(s)) {
            warn!(path, "denied read of sensitive path");
            return Err(OpError::capability_denied(format!("read of sensitive path '{path}' denied"), None));
        }
        Ok(std::fs::read(path)?)
    }

    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        self.require("fs:write")?;
        if SENSITIVE_WRITE_PREFIXES.iter().any(|p| path.starts_with(p)) {
            warn!(path, "denied write to sensitive path");
            return Err(OpError::capability_denied(format!("write to sensitive path '{path}' denied"), None));
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn read_env(&self, key: &str) -> Result<Option<String>> {
        self.require("env:read")?;
        let upper = key.to_uppercase();
        if SENSITIVE_ENV_SUBSTRINGS.iter().any(|s| upper.contains(s)) {
            warn!(key, "denied read of sensitive env var");
            return Err(OpError::capability_denied(format!("read of sensitive env var '{key}' denied"), None));
        }
        Ok(std::env::var(key).ok())
    }

    pub fn allow_http_request(&self) -> Result<()> {
        self.require("net:outbound")
    }

    pub fn http_request(&self, url: &str, method: &str) -> Result<Vec<u8>> {
        self.allow_http_request()?;
        let client = self
            .http_client
            .as_ref()
            .ok_or_else(|| OpError::provider_failed("no HTTP client configured for this provider host", None))?;
        client(url, method)
    }

    pub fn decrypt_secret(&self, decryptor: &dyn Fn(&[u8]) -> Result<Vec<u8>>, encrypted: &[u8]) -> Result<Vec<u8>> {
        self.require("secrets:read")?;
        decryptor(encrypted)
    }

    pub fn cleanup(&self) -> Result<()> {
        if self.temp_dir.exists() {
            std::fs::remove_dir_all(&self.temp_dir)?;
        }
        Ok(())
    }
}

fn dunce_canonicalize(path: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(path)?;
    Ok(std::fs::canonicalize(path)?)
}
