//! Provider manifest parsing and checksum validation (spec §3, §6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OpError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,
    pub version: String,
    pub author: String,
    pub license: String,
    #[serde(default)]
    pub description: String,
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTypeSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub config_schema: serde_json::Value,
    pub state_schema: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSchema {
    pub version: String,
    pub resource_types: HashMap<String, ResourceTypeSchema>,
}

/// Provider manifest: metadata + schema + entrypoint + checksum (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderManifest {
    pub metadata: ManifestMetadata,
    pub schema: ManifestSchema,
    pub entrypoint: String,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl ProviderManifest {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let manifest: ProviderManifest = serde_yaml::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(OpError::validation("manifest metadata.name is required", None));
        }
        if self.metadata.version.is_empty() {
            return Err(OpError::validation(
                format!("manifest '{}' is missing metadata.version", self.metadata.name),
                None,
            ));
        }
        if self.entrypoint.is_empty() {
            return Err(OpError::validation(
                format!("manifest '{}' is missing entrypoint", self.metadata.name),
                None,
            ));
        }
        Ok(())
    }

    /// `name@version` registry key.
    pub fn key(&self) -> String {
        format!("{}@{}", self.metadata.name, self.metadata.version)
    }

    /// Verifies the artifact's computed digest matches the declared checksum,
    /// when one is present (spec §3 invariant, §4.4 "Checksum gate").
    pub fn verify_checksum(&self, wasm_bytes: &[u8]) -> Result<()> {
        let Some(expected) = &self.checksum else {
            return Ok(());
        };
        let mut hasher = Sha256::new();
        hasher.update(wasm_bytes);
        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(OpError::checksum_mismatch(
                format!(
                    "provider '{}' checksum mismatch: expected {expected}, computed {actual}",
                    self.key()
                ),
                None,
            ));
        }
        Ok(())
    }
}
