//! Micro-runner wire envelope types (spec §6, expanded §9.6).
//!
//! The transport itself (a newline-delimited JSON stream over SSH/SFTP) is an
//! external collaborator and out of scope; these types exist so the envelope
//! shape is pinned down and round-trip tested.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerFrameType {
    Ready,
    Cmd,
    Event,
    Done,
    Error,
    Exit,
}

/// Envelope every frame conforms to: `{type, timestamp, data}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerEnvelope {
    #[serde(rename = "type")]
    pub frame_type: RunnerFrameType,
    pub timestamp: i64,
    pub data: Value,
}

/// Maximum permitted frame size (spec §6: "Max frame size ≥ 10 MiB").
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyData {
    pub version: String,
    pub platform: String,
    pub arch: String,
    pub pid: u32,
    pub capabilities: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdData {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    pub timeout: u64,
    pub params: Value,
}

impl CmdData {
    /// Validates spec §6: `timeout` positive, `id` non-empty, `params` non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(OpError::validation("runner command id must be non-empty", None));
        }
        if self.timeout == 0 {
            return Err(OpError::validation(
                format!("runner command '{}' timeout must be positive", self.id),
                Some(self.id.clone()),
            ));
        }
        let params_empty = match &self.params {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            Value::Array(a) => a.is_empty(),
            _ => false,
        };
        if params_empty {
            return Err(OpError::validation(
                format!("runner command '{}' params must be non-empty", self.id),
                Some(self.id.clone()),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub command_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoneData {
    pub command_id: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub command_id: String,
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips() {
        let env = RunnerEnvelope {
            frame_type: RunnerFrameType::Cmd,
            timestamp: 1700000000,
            data: serde_json::to_value(CmdData {
                id: "c1".into(),
                command_type: "apply".into(),
                timeout: 30,
                params: serde_json::json!({"k": "v"}),
            })
            .unwrap(),
        };
        let encoded = serde_json::to_string(&env).unwrap();
        let decoded: RunnerEnvelope = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.frame_type, RunnerFrameType::Cmd);
        assert_eq!(decoded.timestamp, 1700000000);
    }

    #[test]
    fn cmd_data_rejects_zero_timeout() {
        let cmd = CmdData {
            id: "c1".into(),
            command_type: "apply".into(),
            timeout: 0,
            params: serde_json::json!({"k": "v"}),
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn cmd_data_rejects_empty_params() {
        let cmd = CmdData {
            id: "c1".into(),
            command_type: "apply".into(),
            timeout: 5,
            params: serde_json::json!({}),
        };
        assert!(cmd.validate().is_err());
    }

    #[test]
    fn cmd_data_rejects_empty_id() {
        let cmd = CmdData {
            id: String::new(),
            command_type: "apply".into(),
            timeout: 5,
            params: serde_json::json!({"k": 1}),
        };
        assert!(cmd.validate().is_err());
    }
}
