//! Typed error surface shared by every component (C9 Error Classifier).
//!
//! `OpError` is the single error type that crosses component boundaries.
//! Each variant is pre-classified per spec §4.3/§7: callers never have to
//! re-derive retryability from a message string.

use thiserror::Error;

/// A single typed error with a fixed, pre-classified set of discriminants.
#[derive(Error, Debug)]
pub enum OpError {
    /// Input failed structural or semantic validation. Never retryable.
    #[error("validation error [{code}]: {message}")]
    Validation {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Authentication/authorization failure against a remote system. Never retryable.
    #[error("auth error [{code}]: {message}")]
    Auth {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Produced only by the scheduler's own gating logic, never by a provider.
    #[error("dependency failed [{code}]: {message}")]
    DependencyFailed {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// A deadline was exhausted. Retryable unless the unit's own timeout is
    /// the terminal condition (the scheduler decides that; the classifier
    /// only says "retryable").
    #[error("timeout [{code}]: {message}")]
    Timeout {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Provider signalled it was rate-limited. Retryable with a long base backoff.
    #[error("throttled [{code}]: {message}")]
    Throttled {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Provider signalled a conflicting concurrent mutation. Retryable with a
    /// medium base backoff.
    #[error("conflict [{code}]: {message}")]
    Conflict {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Generic provider failure that doesn't fit a more specific class.
    /// Retryable with the default base backoff.
    #[error("provider failed [{code}]: {message}")]
    ProviderFailed {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
        #[source]
        cause: Option<Box<OpError>>,
    },

    /// The `require`/`order` sub-graph of a plan contains a cycle.
    #[error("cycle detected [{code}]: {message}")]
    CycleDetected {
        code: &'static str,
        message: String,
        nodes: Vec<String>,
    },

    /// A host call was attempted without the capability it needs.
    #[error("capability denied [{code}]: {message}")]
    CapabilityDenied {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// A provider artifact's computed digest didn't match its manifest checksum.
    #[error("checksum mismatch [{code}]: {message}")]
    ChecksumMismatch {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
    },

    /// Catch-all for conditions that don't map to a specific classification.
    /// Retryability is context-dependent and carried explicitly.
    #[error("internal error [{code}]: {message}")]
    Internal {
        code: &'static str,
        message: String,
        resource_id: Option<String>,
        retryable: bool,
    },
}

/// The coarse classification used by the scheduler's backoff calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent,
    Retryable,
    Throttled,
    Conflict,
}

impl OpError {
    pub fn code(&self) -> &'static str {
        match self {
            OpError::Validation { code, .. }
            | OpError::Auth { code, .. }
            | OpError::DependencyFailed { code, .. }
            | OpError::Timeout { code, .. }
            | OpError::Throttled { code, .. }
            | OpError::Conflict { code, .. }
            | OpError::ProviderFailed { code, .. }
            | OpError::CycleDetected { code, .. }
            | OpError::CapabilityDenied { code, .. }
            | OpError::ChecksumMismatch { code, .. }
            | OpError::Internal { code, .. } => code,
        }
    }

    pub fn resource_id(&self) -> Option<&str> {
        match self {
            OpError::Validation { resource_id, .. }
            | OpError::Auth { resource_id, .. }
            | OpError::DependencyFailed { resource_id, .. }
            | OpError::Timeout { resource_id, .. }
            | OpError::Throttled { resource_id, .. }
            | OpError::Conflict { resource_id, .. }
            | OpError::ProviderFailed { resource_id, .. }
            | OpError::CapabilityDenied { resource_id, .. }
            | OpError::ChecksumMismatch { resource_id, .. }
            | OpError::Internal { resource_id, .. } => resource_id.as_deref(),
            OpError::CycleDetected { .. } => None,
        }
    }

    /// The classification used to pick a retry/backoff strategy (§4.3).
    pub fn class(&self) -> ErrorClass {
        match self {
            OpError::Throttled { .. } => ErrorClass::Throttled,
            OpError::Conflict { .. } => ErrorClass::Conflict,
            OpError::Timeout { .. } | OpError::ProviderFailed { .. } => ErrorClass::Retryable,
            OpError::Internal { retryable, .. } => {
                if *retryable {
                    ErrorClass::Retryable
                } else {
                    ErrorClass::Permanent
                }
            }
            OpError::Validation { .. }
            | OpError::Auth { .. }
            | OpError::DependencyFailed { .. }
            | OpError::CycleDetected { .. }
            | OpError::CapabilityDenied { .. }
            | OpError::ChecksumMismatch { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self.class(), ErrorClass::Permanent)
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self.class(), ErrorClass::Throttled)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict)
    }

    pub fn provider_failed(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::ProviderFailed {
            code: "PROVIDER_FAILED",
            message: message.into(),
            resource_id,
            cause: None,
        }
    }

    pub fn validation(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::Validation {
            code: "VALIDATION",
            message: message.into(),
            resource_id,
        }
    }

    pub fn dependency_failed(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::DependencyFailed {
            code: "DEPENDENCY_FAILED",
            message: message.into(),
            resource_id,
        }
    }

    pub fn timeout(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::Timeout {
            code: "TIMEOUT",
            message: message.into(),
            resource_id,
        }
    }

    pub fn capability_denied(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::CapabilityDenied {
            code: "CAPABILITY_DENIED",
            message: message.into(),
            resource_id,
        }
    }

    pub fn checksum_mismatch(message: impl Into<String>, resource_id: Option<String>) -> Self {
        OpError::ChecksumMismatch {
            code: "CHECKSUM_MISMATCH",
            message: message.into(),
            resource_id,
        }
    }

    pub fn cycle_detected(nodes: Vec<String>) -> Self {
        OpError::CycleDetected {
            code: "CYCLE_DETECTED",
            message: format!("cycle detected among nodes: {}", nodes.join(" -> ")),
            nodes,
        }
    }

    pub fn internal(message: impl Into<String>, retryable: bool) -> Self {
        OpError::Internal {
            code: "INTERNAL",
            message: message.into(),
            resource_id: None,
            retryable,
        }
    }
}

impl From<serde_json::Error> for OpError {
    fn from(e: serde_json::Error) -> Self {
        OpError::validation(format!("json error: {e}"), None)
    }
}

impl From<serde_yaml::Error> for OpError {
    fn from(e: serde_yaml::Error) -> Self {
        OpError::validation(format!("yaml error: {e}"), None)
    }
}

impl From<std::io::Error> for OpError {
    fn from(e: std::io::Error) -> Self {
        OpError::internal(format!("io error: {e}"), false)
    }
}

pub type Result<T> = std::result::Result<T, OpError>;
