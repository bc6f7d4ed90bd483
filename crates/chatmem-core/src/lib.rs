pub mod conversation;

pub use conversation::{conversation_key, ContextMessage, Conversation, Message, Metadata, Role};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage backend unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Transient storage error: {0}")]
    Transient(String),

    #[error("Storage operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether a single retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Which storage variant a store ended up running against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Redis => write!(f, "redis"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// Result of a backend liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendHealth {
    Ok,
    Degraded,
    Unavailable,
}

impl fmt::Display for BackendHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendHealth::Ok => write!(f, "ok"),
            BackendHealth::Degraded => write!(f, "degraded"),
            BackendHealth::Unavailable => write!(f, "unavailable"),
        }
    }
}
