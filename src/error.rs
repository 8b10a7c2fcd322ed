//! Crate-wide error taxonomy.
//!
//! Components return their own local error enums (`VfioError`,
//! `NetworkError`, `HypervisorError`, ...); at the instance-manager
//! boundary those are classified into [`HypemanError`], which is the only
//! error type a caller outside this crate should need to match on.

use std::fmt;

/// Which kind of entity a [`HypemanError::NotFound`]/[`HypemanError::
/// AlreadyExists`]/[`HypemanError::InUse`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Instance,
    Device,
    Volume,
    Ingress,
    Image,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Instance => "instance",
            EntityKind::Device => "device",
            EntityKind::Volume => "volume",
            EntityKind::Ingress => "ingress",
            EntityKind::Image => "image",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HypemanError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: String },

    #[error("{kind} with key {key} already exists")]
    AlreadyExists { kind: EntityKind, key: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("{kind} {id} in use: {reason}")]
    InUse {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("config validation failed: {message}")]
    ConfigValidationFailed { message: String, port_in_use: bool },

    #[error("ambiguous prefix {prefix:?}: matches {}", candidates.join(", "))]
    Ambiguous {
        prefix: String,
        candidates: Vec<String>,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl HypemanError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        HypemanError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: EntityKind, key: impl Into<String>) -> Self {
        HypemanError::AlreadyExists {
            kind,
            key: key.into(),
        }
    }

    pub fn in_use(kind: EntityKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        HypemanError::InUse {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }

    /// True for the kinds `spec.md` §7 calls out as caller-retriable.
    pub fn is_transient(&self) -> bool {
        matches!(self, HypemanError::Transient(_))
    }
}

impl From<std::io::Error> for HypemanError {
    fn from(e: std::io::Error) -> Self {
        HypemanError::Internal(e.to_string())
    }
}

impl From<serde_json::Error> for HypemanError {
    fn from(e: serde_json::Error) -> Self {
        HypemanError::Internal(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, HypemanError>;
