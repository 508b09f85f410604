//! Error types for the Polaris identity core.
//!
//! All errors are strongly typed using thiserror. Each layer raises its own
//! enum and everything converges into [`PolarisError`], which callers can
//! match on or flatten into an [`ErrorReport`] for the outward boundary.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;

/// Bad input: always surfaced, never retried, never partially applied.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Invalid identifier '{id}': {reason}")]
    InvalidIdentifier {
        id: String,
        reason: String,
    },

    #[error("Identifier '{id}' is not a canonical polaris id")]
    NotCanonical {
        id: String,
    },

    #[error("Unknown entity type '{value}' (expected one of person, group, song, track, release, master, label)")]
    UnknownEntityType {
        value: String,
    },

    #[error("Entity '{id}' has type {actual}, expected {expected}")]
    WrongEntityType {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("Merge requires at least one absorbed id")]
    EmptyMergeBatch,

    #[error("Entity '{id}' cannot be merged into itself")]
    SelfMerge {
        id: String,
    },

    #[error("Alias '{alias}' already points at '{existing}', refusing to re-point it at '{requested}'")]
    AliasConflict {
        alias: String,
        existing: String,
        requested: String,
    },

    #[error("Confidence value {value} is out of range [0.0, 1.0]")]
    ConfidenceOutOfRange {
        value: f64,
    },

    #[error("Malformed event payload: {reason}")]
    MalformedPayload {
        reason: String,
    },

    #[error("Malformed {event_type} body: {reason}")]
    MalformedBody {
        event_type: String,
        reason: String,
    },
}

/// A backend contract breach. Fatal: the surrounding transaction is rolled back.
#[derive(Debug, Error)]
pub enum IntegrityViolation {
    #[error("{count} edge(s) still carry the pending-retarget marker after merge")]
    LeftoverRetargetEdges {
        count: usize,
    },

    #[error("Tombstone '{id}' still has {count} live edge(s)")]
    TombstoneHasEdges {
        id: String,
        count: usize,
    },

    #[error("Type mismatch: survivor '{survivor}' is a {survivor_type}, absorbed '{absorbed}' is a {absorbed_type}")]
    TypeMismatch {
        survivor: String,
        survivor_type: String,
        absorbed: String,
        absorbed_type: String,
    },

    #[error("Tombstone chain starting at '{id}' contains a cycle")]
    TombstoneCycle {
        id: String,
    },

    #[error("Resolution of '{id}' exceeded {limit} hops")]
    HopLimitExceeded {
        id: String,
        limit: usize,
    },

    #[error("Node '{id}' is malformed: {reason}")]
    MalformedNode {
        id: String,
        reason: String,
    },
}

/// Something the caller referenced does not exist.
#[derive(Debug, Error)]
pub enum NotFoundError {
    #[error("Entity not found: {id}")]
    Entity {
        id: String,
    },

    #[error("Alias target not found: alias '{alias}' -> '{target}'")]
    AliasTarget {
        alias: String,
        target: String,
    },

    #[error("External mapping not found: {key}")]
    Mapping {
        key: String,
    },

    #[error("Event not found: {hash}")]
    Event {
        hash: String,
    },

    #[error("Claim not found: {id}")]
    Claim {
        id: String,
    },
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors raised by the ingestion runtime's worker pool.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Ingest queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },

    #[error("Ingest workers disconnected")]
    Disconnected,

    #[error("Ingest did not complete within {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Failed to spawn ingest worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Top-level error type for the crate.
#[derive(Debug, Error)]
pub enum PolarisError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] IntegrityViolation),

    #[error("Not found: {0}")]
    NotFound(#[from] NotFoundError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    IntegrityViolation,
    NotFound,
    Storage,
    Config,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::IntegrityViolation => "integrity_violation",
            Self::NotFound => "not_found",
            Self::Storage => "storage",
            Self::Config => "config",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl PolarisError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the machine-readable kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Integrity(_) => ErrorKind::IntegrityViolation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) => ErrorKind::Storage,
            Self::Config(_) => ErrorKind::Config,
            Self::Runtime(_) => ErrorKind::Unavailable,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an integrity violation.
    #[must_use]
    pub const fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if re-submitting the same request may succeed.
    ///
    /// Nothing inside this crate retries; this is advice for the caller.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Runtime(e) => matches!(e, RuntimeError::QueueFull { .. } | RuntimeError::Timeout { .. }),
            Self::Validation(_)
            | Self::Integrity(_)
            | Self::NotFound(_)
            | Self::Config(_)
            | Self::Internal { .. } => false,
        }
    }

    /// Flattens this error into its outward form.
    ///
    /// Storage and internal errors are reported generically; their details stay in the logs.
    #[must_use]
    pub fn report(&self) -> ErrorReport {
        let message = match self {
            Self::Storage(_) => "storage backend failure".to_string(),
            Self::Internal { .. } => "internal error".to_string(),
            other => other.to_string(),
        };
        ErrorReport {
            kind: self.kind(),
            message,
        }
    }
}

/// Structured error returned across the crate boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Result type alias for Polaris operations.
pub type PolarisResult<T> = Result<T, PolarisError>;
