//! Error types for plandoc_core operations.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Name of the offending field (camelCase, as stored on disk).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl FieldError {
    /// Creates a field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Why a lock could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The lock stayed contended for the whole acquire timeout.
    Timeout {
        /// How long the caller was willing to wait.
        waited: Duration,
    },
    /// The lock manager is shutting down or already shut down.
    Disposed,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited } => write!(f, "timeout after {}ms", waited.as_millis()),
            Self::Disposed => write!(f, "lock manager disposed"),
        }
    }
}

/// Core error type for plandoc_core operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Record with the given id does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind (entity type, "link", "plan", ...)
        kind: String,
        /// The missing id
        id: String,
    },

    /// Optimistic concurrency check failed.
    #[error("version conflict on {id}: expected version {expected}, found {actual}")]
    VersionConflict {
        /// Entity id
        id: String,
        /// Version supplied by the caller
        expected: u64,
        /// Version currently stored
        actual: u64,
    },

    /// A uniqueness constraint would be violated.
    #[error("{kind} already exists: {key}")]
    DuplicateKey {
        /// Record kind
        kind: String,
        /// The conflicting key (id or composite key)
        key: String,
    },

    /// Input failed validation.
    #[error("validation failed: {}", join_field_errors(.errors))]
    Validation {
        /// Every field that failed, in input order
        errors: Vec<FieldError>,
    },

    /// A manager was used before `initialize()`.
    #[error("{0} is not initialized; call initialize() first")]
    NotInitialized(&'static str),

    /// Release or extend of a lock id the manager does not know.
    #[error("unknown lock id: {0}")]
    UnknownLock(String),

    /// Lock requested for an empty resource key.
    #[error("lock resource name must not be empty")]
    EmptyResource,

    /// A scoped lock section could not run because the lock was not acquired.
    #[error("could not lock {resource}: {reason}")]
    LockUnavailable {
        /// Resource key
        resource: String,
        /// Why acquisition failed
        reason: DenyReason,
    },

    /// A requested history version has no retained snapshot.
    #[error("version {version} not found in history of {entity_id}")]
    VersionNotFound {
        /// Entity id
        entity_id: String,
        /// Requested version
        version: u64,
    },

    /// Index document is unreadable and needs rebuilding.
    #[error("index corrupted at {}: {}", path.display(), message)]
    IndexCorrupted {
        /// Path of the index document
        path: PathBuf,
        /// Parser or consistency message
        message: String,
    },

    /// Configuration error (loading, parsing, invalid values).
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StoreError {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Shorthand for a single-field validation error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            errors: vec![FieldError::new(field, message)],
        }
    }

    /// True for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for version mismatches and duplicate keys.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. } | Self::DuplicateKey { .. })
    }

    /// True for `Validation`.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns a user-friendly recovery suggestion for the error, if available.
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::IndexCorrupted { .. } => {
                Some("Call rebuild_index() on the affected repository to regenerate the index from entity files.")
            }
            Self::VersionConflict { .. } => {
                Some("Reload the entity and retry the update with its current version.")
            }
            Self::NotInitialized(_) => Some("Initialize the manager (PlanStore::open does this) before use."),
            Self::LockUnavailable {
                reason: DenyReason::Timeout { .. },
                ..
            } => Some("Another caller holds the lock; retry later or raise locks.acquire_timeout_ms."),
            Self::LockUnavailable {
                reason: DenyReason::Disposed,
                ..
            } => Some("The store is shutting down; reopen it before issuing new operations."),
            _ => None,
        }
    }
}

/// Convenience Result type for plandoc_core operations.
pub type Result<T> = std::result::Result<T, StoreError>;
