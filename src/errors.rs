//! Typed error hierarchy for the attractor store and session supervisor.
//!
//! A single `AttractorError` enum carries the whole taxonomy so that the
//! document store, the version-control adapter and the session manager all
//! surface failures the same way. The HTTP mapping lives in
//! [`AttractorError::status_code`].

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the document store, version control and sessions.
#[derive(Debug, Error)]
pub enum AttractorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "Store ID mismatch: project expects '{expected}' but store has '{actual}'. \
         This backing store belongs to a different project."
    )]
    StoreIdMismatch { expected: String, actual: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("git {operation} failed: {detail}")]
    SyncFailure { operation: String, detail: String },

    #[error("Subprocess failed: {0}")]
    SubprocessFailure(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = AttractorError> = std::result::Result<T, E>;

impl AttractorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// HTTP status the routing layer reports for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Conflict(_) | Self::StoreIdMismatch { .. } => 409,
            Self::PermissionDenied(_) => 403,
            Self::SyncFailure { .. } => 502,
            _ => 500,
        }
    }
}
