// src/error.rs

use std::fmt;
use thiserror::Error;

/// A single file unit that failed inside a multi-file operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    /// Relative path of the file that failed
    pub path: String,
    /// Human-readable cause of the failure
    pub cause: String,
}

impl FailedUnit {
    pub fn new(path: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self {
            path: path.into(),
            cause: cause.to_string(),
        }
    }
}

impl fmt::Display for FailedUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.cause)
    }
}

/// Paths of one installed package that collide with a candidate package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConflict {
    pub package_id: String,
    pub paths: Vec<String>,
}

/// Core error types for tabsync
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed archive: missing/duplicate sentinel, bad manifest, or
    /// manifest/payload set mismatch
    #[error("Format error: {0}")]
    Format(String),

    /// Candidate package overlaps installed packages
    #[error("Package {package} conflicts with {} installed package(s)", conflicts.len())]
    Conflict {
        package: String,
        conflicts: Vec<PackageConflict>,
    },

    /// Checksum mismatch during backup or restore
    #[error("Verification failed: {0}")]
    Verification(String),

    /// Transport failure after the retry budget was exhausted
    #[error("Connection error: {0}")]
    Connection(String),

    /// Unknown package, device, snapshot or snapshot entry
    #[error("Not found: {0}")]
    NotFound(String),

    /// A multi-file operation finished with some units failing
    #[error("{} file(s) failed", .0.len())]
    PartialFailure(Vec<FailedUnit>),

    /// Session cancelled between two file units
    #[error("Operation cancelled")]
    Cancelled,

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Host-side I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry or snapshot manifest (de)serialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database initialization error
    #[error("Failed to initialize database: {0}")]
    InitError(String),

    /// Database not found
    #[error("Database not found at path: {0}")]
    DatabaseNotFound(String),
}

impl Error {
    /// Whether re-invoking the same operation may succeed without caller
    /// intervention
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::PartialFailure(_))
    }
}

/// Result type alias using tabsync's Error type
pub type Result<T> = std::result::Result<T, Error>;
