//! Repository-level error taxonomy.
//!
//! # Responsibility
//! - Wrap backend failures into the categories callers act on.
//! - Keep teardown and cluster failures distinguishable from commit failures.
//!
//! # Invariants
//! - A constraint violation from the backend is always `Conflict`.
//! - Every other SQLite failure is `Connectivity`.
//! - An unsupported backend version or schema version is `Configuration`.
//! - `Configuration` failures are not retried by the repository.

use crate::db::DbError;
use crate::model::DocId;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    /// Backend factory, dialect or schema model cannot be built from config.
    Configuration(String),
    /// Physical connection or transaction failure. Callers may retry.
    Connectivity(DbError),
    /// Commit rejected by the backend. Pending changes were rolled back.
    Conflict(String),
    /// Document does not exist in the backend.
    NotFound(DocId),
    /// Persisting or fetching cluster invalidations failed.
    ClusterSync(String),
    /// Write rejected before reaching the backend.
    Validation(String),
    /// Persisted data cannot be converted into the content model.
    InvalidData(String),
    /// Binary store I/O failure.
    Io(std::io::Error),
    SessionClosed,
    RepositoryClosed,
}

impl RepoError {
    /// Returns whether a later `get_connection` may succeed after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::ClusterSync(_))
    }

    pub(crate) fn cluster_sync(err: RepoError) -> Self {
        match err {
            Self::ClusterSync(_) => err,
            other => Self::ClusterSync(other.to_string()),
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(message) => write!(f, "configuration error: {message}"),
            Self::Connectivity(err) => write!(f, "backend unavailable: {err}"),
            Self::Conflict(message) => write!(f, "commit conflict: {message}"),
            Self::NotFound(id) => write!(f, "document not found: {id}"),
            Self::ClusterSync(message) => write!(f, "cluster invalidation failed: {message}"),
            Self::Validation(message) => write!(f, "{message}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::SessionClosed => write!(f, "session is closed"),
            Self::RepositoryClosed => write!(f, "repository is closed"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connectivity(err) => Some(err),
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        match value {
            DbError::Sqlite(err) => Self::from(err),
            DbError::UnsupportedDialect { .. } | DbError::UnsupportedSchemaVersion { .. } => {
                Self::Configuration(value.to_string())
            }
        }
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        if is_constraint_violation(&value) {
            return Self::Conflict(value.to_string());
        }
        Self::Connectivity(DbError::Sqlite(value))
    }
}

impl From<std::io::Error> for RepoError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::ConstraintViolation)
    )
}
