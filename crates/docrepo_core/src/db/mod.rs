//! SQLite backend bootstrap: connection factory, dialect probing and base
//! schema migrations.
//!
//! # Responsibility
//! - Build the backend connection factory from repository configuration.
//! - Open and configure physical SQLite connections.
//! - Detect the backend dialect from a probe connection.
//! - Apply base schema migrations in deterministic order.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Sessions must not read/write repository data before migrations succeed.

use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod dialect;
pub mod factory;
pub mod migrations;
mod open;

pub use dialect::Dialect;
pub use factory::{BoundValue, ConnectionFactory, SqliteConnectionFactory, SqliteFactoryBuilder};
pub use open::configure_connection;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
    UnsupportedDialect {
        version: String,
    },
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::UnsupportedSchemaVersion {
                db_version,
                latest_supported,
            } => write!(
                f,
                "database schema version {db_version} is newer than supported {latest_supported}"
            ),
            Self::UnsupportedDialect { version } => {
                write!(f, "unsupported sqlite version `{version}`")
            }
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnsupportedSchemaVersion { .. } => None,
            Self::UnsupportedDialect { .. } => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}
