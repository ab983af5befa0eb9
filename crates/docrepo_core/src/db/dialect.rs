//! Backend dialect detection.
//!
//! The dialect is chosen from a capability probe on a live connection and
//! decides which SQL shapes the compiled `SqlInfo` uses.

use super::{DbError, DbResult};
use log::info;
use rusqlite::Connection;

/// `DELETE ... RETURNING` appeared in 3.35.0.
const RETURNING_MIN: (u32, u32) = (3, 35);
/// Indexes on expressions appeared in 3.9.0.
const EXPRESSION_INDEX_MIN: (u32, u32) = (3, 9);

/// Closed set of supported SQL dialects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    /// Upserts and `RETURNING` are available.
    Sqlite { version: String },
    /// No `RETURNING`; upserts fall back to `INSERT OR REPLACE`.
    SqliteLegacy { version: String },
}

impl Dialect {
    /// Probes the connection and selects the matching dialect.
    pub fn detect(conn: &Connection) -> DbResult<Self> {
        let version: String = conn.query_row("SELECT sqlite_version()", [], |row| row.get(0))?;
        let dialect = Self::from_version(&version)?;
        info!(
            "event=dialect_detect module=db status=ok dialect={} version={}",
            dialect.name(),
            version
        );
        Ok(dialect)
    }

    pub fn from_version(version: &str) -> DbResult<Self> {
        let parsed = parse_version(version).ok_or_else(|| DbError::UnsupportedDialect {
            version: version.to_string(),
        })?;
        if parsed >= RETURNING_MIN {
            Ok(Self::Sqlite {
                version: version.to_string(),
            })
        } else if parsed >= EXPRESSION_INDEX_MIN {
            Ok(Self::SqliteLegacy {
                version: version.to_string(),
            })
        } else {
            Err(DbError::UnsupportedDialect {
                version: version.to_string(),
            })
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite { .. } => "sqlite",
            Self::SqliteLegacy { .. } => "sqlite_legacy",
        }
    }

    pub fn supports_returning(&self) -> bool {
        matches!(self, Self::Sqlite { .. })
    }
}

fn parse_version(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
