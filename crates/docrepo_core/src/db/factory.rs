//! Backend connection factory and explicit property binding.
//!
//! # Responsibility
//! - Select the backend implementation from the configured identifier.
//! - Bind configured (optionally type-tagged) properties onto the factory.
//! - Open physical connections on demand.
//!
//! # Invariants
//! - The factory is built once per repository and never mutated afterwards.
//! - A property that cannot be bound is logged and skipped; only a missing
//!   required property or an unknown backend fails construction.

use super::open::configure_connection;
use crate::config::{expand_vars, parse_property_key, RepositoryConfig, TypeHint};
use crate::error::{RepoError, RepoResult};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::path::PathBuf;
use std::time::Instant;

const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const JOURNAL_MODES: &[&str] = &["wal", "delete", "truncate", "persist", "memory", "off"];

/// A configuration value converted according to its type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundValue {
    Text(String),
    Integer(i64),
    Boolean(bool),
}

impl BoundValue {
    /// Converts a raw string using the optional type tag.
    pub fn parse(raw: &str, hint: Option<TypeHint>) -> Result<Self, String> {
        match hint {
            None | Some(TypeHint::String) => Ok(Self::Text(raw.to_string())),
            Some(TypeHint::Integer) | Some(TypeHint::Long) => raw
                .trim()
                .parse::<i64>()
                .map(Self::Integer)
                .map_err(|err| format!("`{raw}` is not an integer: {err}")),
            Some(TypeHint::Boolean) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Self::Boolean(true)),
                "false" => Ok(Self::Boolean(false)),
                other => Err(format!("`{other}` is not a boolean")),
            },
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "string",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
        }
    }
}

/// Physical connection settings for the SQLite backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConnectionFactory {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
    pub cache_size: Option<i64>,
    pub foreign_keys: bool,
}

/// Explicit property registry for [`SqliteConnectionFactory`].
#[derive(Debug, Default)]
pub struct SqliteFactoryBuilder {
    path: Option<PathBuf>,
    busy_timeout_ms: Option<u64>,
    journal_mode: Option<String>,
    cache_size: Option<i64>,
    foreign_keys: Option<bool>,
}

impl SqliteFactoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds one named property. Unknown names and mismatched kinds fail.
    pub fn bind(&mut self, name: &str, value: BoundValue) -> Result<(), String> {
        match (name, value) {
            ("path", BoundValue::Text(path)) => {
                self.path = Some(PathBuf::from(path));
            }
            ("busyTimeout", BoundValue::Integer(ms)) if ms >= 0 => {
                self.busy_timeout_ms = Some(ms as u64);
            }
            ("journalMode", BoundValue::Text(mode)) => {
                let mode = mode.trim().to_ascii_lowercase();
                if !JOURNAL_MODES.contains(&mode.as_str()) {
                    return Err(format!("unsupported journal mode `{mode}`"));
                }
                self.journal_mode = Some(mode);
            }
            ("cacheSize", BoundValue::Integer(pages)) => {
                self.cache_size = Some(pages);
            }
            ("foreignKeys", BoundValue::Boolean(enabled)) => {
                self.foreign_keys = Some(enabled);
            }
            (name, value) => {
                return Err(format!(
                    "no {} property `{name}` on sqlite backend",
                    value.kind()
                ));
            }
        }
        Ok(())
    }

    pub fn build(self) -> RepoResult<SqliteConnectionFactory> {
        let path = self.path.ok_or_else(|| {
            RepoError::Configuration("sqlite backend requires property `path`".to_string())
        })?;
        Ok(SqliteConnectionFactory {
            path,
            busy_timeout_ms: self.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
            journal_mode: self.journal_mode.unwrap_or_else(|| "wal".to_string()),
            cache_size: self.cache_size,
            foreign_keys: self.foreign_keys.unwrap_or(true),
        })
    }
}

/// Closed set of supported backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFactory {
    Sqlite(SqliteConnectionFactory),
}

impl ConnectionFactory {
    /// Builds the backend factory selected by `config.backend`.
    ///
    /// # Errors
    /// - `Configuration` for an unknown backend or a missing required property.
    pub fn from_config(config: &RepositoryConfig) -> RepoResult<Self> {
        match config.backend.trim().to_ascii_lowercase().as_str() {
            "sqlite" => {
                let mut builder = SqliteFactoryBuilder::new();
                for (raw_key, raw_value) in &config.properties {
                    let (name, hint) = match parse_property_key(raw_key) {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            error!(
                                "event=factory_bind module=db status=error property={} error={}",
                                raw_key, err
                            );
                            continue;
                        }
                    };
                    let expanded = expand_vars(raw_value);
                    let bound = match BoundValue::parse(&expanded, hint) {
                        Ok(bound) => bound,
                        Err(err) => {
                            error!(
                                "event=factory_bind module=db status=error property={} error={}",
                                name, err
                            );
                            continue;
                        }
                    };
                    if let Err(err) = builder.bind(name, bound) {
                        warn!(
                            "event=factory_bind module=db status=skipped property={} error={}",
                            name, err
                        );
                    }
                }
                let factory = builder.build()?;
                info!(
                    "event=factory_build module=db status=ok backend=sqlite path={}",
                    factory.path.display()
                );
                Ok(Self::Sqlite(factory))
            }
            other => Err(RepoError::Configuration(format!(
                "unknown backend `{other}`"
            ))),
        }
    }

    /// Opens and configures one physical connection.
    ///
    /// # Errors
    /// - `Connectivity` when the backend cannot be reached.
    pub fn connect(&self) -> RepoResult<Connection> {
        match self {
            Self::Sqlite(factory) => {
                let started_at = Instant::now();
                let conn = match Connection::open(&factory.path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(
                            "event=backend_connect module=db status=error duration_ms={} error_code=db_open_failed error={}",
                            started_at.elapsed().as_millis(),
                            err
                        );
                        return Err(RepoError::Connectivity(err.into()));
                    }
                };
                if let Err(err) = configure_connection(&conn, factory) {
                    error!(
                        "event=backend_connect module=db status=error duration_ms={} error_code=db_configure_failed error={}",
                        started_at.elapsed().as_millis(),
                        err
                    );
                    return Err(RepoError::Connectivity(err));
                }
                debug!(
                    "event=backend_connect module=db status=ok duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(conn)
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Sqlite(factory) => format!("sqlite:{}", factory.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundValue, SqliteFactoryBuilder};
    use crate::config::TypeHint;

    #[test]
    fn bound_value_parses_type_tags() {
        assert_eq!(
            BoundValue::parse("10", Some(TypeHint::Integer)).unwrap(),
            BoundValue::Integer(10)
        );
        assert_eq!(
            BoundValue::parse("TRUE", Some(TypeHint::Boolean)).unwrap(),
            BoundValue::Boolean(true)
        );
        assert!(BoundValue::parse("ten", Some(TypeHint::Integer)).is_err());
        assert_eq!(
            BoundValue::parse("10", None).unwrap(),
            BoundValue::Text("10".to_string())
        );
    }

    #[test]
    fn builder_rejects_mismatched_kind_and_requires_path() {
        let mut builder = SqliteFactoryBuilder::new();
        assert!(builder
            .bind("busyTimeout", BoundValue::Text("100".to_string()))
            .is_err());
        assert!(builder
            .bind("journalMode", BoundValue::Text("bogus".to_string()))
            .is_err());
        assert!(builder.build().is_err());
    }

    #[test]
    fn builder_applies_defaults() {
        let mut builder = SqliteFactoryBuilder::new();
        builder
            .bind("path", BoundValue::Text("/tmp/repo.db".to_string()))
            .unwrap();
        let factory = builder.build().unwrap();
        assert_eq!(factory.journal_mode, "wal");
        assert_eq!(factory.busy_timeout_ms, 5_000);
        assert!(factory.foreign_keys);
    }
}
