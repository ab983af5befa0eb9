//! Repository configuration loading.
//!
//! # Responsibility
//! - Deserialize repository descriptors from TOML.
//! - Parse type-tagged backend property names (`busyTimeout/Integer`).
//! - Expand `${VAR}` references in property values from the environment.
//!
//! # Invariants
//! - Unset variables are left verbatim.
//! - Property binding itself is owned by the backend factory.

use crate::error::{RepoError, RepoResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_CLUSTERING_DELAY_MS: u64 = 200;

static VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}").expect("variable pattern is valid")
});

/// Descriptor for one named repository.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Backend properties; keys may carry a `/Type` suffix.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub clustering_enabled: bool,
    #[serde(default = "default_clustering_delay_ms")]
    pub clustering_delay_ms: u64,
    /// Root directory of the content-addressed binary store.
    #[serde(default)]
    pub binary_store: Option<PathBuf>,
}

impl RepositoryConfig {
    /// Creates a SQLite-backed descriptor with default settings.
    pub fn sqlite(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(
            "path".to_string(),
            path.as_ref().to_string_lossy().into_owned(),
        );
        Self {
            name: name.into(),
            backend: default_backend(),
            properties,
            clustering_enabled: false,
            clustering_delay_ms: DEFAULT_CLUSTERING_DELAY_MS,
            binary_store: None,
        }
    }

    /// Enables cluster invalidations with the given poll delay.
    pub fn with_clustering(mut self, delay_ms: u64) -> Self {
        self.clustering_enabled = true;
        self.clustering_delay_ms = delay_ms;
        self
    }

    pub fn with_binary_store(mut self, root: impl Into<PathBuf>) -> Self {
        self.binary_store = Some(root.into());
        self
    }

    pub fn from_toml_str(input: &str) -> RepoResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|err| RepoError::Configuration(format!("invalid repository config: {err}")))?;
        if config.name.trim().is_empty() {
            return Err(RepoError::Configuration(
                "repository name cannot be empty".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> RepoResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|err| {
            RepoError::Configuration(format!("cannot read `{}`: {err}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_clustering_delay_ms() -> u64 {
    DEFAULT_CLUSTERING_DELAY_MS
}

/// Declared value type of a backend property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeHint {
    String,
    Integer,
    Long,
    Boolean,
}

/// Splits `name/Type` into the property name and its type tag.
pub fn parse_property_key(raw: &str) -> Result<(&str, Option<TypeHint>), String> {
    let Some((name, type_name)) = raw.split_once('/') else {
        return Ok((raw.trim(), None));
    };
    let hint = match type_name.trim().to_ascii_lowercase().as_str() {
        "string" => TypeHint::String,
        "integer" | "int" => TypeHint::Integer,
        "long" => TypeHint::Long,
        "boolean" | "bool" => TypeHint::Boolean,
        other => return Err(format!("unknown property type `{other}`")),
    };
    Ok((name.trim(), Some(hint)))
}

/// Replaces `${VAR}` with the environment value of `VAR`, if set.
pub fn expand_vars(value: &str) -> String {
    VAR_PATTERN
        .replace_all(value, |caps: &Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
