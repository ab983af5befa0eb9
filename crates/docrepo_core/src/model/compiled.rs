//! Compiled storage model and dialect-specific SQL.
//!
//! # Responsibility
//! - Validate schema definitions and map each schema to a fragment table.
//! - Validate documents against their type before they reach the backend.
//! - Precompute the SQL statements the mapper executes.
//!
//! # Invariants
//! - A `Model` is immutable once built and shared by every session.
//! - Identifiers that reach SQL text match `^[A-Za-z][A-Za-z0-9_]*$`.

use super::document::{Document, PropertyValue};
use super::schema::{FieldKind, SchemaManager};
use crate::db::Dialect;
use crate::error::{RepoError, RepoResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

const RESERVED_COLUMNS: &[&str] = &["id"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledField {
    /// Property key, `schema:field`.
    pub key: String,
    pub column: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchema {
    pub name: String,
    pub table: String,
    pub fields: Vec<CompiledField>,
}

impl CompiledSchema {
    pub fn field(&self, key: &str) -> Option<&CompiledField> {
        self.fields.iter().find(|field| field.key == key)
    }
}

/// Immutable mapping from document types to fragment tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    schemas: BTreeMap<String, CompiledSchema>,
    types: BTreeMap<String, Vec<String>>,
}

impl Model {
    /// Compiles schema definitions into a storage model.
    ///
    /// # Errors
    /// - `Configuration` for invalid identifiers, duplicates, reserved field
    ///   names or document types that reference unknown schemas.
    pub fn build(manager: &dyn SchemaManager) -> RepoResult<Self> {
        let mut schemas = BTreeMap::new();
        for schema in manager.schemas() {
            check_identifier("schema", &schema.name)?;
            if schemas.contains_key(&schema.name) {
                return Err(RepoError::Configuration(format!(
                    "duplicate schema `{}`",
                    schema.name
                )));
            }

            let mut seen = BTreeSet::new();
            let mut fields = Vec::with_capacity(schema.fields.len());
            for field in &schema.fields {
                check_identifier("field", &field.name)?;
                if RESERVED_COLUMNS.contains(&field.name.to_ascii_lowercase().as_str()) {
                    return Err(RepoError::Configuration(format!(
                        "field name `{}` is reserved in schema `{}`",
                        field.name, schema.name
                    )));
                }
                if !seen.insert(field.name.to_ascii_lowercase()) {
                    return Err(RepoError::Configuration(format!(
                        "duplicate field `{}` in schema `{}`",
                        field.name, schema.name
                    )));
                }
                fields.push(CompiledField {
                    key: format!("{}:{}", schema.name, field.name),
                    column: field.name.clone(),
                    kind: field.kind,
                });
            }

            schemas.insert(
                schema.name.clone(),
                CompiledSchema {
                    table: format!("frag_{}", schema.name),
                    name: schema.name,
                    fields,
                },
            );
        }

        let mut types = BTreeMap::new();
        for doc_type in manager.document_types() {
            check_identifier("document type", &doc_type.name)?;
            for schema in &doc_type.schemas {
                if !schemas.contains_key(schema) {
                    return Err(RepoError::Configuration(format!(
                        "document type `{}` references unknown schema `{schema}`",
                        doc_type.name
                    )));
                }
            }
            if types
                .insert(doc_type.name.clone(), doc_type.schemas)
                .is_some()
            {
                return Err(RepoError::Configuration(format!(
                    "duplicate document type `{}`",
                    doc_type.name
                )));
            }
        }

        Ok(Self { schemas, types })
    }

    pub fn has_type(&self, doc_type: &str) -> bool {
        self.types.contains_key(doc_type)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    pub fn schemas(&self) -> impl Iterator<Item = &CompiledSchema> {
        self.schemas.values()
    }

    /// Schemas carried by `doc_type`, in declaration order.
    pub fn type_schemas(&self, doc_type: &str) -> Option<Vec<&CompiledSchema>> {
        let names = self.types.get(doc_type)?;
        Some(
            names
                .iter()
                .filter_map(|name| self.schemas.get(name))
                .collect(),
        )
    }

    /// Resolves a `schema:field` key for one document type.
    pub fn field(&self, doc_type: &str, key: &str) -> Option<&CompiledField> {
        let (schema_name, _) = key.split_once(':')?;
        let names = self.types.get(doc_type)?;
        if !names.iter().any(|name| name == schema_name) {
            return None;
        }
        self.schemas.get(schema_name)?.field(key)
    }

    /// Checks type, property keys and value kinds.
    pub fn validate_document(&self, doc: &Document) -> RepoResult<()> {
        if doc.name.trim().is_empty() {
            return Err(RepoError::Validation(
                "document name cannot be empty".to_string(),
            ));
        }
        if doc.name.contains('/') {
            return Err(RepoError::Validation(format!(
                "document name `{}` cannot contain `/`",
                doc.name
            )));
        }
        if !self.has_type(&doc.doc_type) {
            return Err(RepoError::Validation(format!(
                "unknown document type `{}`",
                doc.doc_type
            )));
        }
        for (key, value) in &doc.properties {
            self.validate_property(&doc.doc_type, key, value)?;
        }
        Ok(())
    }

    pub fn validate_property(
        &self,
        doc_type: &str,
        key: &str,
        value: &PropertyValue,
    ) -> RepoResult<()> {
        let field = self.field(doc_type, key).ok_or_else(|| {
            RepoError::Validation(format!(
                "property `{key}` is not defined for type `{doc_type}`"
            ))
        })?;
        if !kind_matches(field.kind, value) {
            return Err(RepoError::Validation(format!(
                "property `{key}` expects {:?}",
                field.kind
            )));
        }
        Ok(())
    }
}

fn kind_matches(kind: FieldKind, value: &PropertyValue) -> bool {
    matches!(
        (kind, value),
        (FieldKind::String, PropertyValue::String(_))
            | (FieldKind::Long, PropertyValue::Long(_))
            | (FieldKind::Boolean, PropertyValue::Boolean(_))
            | (FieldKind::Date, PropertyValue::Date(_))
            | (FieldKind::Binary, PropertyValue::Binary(_))
    )
}

fn check_identifier(what: &str, name: &str) -> RepoResult<()> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(RepoError::Configuration(format!(
            "invalid {what} name `{name}`"
        )))
    }
}

/// Per-fragment statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentSql {
    pub table: String,
    pub create_table: String,
    pub select: String,
    pub upsert: String,
    /// `(column, ALTER TABLE ... ADD COLUMN ...)` for schema evolution.
    pub add_columns: Vec<(String, String)>,
}

/// How a node consumes its cluster invalidation rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterFetchSql {
    /// One statement deletes and returns the rows.
    Returning(String),
    /// Select then delete inside one transaction.
    SelectThenDelete { select: String, delete: String },
}

/// SQL compiled from a model for one dialect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlInfo {
    dialect: Dialect,
    fragments: BTreeMap<String, FragmentSql>,
    cluster_fetch: ClusterFetchSql,
}

impl SqlInfo {
    pub const SELECT_HIERARCHY: &'static str =
        "SELECT id, parent_id, name, primary_type FROM hierarchy WHERE id = ?1";
    pub const INSERT_HIERARCHY: &'static str =
        "INSERT INTO hierarchy (id, parent_id, name, primary_type) VALUES (?1, ?2, ?3, ?4)";
    pub const UPDATE_HIERARCHY: &'static str =
        "UPDATE hierarchy SET parent_id = ?2, name = ?3 WHERE id = ?1";
    /// `/` never appears in a valid name, so the parked name is free.
    pub const PARK_HIERARCHY: &'static str =
        "UPDATE hierarchy SET name = '/' || id WHERE id = ?1";
    pub const DELETE_HIERARCHY: &'static str = "DELETE FROM hierarchy WHERE id = ?1";
    pub const SELECT_CHILD_IDS: &'static str =
        "SELECT id FROM hierarchy WHERE parent_id = ?1 ORDER BY name ASC, id ASC";
    pub const SELECT_ROOT_IDS: &'static str =
        "SELECT id FROM hierarchy WHERE parent_id IS NULL ORDER BY name ASC, id ASC";
    pub const SELECT_DESCENDANT_IDS: &'static str = "WITH RECURSIVE subtree(id) AS (
            SELECT id FROM hierarchy WHERE parent_id = ?1
            UNION ALL
            SELECT h.id FROM hierarchy h JOIN subtree s ON h.parent_id = s.id
        )
        SELECT id FROM subtree";
    pub const INSERT_CLUSTER_NODE: &'static str =
        "INSERT INTO cluster_nodes (node_id, created_at) VALUES (?1, ?2)";
    pub const DELETE_CLUSTER_NODE: &'static str = "DELETE FROM cluster_nodes WHERE node_id = ?1";
    pub const DELETE_NODE_INVALIDATIONS: &'static str =
        "DELETE FROM cluster_invals WHERE node_id = ?1";
    /// One row per other registered node.
    pub const INSERT_CLUSTER_INVALIDATION: &'static str =
        "INSERT INTO cluster_invals (node_id, origin_id, doc_id, kind, created_at)
         SELECT node_id, ?1, ?2, ?3, ?4 FROM cluster_nodes WHERE node_id <> ?1";

    pub fn new(model: &Model, dialect: Dialect) -> Self {
        let fragments = model
            .schemas()
            .map(|schema| (schema.name.clone(), fragment_sql(schema, &dialect)))
            .collect();
        let cluster_fetch = if dialect.supports_returning() {
            ClusterFetchSql::Returning(
                "DELETE FROM cluster_invals WHERE node_id = ?1 RETURNING doc_id, kind".to_string(),
            )
        } else {
            ClusterFetchSql::SelectThenDelete {
                select: "SELECT doc_id, kind FROM cluster_invals WHERE node_id = ?1".to_string(),
                delete: Self::DELETE_NODE_INVALIDATIONS.to_string(),
            }
        };
        Self {
            dialect,
            fragments,
            cluster_fetch,
        }
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn fragment(&self, schema: &str) -> Option<&FragmentSql> {
        self.fragments.get(schema)
    }

    pub fn fragments(&self) -> impl Iterator<Item = &FragmentSql> {
        self.fragments.values()
    }

    pub fn cluster_fetch(&self) -> &ClusterFetchSql {
        &self.cluster_fetch
    }
}

fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::String | FieldKind::Binary => "TEXT",
        FieldKind::Long | FieldKind::Boolean | FieldKind::Date => "INTEGER",
    }
}

fn fragment_sql(schema: &CompiledSchema, dialect: &Dialect) -> FragmentSql {
    let table = schema.table.as_str();
    let columns: Vec<&str> = schema
        .fields
        .iter()
        .map(|field| field.column.as_str())
        .collect();

    let mut create_table = format!(
        "CREATE TABLE IF NOT EXISTS {table} (\n    id TEXT PRIMARY KEY NOT NULL REFERENCES hierarchy(id) ON DELETE CASCADE"
    );
    for field in &schema.fields {
        create_table.push_str(&format!(",\n    {} {}", field.column, column_type(field.kind)));
    }
    create_table.push_str("\n)");

    let select = if columns.is_empty() {
        format!("SELECT id FROM {table} WHERE id = ?1")
    } else {
        format!("SELECT {} FROM {table} WHERE id = ?1", columns.join(", "))
    };

    let all_columns = std::iter::once("id")
        .chain(columns.iter().copied())
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=columns.len() + 1)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    let upsert = match dialect {
        Dialect::Sqlite { .. } if columns.is_empty() => format!(
            "INSERT INTO {table} (id) VALUES (?1) ON CONFLICT(id) DO NOTHING"
        ),
        Dialect::Sqlite { .. } => {
            let assignments = columns
                .iter()
                .map(|column| format!("{column} = excluded.{column}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "INSERT INTO {table} ({all_columns}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {assignments}"
            )
        }
        Dialect::SqliteLegacy { .. } => {
            format!("INSERT OR REPLACE INTO {table} ({all_columns}) VALUES ({placeholders})")
        }
    };

    let add_columns = schema
        .fields
        .iter()
        .map(|field| {
            (
                field.column.clone(),
                format!(
                    "ALTER TABLE {table} ADD COLUMN {} {}",
                    field.column,
                    column_type(field.kind)
                ),
            )
        })
        .collect();

    FragmentSql {
        table: table.to_string(),
        create_table,
        select,
        upsert,
        add_columns,
    }
}
