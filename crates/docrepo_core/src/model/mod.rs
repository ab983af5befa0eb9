//! Content model: documents, schemas and the compiled storage model.
//!
//! # Responsibility
//! - Define the document shape exchanged between sessions and mappers.
//! - Define the schema-description contract consumed at repository init.
//! - Compile schemas into an immutable storage model and dialect SQL.
//!
//! # Invariants
//! - Every document is identified by a stable `DocId`.
//! - Property keys are `schema:field` and belong to a schema of the
//!   document's type.

pub mod compiled;
pub mod document;
pub mod schema;

pub use compiled::{CompiledField, CompiledSchema, Model, SqlInfo};
pub use document::{DocId, Document, PropertyValue};
pub use schema::{DocumentType, Field, FieldKind, Schema, SchemaManager, StaticSchemaManager};
