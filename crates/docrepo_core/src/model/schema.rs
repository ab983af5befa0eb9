//! Schema description contract.
//!
//! The repository consumes schemas through [`SchemaManager`] exactly once,
//! when it compiles its storage model on the first connection.

/// Storage kind of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Long,
    Boolean,
    Date,
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Named group of fields, stored in one fragment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Document type: a name plus the schemas its documents carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentType {
    pub name: String,
    pub schemas: Vec<String>,
}

impl DocumentType {
    pub fn new(name: impl Into<String>, schemas: &[&str]) -> Self {
        Self {
            name: name.into(),
            schemas: schemas.iter().map(|schema| schema.to_string()).collect(),
        }
    }
}

/// Source of schema and document type definitions.
pub trait SchemaManager: Send + Sync {
    fn schemas(&self) -> Vec<Schema>;
    fn document_types(&self) -> Vec<DocumentType>;
}

/// Fixed in-memory schema definitions.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaManager {
    schemas: Vec<Schema>,
    types: Vec<DocumentType>,
}

impl StaticSchemaManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schemas.push(schema);
        self
    }

    pub fn with_type(mut self, doc_type: DocumentType) -> Self {
        self.types.push(doc_type);
        self
    }

    /// `Folder`, `File` and `Note` over the `dublincore`, `file` and `note`
    /// schemas.
    pub fn default_content_model() -> Self {
        Self::new()
            .with_schema(Schema::new(
                "dublincore",
                vec![
                    Field::new("title", FieldKind::String),
                    Field::new("description", FieldKind::String),
                    Field::new("created", FieldKind::Date),
                    Field::new("modified", FieldKind::Date),
                ],
            ))
            .with_schema(Schema::new(
                "file",
                vec![
                    Field::new("content", FieldKind::Binary),
                    Field::new("filename", FieldKind::String),
                ],
            ))
            .with_schema(Schema::new(
                "note",
                vec![
                    Field::new("body", FieldKind::String),
                    Field::new("revision", FieldKind::Long),
                    Field::new("pinned", FieldKind::Boolean),
                ],
            ))
            .with_type(DocumentType::new("Folder", &["dublincore"]))
            .with_type(DocumentType::new("File", &["dublincore", "file"]))
            .with_type(DocumentType::new("Note", &["dublincore", "note"]))
    }
}

impl SchemaManager for StaticSchemaManager {
    fn schemas(&self) -> Vec<Schema> {
        self.schemas.clone()
    }

    fn document_types(&self) -> Vec<DocumentType> {
        self.types.clone()
    }
}
