//! Document record.
//!
//! # Responsibility
//! - Define the canonical node shared by sessions, caches and mappers.
//!
//! # Invariants
//! - `id` is stable and never reused for another document.
//! - `name` is unique among siblings (enforced by the backend at commit).
//! - `properties` never holds an explicit null; absence means unset.

use crate::binary::BinaryRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Stable identifier of a document node.
pub type DocId = Uuid;

/// Typed property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    String(String),
    Long(i64),
    Boolean(bool),
    /// Unix epoch milliseconds.
    Date(i64),
    Binary(BinaryRef),
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Long(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// One node of the content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocId,
    /// `None` means a root-level document.
    pub parent_id: Option<DocId>,
    pub name: String,
    /// Document type name, resolved against the compiled model.
    #[serde(rename = "type")]
    pub doc_type: String,
    /// Keyed by `schema:field`.
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Document {
    /// Creates a document with a generated stable ID and no properties.
    pub fn new(
        parent_id: Option<DocId>,
        name: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            name: name.into(),
            doc_type: doc_type.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Returns the value of a string property, if set and of that kind.
    pub fn string_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn clear_property(&mut self, key: &str) -> Option<PropertyValue> {
        self.properties.remove(key)
    }
}
