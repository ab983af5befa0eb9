//! SQLite-backed data mapper.
//!
//! # Invariants
//! - Fragment rows are written for every schema of the document type, with
//!   NULL for unset fields.
//! - Read paths reject persisted state that does not fit the model instead
//!   of masking it.

use super::{ClusterNodeId, Mapper};
use crate::binary::BinaryRef;
use crate::clock::Clock;
use crate::db::migrations::apply_migrations;
use crate::error::{RepoError, RepoResult};
use crate::invalidation::{InvalidationKind, Invalidations};
use crate::model::compiled::ClusterFetchSql;
use crate::model::{CompiledSchema, DocId, Document, FieldKind, Model, PropertyValue, SqlInfo};
use log::{debug, info};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

pub struct SqliteMapper {
    conn: Option<Connection>,
    model: Arc<Model>,
    sql: Arc<SqlInfo>,
    clock: Arc<dyn Clock>,
    cluster_node_id: Option<ClusterNodeId>,
    in_transaction: bool,
}

impl SqliteMapper {
    pub fn new(
        conn: Connection,
        model: Arc<Model>,
        sql: Arc<SqlInfo>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            conn: Some(conn),
            model,
            sql,
            clock,
            cluster_node_id: None,
            in_transaction: false,
        }
    }

    pub fn cluster_node_id(&self) -> Option<&str> {
        self.cluster_node_id.as_deref()
    }

    fn conn(&self) -> RepoResult<&Connection> {
        self.conn.as_ref().ok_or(RepoError::SessionClosed)
    }

    fn conn_mut(&mut self) -> RepoResult<&mut Connection> {
        self.conn.as_mut().ok_or(RepoError::SessionClosed)
    }

    fn node_id(&self) -> RepoResult<&str> {
        self.cluster_node_id
            .as_deref()
            .ok_or_else(|| RepoError::ClusterSync("cluster node is not registered".to_string()))
    }

    fn schemas_of(&self, doc_type: &str) -> RepoResult<Vec<&CompiledSchema>> {
        self.model.type_schemas(doc_type).ok_or_else(|| {
            RepoError::InvalidData(format!("unknown document type `{doc_type}` in hierarchy"))
        })
    }

    fn write_fragments(&self, doc: &Document) -> RepoResult<()> {
        let conn = self.conn()?;
        for schema in self.schemas_of(&doc.doc_type)? {
            let fragment = self.sql.fragment(&schema.name).ok_or_else(|| {
                RepoError::InvalidData(format!("no compiled sql for schema `{}`", schema.name))
            })?;
            let mut values = Vec::with_capacity(schema.fields.len() + 1);
            values.push(Value::Text(doc.id.to_string()));
            for field in &schema.fields {
                values.push(property_to_db(doc.properties.get(&field.key)));
            }
            conn.execute(&fragment.upsert, params_from_iter(values))?;
        }
        Ok(())
    }

    fn read_fragments(
        &self,
        id: DocId,
        doc_type: &str,
    ) -> RepoResult<BTreeMap<String, PropertyValue>> {
        let conn = self.conn()?;
        let mut properties = BTreeMap::new();
        for schema in self.schemas_of(doc_type)? {
            let Some(fragment) = self.sql.fragment(&schema.name) else {
                continue;
            };
            if schema.fields.is_empty() {
                continue;
            }
            let row: Option<Vec<Value>> = conn
                .query_row(&fragment.select, [id.to_string()], |row| {
                    (0..schema.fields.len())
                        .map(|index| row.get::<_, Value>(index))
                        .collect()
                })
                .optional()?;
            let Some(columns) = row else {
                continue;
            };
            for (field, value) in schema.fields.iter().zip(columns) {
                if let Some(value) = property_from_db(field.kind, value, &field.key)? {
                    properties.insert(field.key.clone(), value);
                }
            }
        }
        Ok(properties)
    }

    fn ensure_fragment_tables(&mut self) -> RepoResult<()> {
        let sql = Arc::clone(&self.sql);
        let tx = self
            .conn_mut()?
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        for fragment in sql.fragments() {
            tx.execute_batch(&fragment.create_table)?;
            let existing = {
                let mut stmt = tx.prepare(&format!("PRAGMA table_info({})", fragment.table))?;
                let names = stmt
                    .query_map([], |row| row.get::<_, String>("name"))?
                    .collect::<Result<BTreeSet<_>, _>>()?;
                names
            };
            for (column, alter) in &fragment.add_columns {
                if !existing.contains(column) {
                    info!(
                        "event=schema_evolve module=mapper status=ok table={} column={}",
                        fragment.table, column
                    );
                    tx.execute_batch(alter)?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }
}

impl Mapper for SqliteMapper {
    fn create_database(&mut self) -> RepoResult<()> {
        apply_migrations(self.conn_mut()?)?;
        self.ensure_fragment_tables()?;
        info!(
            "event=create_database module=mapper status=ok dialect={} fragments={}",
            self.sql.dialect().name(),
            self.sql.fragments().count()
        );
        Ok(())
    }

    fn create_cluster_node(&mut self) -> RepoResult<ClusterNodeId> {
        let node_id = Uuid::new_v4().to_string();
        let now = self.clock.now_millis();
        self.conn()?
            .execute(SqlInfo::INSERT_CLUSTER_NODE, params![node_id, now])?;
        self.cluster_node_id = Some(node_id.clone());
        Ok(node_id)
    }

    fn remove_cluster_node(&mut self) -> RepoResult<()> {
        let node_id = self.node_id()?.to_string();
        let tx = self.conn_mut()?.transaction()?;
        tx.execute(SqlInfo::DELETE_NODE_INVALIDATIONS, [&node_id])?;
        tx.execute(SqlInfo::DELETE_CLUSTER_NODE, [&node_id])?;
        tx.commit()?;
        self.cluster_node_id = None;
        Ok(())
    }

    fn insert_cluster_invalidations(&mut self, invalidations: &Invalidations) -> RepoResult<()> {
        if invalidations.is_empty() {
            return Ok(());
        }
        let node_id = self.node_id()?.to_string();
        let now = self.clock.now_millis();
        let tx = self
            .conn_mut()?
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut stmt = tx.prepare(SqlInfo::INSERT_CLUSTER_INVALIDATION)?;
            for (id, kind) in invalidations.iter() {
                stmt.execute(params![node_id, id.to_string(), kind.as_db(), now])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn get_cluster_invalidations(&mut self) -> RepoResult<Invalidations> {
        let node_id = self.node_id()?.to_string();
        let sql = Arc::clone(&self.sql);
        let tx = self
            .conn_mut()?
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows = {
            let select = match sql.cluster_fetch() {
                ClusterFetchSql::Returning(statement) => statement.as_str(),
                ClusterFetchSql::SelectThenDelete { select, .. } => select.as_str(),
            };
            let mut stmt = tx.prepare(select)?;
            let rows = stmt
                .query_map([&node_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        if let ClusterFetchSql::SelectThenDelete { delete, .. } = sql.cluster_fetch() {
            tx.execute(delete, [&node_id])?;
        }
        tx.commit()?;

        let mut invalidations = Invalidations::new();
        for (doc_id, kind) in rows {
            let id = Uuid::parse_str(&doc_id).map_err(|_| {
                RepoError::InvalidData(format!("invalid doc id `{doc_id}` in cluster_invals"))
            })?;
            let kind = InvalidationKind::parse_db(&kind).ok_or_else(|| {
                RepoError::InvalidData(format!("invalid kind `{kind}` in cluster_invals"))
            })?;
            invalidations.add(id, kind);
        }
        debug!(
            "event=cluster_fetch module=mapper status=ok node_id={} count={}",
            node_id,
            invalidations.len()
        );
        Ok(invalidations)
    }

    fn read_document(&mut self, id: DocId) -> RepoResult<Option<Document>> {
        let row = self
            .conn()?
            .query_row(SqlInfo::SELECT_HIERARCHY, [id.to_string()], |row| {
                Ok((
                    row.get::<_, Option<String>>("parent_id")?,
                    row.get::<_, String>("name")?,
                    row.get::<_, String>("primary_type")?,
                ))
            })
            .optional()?;
        let Some((parent_text, name, doc_type)) = row else {
            return Ok(None);
        };

        let parent_id = match parent_text {
            Some(text) => Some(Uuid::parse_str(&text).map_err(|_| {
                RepoError::InvalidData(format!("invalid parent id `{text}` in hierarchy"))
            })?),
            None => None,
        };
        let properties = self.read_fragments(id, &doc_type)?;
        Ok(Some(Document {
            id,
            parent_id,
            name,
            doc_type,
            properties,
        }))
    }

    fn child_ids(&mut self, parent: Option<DocId>) -> RepoResult<Vec<DocId>> {
        let conn = self.conn()?;
        let texts = match parent {
            Some(parent) => {
                let mut stmt = conn.prepare_cached(SqlInfo::SELECT_CHILD_IDS)?;
                let ids = stmt
                    .query_map([parent.to_string()], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            }
            None => {
                let mut stmt = conn.prepare_cached(SqlInfo::SELECT_ROOT_IDS)?;
                let ids = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                ids
            }
        };
        texts.iter().map(|text| parse_doc_id(text)).collect()
    }

    fn descendant_ids(&mut self, id: DocId) -> RepoResult<Vec<DocId>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(SqlInfo::SELECT_DESCENDANT_IDS)?;
        let texts = stmt
            .query_map([id.to_string()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        texts.iter().map(|text| parse_doc_id(text)).collect()
    }

    fn begin(&mut self) -> RepoResult<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn()?.execute_batch("BEGIN IMMEDIATE")?;
        self.in_transaction = true;
        Ok(())
    }

    fn insert_document(&mut self, doc: &Document) -> RepoResult<()> {
        self.model.validate_document(doc)?;
        self.conn()?.execute(
            SqlInfo::INSERT_HIERARCHY,
            params![
                doc.id.to_string(),
                doc.parent_id.map(|parent| parent.to_string()),
                doc.name.as_str(),
                doc.doc_type.as_str(),
            ],
        )?;
        self.write_fragments(doc)
    }

    fn update_document(&mut self, doc: &Document) -> RepoResult<()> {
        self.model.validate_document(doc)?;
        let changed = self.conn()?.execute(
            SqlInfo::UPDATE_HIERARCHY,
            params![
                doc.id.to_string(),
                doc.parent_id.map(|parent| parent.to_string()),
                doc.name.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(RepoError::Conflict(format!(
                "document {} no longer exists",
                doc.id
            )));
        }
        self.write_fragments(doc)
    }

    fn park_document(&mut self, id: DocId) -> RepoResult<()> {
        self.conn()?
            .execute(SqlInfo::PARK_HIERARCHY, [id.to_string()])?;
        Ok(())
    }

    fn delete_document(&mut self, id: DocId) -> RepoResult<()> {
        let conn = self.conn()?;
        for fragment in self.sql.fragments() {
            conn.execute(
                &format!("DELETE FROM {} WHERE id = ?1", fragment.table),
                [id.to_string()],
            )?;
        }
        conn.execute(SqlInfo::DELETE_HIERARCHY, [id.to_string()])?;
        Ok(())
    }

    fn commit(&mut self) -> RepoResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn()?.execute_batch("COMMIT")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> RepoResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let conn = self.conn()?;
        if conn.is_autocommit() {
            // The backend already rolled the transaction back.
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn close(&mut self) {
        if self.in_transaction {
            if let Err(err) = self.rollback() {
                log::warn!(
                    "event=mapper_close module=mapper status=error error_code=rollback_failed error={}",
                    err
                );
            }
        }
        if let Some(conn) = self.conn.take() {
            if let Err((_, err)) = conn.close() {
                log::warn!(
                    "event=mapper_close module=mapper status=error error_code=close_failed error={}",
                    err
                );
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

fn parse_doc_id(text: &str) -> RepoResult<DocId> {
    Uuid::parse_str(text)
        .map_err(|_| RepoError::InvalidData(format!("invalid document id `{text}` in hierarchy")))
}

fn property_to_db(value: Option<&PropertyValue>) -> Value {
    match value {
        None => Value::Null,
        Some(PropertyValue::String(text)) => Value::Text(text.clone()),
        Some(PropertyValue::Long(number)) | Some(PropertyValue::Date(number)) => {
            Value::Integer(*number)
        }
        Some(PropertyValue::Boolean(flag)) => Value::Integer(i64::from(*flag)),
        Some(PropertyValue::Binary(binary)) => Value::Text(binary.to_db()),
    }
}

fn property_from_db(kind: FieldKind, value: Value, key: &str) -> RepoResult<Option<PropertyValue>> {
    let invalid = |found: &str| {
        RepoError::InvalidData(format!("unexpected {found} value for property `{key}`"))
    };
    let property = match (kind, value) {
        (_, Value::Null) => return Ok(None),
        (FieldKind::String, Value::Text(text)) => PropertyValue::String(text),
        (FieldKind::Long, Value::Integer(number)) => PropertyValue::Long(number),
        (FieldKind::Date, Value::Integer(number)) => PropertyValue::Date(number),
        (FieldKind::Boolean, Value::Integer(0)) => PropertyValue::Boolean(false),
        (FieldKind::Boolean, Value::Integer(1)) => PropertyValue::Boolean(true),
        (FieldKind::Binary, Value::Text(text)) => {
            PropertyValue::Binary(BinaryRef::parse_db(&text).ok_or_else(|| invalid("binary"))?)
        }
        (_, Value::Integer(_)) => return Err(invalid("integer")),
        (_, Value::Text(_)) => return Err(invalid("text")),
        (_, Value::Real(_)) => return Err(invalid("real")),
        (_, Value::Blob(_)) => return Err(invalid("blob")),
    };
    Ok(Some(property))
}

#[cfg(test)]
mod tests {
    use super::SqliteMapper;
    use crate::clock::SystemClock;
    use crate::db::Dialect;
    use crate::invalidation::Invalidations;
    use crate::mapper::Mapper;
    use crate::model::{Document, Model, PropertyValue, SqlInfo, StaticSchemaManager};
    use crate::RepoError;
    use rusqlite::Connection;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn mapper_for(conn: Connection) -> SqliteMapper {
        let model = Arc::new(Model::build(&StaticSchemaManager::default_content_model()).unwrap());
        let dialect = Dialect::detect(&conn).unwrap();
        let sql = Arc::new(SqlInfo::new(&model, dialect));
        SqliteMapper::new(conn, model, sql, Arc::new(SystemClock))
    }

    fn memory_mapper() -> SqliteMapper {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        let mut mapper = mapper_for(conn);
        mapper.create_database().unwrap();
        mapper
    }

    #[test]
    fn insert_read_update_delete_roundtrip() {
        let mut mapper = memory_mapper();
        let folder = Document::new(None, "docs", "Folder");
        let mut note = Document::new(Some(folder.id), "readme", "Note");
        note.set_property("dc:title", "Readme");
        note.set_property("note:pinned", true);

        mapper.begin().unwrap();
        mapper.insert_document(&folder).unwrap();
        mapper.insert_document(&note).unwrap();
        mapper.commit().unwrap();

        let loaded = mapper.read_document(note.id).unwrap().unwrap();
        assert_eq!(loaded, note);
        assert_eq!(mapper.child_ids(Some(folder.id)).unwrap(), vec![note.id]);
        assert_eq!(mapper.child_ids(None).unwrap(), vec![folder.id]);
        assert_eq!(mapper.descendant_ids(folder.id).unwrap(), vec![note.id]);

        note.set_property("note:body", "hello");
        note.clear_property("note:pinned");
        mapper.begin().unwrap();
        mapper.update_document(&note).unwrap();
        mapper.commit().unwrap();
        let loaded = mapper.read_document(note.id).unwrap().unwrap();
        assert_eq!(
            loaded.property("note:body"),
            Some(&PropertyValue::String("hello".to_string()))
        );
        assert!(loaded.property("note:pinned").is_none());

        mapper.begin().unwrap();
        mapper.delete_document(folder.id).unwrap();
        mapper.commit().unwrap();
        assert!(mapper.read_document(folder.id).unwrap().is_none());
        assert!(mapper.read_document(note.id).unwrap().is_none());
    }

    #[test]
    fn duplicate_sibling_name_is_conflict_and_rolls_back() {
        let mut mapper = memory_mapper();
        let first = Document::new(None, "same", "Folder");
        let second = Document::new(None, "same", "Folder");

        mapper.begin().unwrap();
        mapper.insert_document(&first).unwrap();
        let err = mapper.insert_document(&second).unwrap_err();
        assert!(matches!(err, RepoError::Conflict(_)));
        mapper.rollback().unwrap();

        assert!(mapper.read_document(first.id).unwrap().is_none());
    }

    #[test]
    fn parked_rows_free_their_names_until_updated() {
        let mut mapper = memory_mapper();
        let mut left = Document::new(None, "left", "Folder");
        let mut right = Document::new(None, "right", "Folder");
        mapper.begin().unwrap();
        mapper.insert_document(&left).unwrap();
        mapper.insert_document(&right).unwrap();
        mapper.commit().unwrap();

        left.name = "right".to_string();
        right.name = "left".to_string();
        mapper.begin().unwrap();
        mapper.park_document(left.id).unwrap();
        mapper.park_document(right.id).unwrap();
        mapper.update_document(&left).unwrap();
        mapper.update_document(&right).unwrap();
        mapper.commit().unwrap();

        assert_eq!(mapper.read_document(left.id).unwrap().unwrap().name, "right");
        assert_eq!(mapper.child_ids(None).unwrap(), vec![right.id, left.id]);
    }

    #[test]
    fn update_of_missing_document_is_conflict() {
        let mut mapper = memory_mapper();
        let ghost = Document::new(None, "ghost", "Folder");
        mapper.begin().unwrap();
        assert!(matches!(
            mapper.update_document(&ghost),
            Err(RepoError::Conflict(_))
        ));
        mapper.rollback().unwrap();
    }

    #[test]
    fn cluster_records_skip_origin_and_are_consumed_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.db");
        let mut node_a = mapper_for(Connection::open(&path).unwrap());
        node_a.create_database().unwrap();
        let mut node_b = mapper_for(Connection::open(&path).unwrap());

        node_a.create_cluster_node().unwrap();
        node_b.create_cluster_node().unwrap();

        let doc = Document::new(None, "x", "Folder");
        let mut set = Invalidations::new();
        set.add_modified(doc.id);
        node_a.insert_cluster_invalidations(&set).unwrap();

        assert!(node_a.get_cluster_invalidations().unwrap().is_empty());
        assert_eq!(node_b.get_cluster_invalidations().unwrap(), set);
        assert!(node_b.get_cluster_invalidations().unwrap().is_empty());

        node_b.remove_cluster_node().unwrap();
        node_a.insert_cluster_invalidations(&set).unwrap();
        let pending: i64 = Connection::open(&path)
            .unwrap()
            .query_row("SELECT COUNT(*) FROM cluster_invals", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[test]
    fn cluster_calls_require_registration() {
        let mut mapper = memory_mapper();
        assert!(matches!(
            mapper.get_cluster_invalidations(),
            Err(RepoError::ClusterSync(_))
        ));
    }

    #[test]
    fn closed_mapper_rejects_calls() {
        let mut mapper = memory_mapper();
        mapper.close();
        mapper.close();
        assert!(mapper.is_closed());
        assert!(matches!(
            mapper.child_ids(None),
            Err(RepoError::SessionClosed)
        ));
    }
}
