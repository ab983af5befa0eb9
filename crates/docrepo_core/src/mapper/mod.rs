//! Data mapper contract and SQLite implementation.
//!
//! # Responsibility
//! - Translate document reads/writes into backend statements for exactly one
//!   session, or for cluster bookkeeping when used as the cluster mapper.
//! - Persist and consume cluster invalidation records.
//!
//! # Invariants
//! - A mapper owns exactly one backend connection and is never shared
//!   between sessions.
//! - Write paths run between `begin` and `commit`/`rollback`.
//! - Cluster operations require a prior `create_cluster_node`.

use crate::error::RepoResult;
use crate::invalidation::Invalidations;
use crate::model::{DocId, Document};

mod sqlite_mapper;

pub use sqlite_mapper::SqliteMapper;

/// Identity of one process in the cluster invalidation protocol.
pub type ClusterNodeId = String;

/// Unit-of-work-scoped data access.
pub trait Mapper: Send {
    /// Idempotent schema bootstrap.
    fn create_database(&mut self) -> RepoResult<()>;
    /// Registers this process as a cluster node and returns its id.
    fn create_cluster_node(&mut self) -> RepoResult<ClusterNodeId>;
    /// Deregisters the node and drops its pending records.
    fn remove_cluster_node(&mut self) -> RepoResult<()>;
    /// Queues `invalidations` for every other registered node.
    fn insert_cluster_invalidations(&mut self, invalidations: &Invalidations) -> RepoResult<()>;
    /// Fetches and acknowledges every record queued for this node.
    fn get_cluster_invalidations(&mut self) -> RepoResult<Invalidations>;

    fn read_document(&mut self, id: DocId) -> RepoResult<Option<Document>>;
    /// Ids of the direct children of `parent`, or of root-level documents.
    fn child_ids(&mut self, parent: Option<DocId>) -> RepoResult<Vec<DocId>>;
    /// Ids of every document below `id`, excluding `id`.
    fn descendant_ids(&mut self, id: DocId) -> RepoResult<Vec<DocId>>;

    fn begin(&mut self) -> RepoResult<()>;
    fn insert_document(&mut self, doc: &Document) -> RepoResult<()>;
    fn update_document(&mut self, doc: &Document) -> RepoResult<()>;
    /// Renames the stored row to a name no document can take, freeing its
    /// sibling name for the rest of the transaction. Missing rows are ignored.
    fn park_document(&mut self, id: DocId) -> RepoResult<()>;
    fn delete_document(&mut self, id: DocId) -> RepoResult<()>;
    fn commit(&mut self) -> RepoResult<()>;
    fn rollback(&mut self) -> RepoResult<()>;

    /// Releases the backend connection. Further calls fail.
    fn close(&mut self);
    fn is_closed(&self) -> bool;
}
