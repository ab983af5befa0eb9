//! Session: one unit of work against the repository.
//!
//! # Responsibility
//! - Serve document reads through a private cache backed by one mapper.
//! - Buffer writes until `commit`, then flush them in one backend
//!   transaction and announce the result to the repository.
//!
//! # Invariants
//! - Cache entries named by an applied invalidation are never served again
//!   without a fresh backend read.
//! - A failed commit announces nothing and leaves no pending state.
//! - Every operation on a closed session fails with `SessionClosed`.
//!
//! # See also
//! - crate::repository for fan-out and cluster propagation.

mod cache;
mod pending;

use crate::binary::BinaryRef;
use crate::error::{RepoError, RepoResult};
use crate::invalidation::{InvalidationKind, Invalidations};
use crate::mapper::Mapper;
use crate::model::{DocId, Document, Model, PropertyValue};
use crate::repository::RepositoryInner;
use cache::DocumentCache;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use pending::{creation_order, PendingChange, PendingChanges};
use std::collections::HashSet;
use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Process-unique session number, assigned by the repository.
pub type SessionId = u64;

/// Caller identity passed to `Repository::get_connection`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    password: Option<String>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            user: user.into(),
            password,
        }
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***REDACTED***"))
            .finish()
    }
}

/// Session state shared with the repository's live-session set.
pub(crate) struct SessionState {
    id: SessionId,
    live: AtomicBool,
    mapper: Mutex<Option<Box<dyn Mapper>>>,
    cache: Mutex<DocumentCache>,
}

impl SessionState {
    pub(crate) fn new(id: SessionId, mapper: Box<dyn Mapper>) -> Self {
        Self {
            id,
            live: AtomicBool::new(true),
            mapper: Mutex::new(Some(mapper)),
            cache: Mutex::new(DocumentCache::default()),
        }
    }

    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    pub(crate) fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Evicts invalidated documents. Returns how many were cached.
    pub(crate) fn invalidate(&self, invalidations: &Invalidations) -> usize {
        let evicted = self.cache.lock().apply(invalidations);
        trace!(
            "event=session_invalidate module=session status=ok session_id={} received={} evicted={}",
            self.id,
            invalidations.len(),
            evicted
        );
        evicted
    }

    pub(crate) fn clear_caches(&self) -> usize {
        self.cache.lock().clear()
    }

    /// Marks the session closed and releases its mapper.
    ///
    /// Returns `false` when the session was already closed.
    pub(crate) fn close(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(mut mapper) = self.mapper.lock().take() {
            mapper.close();
        }
        self.cache.lock().clear();
        true
    }

    fn with_mapper<T>(
        &self,
        operation: impl FnOnce(&mut dyn Mapper) -> RepoResult<T>,
    ) -> RepoResult<T> {
        let mut guard = self.mapper.lock();
        let mapper = guard.as_mut().ok_or(RepoError::SessionClosed)?;
        operation(mapper.as_mut())
    }
}

/// A unit of work obtained from `Repository::get_connection`.
///
/// Dropping a session closes it; uncommitted changes are discarded.
pub struct Session {
    state: Arc<SessionState>,
    repository: Arc<RepositoryInner>,
    model: Arc<Model>,
    credentials: Option<Credentials>,
    pending: PendingChanges,
}

impl Session {
    pub(crate) fn new(
        state: Arc<SessionState>,
        repository: Arc<RepositoryInner>,
        model: Arc<Model>,
        credentials: Option<Credentials>,
    ) -> Self {
        Self {
            state,
            repository,
            model,
            credentials,
            pending: PendingChanges::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.state.id()
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Reads a document: pending changes first, then cache, then backend.
    ///
    /// # Errors
    /// - `NotFound` when the document does not exist or is pending deletion.
    pub fn get_document(&self, id: DocId) -> RepoResult<Document> {
        self.ensure_live()?;
        if let Some(change) = self.pending.get(&id) {
            return change.document().cloned().ok_or(RepoError::NotFound(id));
        }

        let epoch = {
            let cache = self.state.cache.lock();
            if let Some(doc) = cache.get(&id) {
                return Ok(doc);
            }
            cache.epoch()
        };

        let doc = self
            .state
            .with_mapper(|mapper| mapper.read_document(id))?
            .ok_or(RepoError::NotFound(id))?;
        self.state.cache.lock().insert_if_current(epoch, doc.clone());
        Ok(doc)
    }

    /// Lists the children of `parent` (root level for `None`) by name,
    /// including this session's uncommitted changes.
    pub fn get_children(&self, parent: Option<DocId>) -> RepoResult<Vec<Document>> {
        self.ensure_live()?;
        if let Some(parent_id) = parent {
            self.get_document(parent_id)?;
        }

        let backend_ids = self.state.with_mapper(|mapper| mapper.child_ids(parent))?;
        let mut seen = HashSet::new();
        let mut children = Vec::with_capacity(backend_ids.len());
        for id in backend_ids {
            match self.get_document(id) {
                Ok(doc) if doc.parent_id == parent => {
                    seen.insert(doc.id);
                    children.push(doc);
                }
                Ok(_) | Err(RepoError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        for doc in self.pending.children_of(parent) {
            if seen.insert(doc.id) {
                children.push(doc.clone());
            }
        }
        children.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(children)
    }

    /// Creates a document below `parent`. Visible to other sessions after
    /// `commit`.
    pub fn create_document(
        &mut self,
        parent: Option<DocId>,
        name: &str,
        doc_type: &str,
    ) -> RepoResult<Document> {
        self.ensure_live()?;
        if let Some(parent_id) = parent {
            self.get_document(parent_id)?;
        }
        let doc = Document::new(parent, name, doc_type);
        self.model.validate_document(&doc)?;
        self.pending.record_created(doc.clone());
        Ok(doc)
    }

    pub fn set_property(
        &mut self,
        id: DocId,
        key: &str,
        value: impl Into<PropertyValue>,
    ) -> RepoResult<Document> {
        let mut doc = self.get_document(id)?;
        let value = value.into();
        self.model.validate_property(&doc.doc_type, key, &value)?;
        doc.set_property(key, value);
        self.pending.record_modified(doc.clone());
        Ok(doc)
    }

    pub fn clear_property(&mut self, id: DocId, key: &str) -> RepoResult<Document> {
        let mut doc = self.get_document(id)?;
        if doc.clear_property(key).is_some() {
            self.pending.record_modified(doc.clone());
        }
        Ok(doc)
    }

    /// Replaces name and properties of an existing document.
    ///
    /// # Errors
    /// - `Validation` when the type or parent differs from the stored document;
    ///   use `move_document` to reparent.
    pub fn update_document(&mut self, doc: &Document) -> RepoResult<()> {
        let current = self.get_document(doc.id)?;
        if current.doc_type != doc.doc_type {
            return Err(RepoError::Validation(format!(
                "document type cannot change from `{}` to `{}`",
                current.doc_type, doc.doc_type
            )));
        }
        if current.parent_id != doc.parent_id {
            return Err(RepoError::Validation(
                "use move_document to change the parent".to_string(),
            ));
        }
        self.model.validate_document(doc)?;
        if current.name == doc.name {
            self.pending.record_modified(doc.clone());
        } else {
            self.pending.record_relocated(doc.clone());
        }
        Ok(())
    }

    /// Reparents and optionally renames a document.
    pub fn move_document(
        &mut self,
        id: DocId,
        new_parent: Option<DocId>,
        new_name: Option<&str>,
    ) -> RepoResult<Document> {
        let mut doc = self.get_document(id)?;
        let mut ancestor = new_parent;
        while let Some(ancestor_id) = ancestor {
            if ancestor_id == id {
                return Err(RepoError::Validation(format!(
                    "cannot move document {id} below itself"
                )));
            }
            ancestor = self.get_document(ancestor_id)?.parent_id;
        }

        doc.parent_id = new_parent;
        if let Some(name) = new_name {
            doc.name = name.to_string();
        }
        self.model.validate_document(&doc)?;
        self.pending.record_relocated(doc.clone());
        Ok(doc)
    }

    /// Removes a document and its whole subtree. Returns the number of
    /// documents removed.
    pub fn remove_document(&mut self, id: DocId) -> RepoResult<usize> {
        self.get_document(id)?;
        let mut subtree = vec![id];
        let mut cursor = 0;
        while cursor < subtree.len() {
            let children = self.get_children(Some(subtree[cursor]))?;
            subtree.extend(children.into_iter().map(|child| child.id));
            cursor += 1;
        }
        for removed in subtree.iter().rev() {
            self.pending.record_deleted(*removed);
        }
        Ok(subtree.len())
    }

    /// Stores stream content in the binary store and references it from the
    /// property `key`.
    pub fn set_binary(
        &mut self,
        id: DocId,
        key: &str,
        input: &mut dyn Read,
    ) -> RepoResult<BinaryRef> {
        self.ensure_live()?;
        let binary = self.repository.binary_manager()?.get_binary(input)?;
        self.set_property(id, key, PropertyValue::Binary(binary.clone()))?;
        Ok(binary)
    }

    pub fn read_binary(&self, binary: &BinaryRef) -> RepoResult<Vec<u8>> {
        self.ensure_live()?;
        self.repository.binary_manager()?.read(binary)
    }

    /// Flushes pending changes in one backend transaction and announces
    /// them to the other sessions.
    ///
    /// # Errors
    /// - `Conflict` when the backend rejects the changes.
    /// - `Connectivity` on any other backend failure.
    ///
    /// On error nothing is announced and pending changes are discarded.
    pub fn commit(&mut self) -> RepoResult<()> {
        self.ensure_live()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        let started_at = Instant::now();
        let changes = self.pending.take_ordered();
        let epoch = self.state.cache.lock().epoch();

        let flushed = self.state.with_mapper(|mapper| flush(mapper, &changes));
        let invalidations = match flushed {
            Ok(invalidations) => invalidations,
            Err(err) => {
                let mut cache = self.state.cache.lock();
                for (id, _) in &changes {
                    cache.evict(id);
                }
                drop(cache);
                warn!(
                    "event=session_commit module=session status=error session_id={} changes={} duration_ms={} error={}",
                    self.id(),
                    changes.len(),
                    started_at.elapsed().as_millis(),
                    err
                );
                return Err(err);
            }
        };

        cache_committed(&mut self.state.cache.lock(), epoch, &changes, &invalidations);

        self.repository.invalidate(&invalidations, Some(self.id()));
        info!(
            "event=session_commit module=session status=ok session_id={} changes={} invalidations={} duration_ms={}",
            self.id(),
            changes.len(),
            invalidations.len(),
            started_at.elapsed().as_millis()
        );
        Ok(())
    }

    /// Discards pending changes. Returns how many were dropped.
    pub fn rollback(&mut self) -> RepoResult<usize> {
        self.ensure_live()?;
        let discarded = self.pending.clear();
        debug!(
            "event=session_rollback module=session status=ok session_id={} discarded={}",
            self.id(),
            discarded
        );
        Ok(discarded)
    }

    /// Closes the session; repeated calls are no-ops.
    pub fn close(&mut self) {
        let discarded = self.pending.clear();
        if self.state.close() {
            self.repository.close_session(self.id());
            info!(
                "event=session_close module=session status=ok session_id={} discarded={}",
                self.id(),
                discarded
            );
        }
    }

    pub fn clear_caches(&self) -> usize {
        self.state.clear_caches()
    }

    pub fn cached_count(&self) -> usize {
        self.state.cache.lock().len()
    }

    pub fn is_cached(&self, id: DocId) -> bool {
        self.state.cache.lock().contains(&id)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    fn ensure_live(&self) -> RepoResult<()> {
        if self.state.is_live() {
            Ok(())
        } else {
            Err(RepoError::SessionClosed)
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("live", &self.is_live())
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Runs `changes` inside one backend transaction: inserts with parents
/// first, then updates, then deletes. Rolls back on any failure.
fn flush(mapper: &mut dyn Mapper, changes: &[(DocId, PendingChange)]) -> RepoResult<Invalidations> {
    mapper.begin()?;
    let applied = apply_changes(mapper, changes).and_then(|invalidations| {
        mapper.commit()?;
        Ok(invalidations)
    });
    if applied.is_err() {
        if let Err(err) = mapper.rollback() {
            warn!(
                "event=session_rollback module=session status=error error={}",
                err
            );
        }
    }
    applied
}

fn apply_changes(
    mapper: &mut dyn Mapper,
    changes: &[(DocId, PendingChange)],
) -> RepoResult<Invalidations> {
    let mut invalidations = Invalidations::new();
    // Moved, renamed and deleted rows give up their names first so that
    // swaps and name reuse inside one batch never hit the sibling index.
    for (id, change) in changes {
        if change.releases_name() {
            mapper.park_document(*id)?;
        }
    }
    for doc in creation_order(changes) {
        mapper.insert_document(doc)?;
        invalidations.add_modified(doc.id);
    }
    for (_, change) in changes {
        if let PendingChange::Modified { doc, .. } = change {
            mapper.update_document(doc)?;
            invalidations.add_modified(doc.id);
        }
    }
    for (id, change) in changes {
        if let PendingChange::Deleted = change {
            // Rows created by other sessions since our read are removed by
            // the cascade and must be announced too.
            for descendant in mapper.descendant_ids(*id)? {
                invalidations.add_deleted(descendant);
            }
            mapper.delete_document(*id)?;
            invalidations.add_deleted(*id);
        }
    }
    Ok(invalidations)
}

/// Caches what this session just committed unless an invalidation was
/// applied since the commit started; in that case the entries are dropped.
fn cache_committed(
    cache: &mut DocumentCache,
    epoch: u64,
    changes: &[(DocId, PendingChange)],
    invalidations: &Invalidations,
) {
    for (id, change) in changes {
        match change.document() {
            Some(doc) => {
                if !cache.insert_if_current(epoch, doc.clone()) {
                    cache.evict(id);
                }
            }
            None => {
                cache.evict(id);
            }
        }
    }
    for (id, kind) in invalidations.iter() {
        if *kind == InvalidationKind::Deleted {
            cache.evict(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::cache::DocumentCache;
    use super::cache_committed;
    use super::pending::PendingChange;
    use crate::invalidation::Invalidations;
    use crate::model::Document;

    #[test]
    fn committed_state_is_cached_when_nothing_intervened() {
        let mut cache = DocumentCache::default();
        let doc = Document::new(None, "mine", "Folder");
        let epoch = cache.epoch();

        let changes = vec![(doc.id, PendingChange::Created(doc.clone()))];
        cache_committed(&mut cache, epoch, &changes, &Invalidations::new());
        assert_eq!(cache.get(&doc.id), Some(doc));
    }

    #[test]
    fn newer_commit_from_another_session_wins_over_own_committed_state() {
        let mut cache = DocumentCache::default();
        let mut doc = Document::new(None, "shared", "Note");
        doc.set_property("dublincore:title", "v1");
        let epoch = cache.epoch();

        // Another session commits v2 after our backend commit and before we
        // take the cache lock.
        let mut theirs = Invalidations::new();
        theirs.add_modified(doc.id);
        cache.apply(&theirs);

        let changes = vec![(
            doc.id,
            PendingChange::Modified {
                doc: doc.clone(),
                relocated: false,
            },
        )];
        cache_committed(&mut cache, epoch, &changes, &Invalidations::new());
        assert!(!cache.contains(&doc.id));
    }
}
