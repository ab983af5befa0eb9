//! Per-session document cache.
//!
//! # Invariants
//! - Every applied invalidation bumps the epoch.
//! - A backend read or a committed write may only be cached if no
//!   invalidation arrived since it started (`insert_if_current`).

use crate::invalidation::Invalidations;
use crate::model::{DocId, Document};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct DocumentCache {
    entries: HashMap<DocId, Document>,
    epoch: u64,
}

impl DocumentCache {
    pub(crate) fn get(&self, id: &DocId) -> Option<Document> {
        self.entries.get(id).cloned()
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Caches a backend read started at `epoch`. Returns `false` when the read
    /// raced with an invalidation and was dropped.
    pub(crate) fn insert_if_current(&mut self, epoch: u64, doc: Document) -> bool {
        if epoch != self.epoch {
            return false;
        }
        self.entries.insert(doc.id, doc);
        true
    }

    pub(crate) fn evict(&mut self, id: &DocId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Evicts every invalidated id and returns how many were cached.
    pub(crate) fn apply(&mut self, invalidations: &Invalidations) -> usize {
        self.epoch += 1;
        invalidations
            .iter()
            .filter(|(id, _)| self.entries.remove(id).is_some())
            .count()
    }

    pub(crate) fn clear(&mut self) -> usize {
        self.epoch += 1;
        let dropped = self.entries.len();
        self.entries.clear();
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn contains(&self, id: &DocId) -> bool {
        self.entries.contains_key(id)
    }
}
