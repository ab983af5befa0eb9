//! Invalidation sets.
//!
//! # Responsibility
//! - Accumulate "this document changed" facts produced by one commit or one
//!   cluster poll.
//!
//! # Invariants
//! - Merging resolves to `Deleted` if either side says deleted.
//! - Merge is commutative and idempotent; the empty set is a no-op.

use crate::model::DocId;
use std::collections::btree_map::{self, BTreeMap};

/// Change kind carried by one invalidation. Ordered so that `max` merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InvalidationKind {
    Modified,
    Deleted,
}

impl InvalidationKind {
    pub fn as_db(self) -> &'static str {
        match self {
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse_db(value: &str) -> Option<Self> {
        match value {
            "modified" => Some(Self::Modified),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Mergeable set of document invalidations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidations {
    entries: BTreeMap<DocId, InvalidationKind>,
}

impl Invalidations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: DocId, kind: InvalidationKind) {
        self.entries
            .entry(id)
            .and_modify(|existing| *existing = (*existing).max(kind))
            .or_insert(kind);
    }

    pub fn add_modified(&mut self, id: DocId) {
        self.add(id, InvalidationKind::Modified);
    }

    pub fn add_deleted(&mut self, id: DocId) {
        self.add(id, InvalidationKind::Deleted);
    }

    pub fn merge(&mut self, other: &Invalidations) {
        for (id, kind) in &other.entries {
            self.add(*id, *kind);
        }
    }

    /// Returns the merge of `self` and `other` without mutating either.
    pub fn merged(&self, other: &Invalidations) -> Invalidations {
        let mut result = self.clone();
        result.merge(other);
        result
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn kind_of(&self, id: &DocId) -> Option<InvalidationKind> {
        self.entries.get(id).copied()
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DocId, &InvalidationKind)> {
        self.entries.iter()
    }
}

impl FromIterator<(DocId, InvalidationKind)> for Invalidations {
    fn from_iter<T: IntoIterator<Item = (DocId, InvalidationKind)>>(iter: T) -> Self {
        let mut invalidations = Self::new();
        for (id, kind) in iter {
            invalidations.add(id, kind);
        }
        invalidations
    }
}

impl IntoIterator for Invalidations {
    type Item = (DocId, InvalidationKind);
    type IntoIter = btree_map::IntoIter<DocId, InvalidationKind>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}
