//! Uncommitted changes of one session.

use crate::model::{DocId, Document};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingChange {
    Created(Document),
    /// `relocated` is set once the stored parent or name changed.
    Modified { doc: Document, relocated: bool },
    Deleted,
}

impl PendingChange {
    pub(crate) fn document(&self) -> Option<&Document> {
        match self {
            Self::Created(doc) | Self::Modified { doc, .. } => Some(doc),
            Self::Deleted => None,
        }
    }

    /// Whether the stored row frees its current sibling name in this batch.
    pub(crate) fn releases_name(&self) -> bool {
        matches!(
            self,
            Self::Modified {
                relocated: true,
                ..
            } | Self::Deleted
        )
    }
}

/// Changes keyed by document, remembering first-touch order.
#[derive(Debug, Default)]
pub(crate) struct PendingChanges {
    changes: HashMap<DocId, PendingChange>,
    order: Vec<DocId>,
}

impl PendingChanges {
    pub(crate) fn get(&self, id: &DocId) -> Option<&PendingChange> {
        self.changes.get(id)
    }

    pub(crate) fn record_created(&mut self, doc: Document) {
        self.touch(doc.id);
        self.changes.insert(doc.id, PendingChange::Created(doc));
    }

    /// A modification of a not-yet-committed document stays a creation.
    pub(crate) fn record_modified(&mut self, doc: Document) {
        self.modify(doc, false);
    }

    /// Like `record_modified` for a change of parent or name.
    pub(crate) fn record_relocated(&mut self, doc: Document) {
        self.modify(doc, true);
    }

    /// Deleting a not-yet-committed document forgets it entirely.
    pub(crate) fn record_deleted(&mut self, id: DocId) {
        if let Some(PendingChange::Created(_)) = self.changes.get(&id) {
            self.changes.remove(&id);
            self.order.retain(|existing| *existing != id);
            return;
        }
        self.touch(id);
        self.changes.insert(id, PendingChange::Deleted);
    }

    /// Pending documents whose parent is `parent`.
    pub(crate) fn children_of(&self, parent: Option<DocId>) -> Vec<&Document> {
        self.order
            .iter()
            .filter_map(|id| self.changes.get(id))
            .filter_map(PendingChange::document)
            .filter(|doc| doc.parent_id == parent)
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.changes.len()
    }

    /// Removes every change, returned in first-touch order.
    pub(crate) fn take_ordered(&mut self) -> Vec<(DocId, PendingChange)> {
        let mut changes = std::mem::take(&mut self.changes);
        std::mem::take(&mut self.order)
            .into_iter()
            .filter_map(|id| changes.remove(&id).map(|change| (id, change)))
            .collect()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.changes.len();
        self.changes.clear();
        self.order.clear();
        discarded
    }

    fn modify(&mut self, doc: Document, relocated: bool) {
        let id = doc.id;
        self.touch(id);
        let change = match self.changes.get(&id) {
            Some(PendingChange::Created(_)) => PendingChange::Created(doc),
            Some(PendingChange::Modified {
                relocated: before, ..
            }) => PendingChange::Modified {
                doc,
                relocated: relocated || *before,
            },
            _ => PendingChange::Modified { doc, relocated },
        };
        self.changes.insert(id, change);
    }

    fn touch(&mut self, id: DocId) {
        if !self.changes.contains_key(&id) {
            self.order.push(id);
        }
    }
}

/// Created documents of `changes`, each placed after its pending parent.
pub(crate) fn creation_order(changes: &[(DocId, PendingChange)]) -> Vec<&Document> {
    let created: HashMap<DocId, &Document> = changes
        .iter()
        .filter_map(|(id, change)| match change {
            PendingChange::Created(doc) => Some((*id, doc)),
            _ => None,
        })
        .collect();
    let mut placed = HashSet::with_capacity(created.len());
    let mut ordered = Vec::with_capacity(created.len());
    for (id, change) in changes {
        if !matches!(change, PendingChange::Created(_)) {
            continue;
        }
        let mut lineage = Vec::new();
        let mut cursor = Some(*id);
        while let Some(current) = cursor {
            if placed.contains(&current) || lineage.contains(&current) {
                break;
            }
            match created.get(&current) {
                Some(doc) => {
                    lineage.push(current);
                    cursor = doc.parent_id;
                }
                None => break,
            }
        }
        for current in lineage.into_iter().rev() {
            placed.insert(current);
            ordered.push(created[&current]);
        }
    }
    ordered
}
