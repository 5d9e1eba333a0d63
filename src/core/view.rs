use std::cmp::Ordering;

use crate::core::query::Query;
use crate::core::view_snapshot::{
    compare_change_types, ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange,
    SyncState, ViewSnapshot,
};
use crate::model::collections::{document_key_set, DocumentKeySet, MaybeDocumentMap};
use crate::model::document::{Document, MaybeDocument};
use crate::model::DocumentKey;
use crate::remote::remote_event::TargetChange;
use crate::remote::online_state_tracker::OnlineState;
use crate::util::assert::hard_assert;

/// Partially computed view state: the new document set and change list,
/// before they are committed by `apply_changes`.
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// Set when an incremental diff on a limited query cannot be trusted
    /// and the caller must re-run the query against the full local cache.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

/// A document entering or leaving the limbo set of a view.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of committing a diff to a view: an optional user-visible
/// snapshot plus the limbo membership changes the sync engine must track.
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Derives the visible results of one query from document diffs.
///
/// A view owns the previous result set and pending-write bookkeeping for
/// its query and turns each batch of document changes into at most one
/// `ViewSnapshot`.
pub struct View {
    query: Query,
    /// Keys the server has confirmed to be in this view's target.
    synced_documents: DocumentKeySet,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    sync_state: Option<SyncState>,
    /// Server considers this view up to date.
    current: bool,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            synced_documents,
            document_set,
            limbo_documents: document_key_set(),
            mutated_keys: document_key_set(),
            sync_state: None,
            current: false,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    /// Re-filters and re-sorts the documents named in `doc_changes`
    /// against the previous result set. Pure with respect to view state;
    /// nothing is committed until `apply_changes`.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &MaybeDocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (
                previous.change_set,
                previous.document_set,
                previous.mutated_keys,
            ),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        // When a limited query is full, a document edging past the last
        // one may push it out, and a removal may pull in a document we
        // never cached. Both invalidate the incremental diff.
        let last_doc_in_limit = match self.query.limit {
            Some(limit) if old_document_set.len() == limit => old_document_set.last().cloned(),
            _ => None,
        };

        for (key, maybe_doc) in doc_changes.iter() {
            let old_doc = old_document_set.get(key).cloned();
            let new_doc: Option<Document> = match maybe_doc {
                MaybeDocument::Document(doc) if self.query.matches(doc) => Some(doc.clone()),
                _ => None,
            };

            let old_doc_had_pending_mutations = old_doc
                .as_ref()
                .map(|_| self.mutated_keys.contains(key))
                .unwrap_or(false);
            let new_doc_has_pending_mutations = new_doc
                .as_ref()
                .map(|doc| {
                    doc.state == crate::model::document::DocumentState::LocalMutations
                        || (new_mutated_keys.contains(key)
                            && doc.state
                                == crate::model::document::DocumentState::CommittedMutations)
                })
                .unwrap_or(false);

            let mut change_applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    let docs_equal = old.data == new.data;
                    if !docs_equal {
                        if !should_wait_for_synced_document(new, old) {
                            change_set.track(DocumentViewChange {
                                doc: new.clone(),
                                change_type: ChangeType::Modified,
                            });
                            change_applied = true;
                            if let Some(last) = &last_doc_in_limit {
                                // The modified doc sorts past the limit
                                // boundary; something may take its place.
                                if self.query.compare(new, last) == Ordering::Greater {
                                    needs_refill = true;
                                }
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            doc: new.clone(),
                            change_type: ChangeType::Metadata,
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        doc: new.clone(),
                        change_type: ChangeType::Added,
                    });
                    change_applied = true;
                    if let Some(last) = &last_doc_in_limit {
                        if self.query.compare(new, last) == Ordering::Greater {
                            needs_refill = true;
                        }
                    }
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        doc: old.clone(),
                        change_type: ChangeType::Removed,
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() {
                        // A doc outside our cached window may now qualify.
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        new_document_set = new_document_set.add(new);
                        new_mutated_keys = if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit {
            while new_document_set.len() > limit {
                let Some(last) = new_document_set.last().cloned() else {
                    break;
                };
                new_document_set = new_document_set.delete(&last.key);
                new_mutated_keys = new_mutated_keys.remove(&last.key);
                change_set.track(DocumentViewChange {
                    doc: last,
                    change_type: ChangeType::Removed,
                });
            }
        }

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Commits a computed diff, producing a snapshot when the results or
    /// sync state changed and the limbo membership delta either way.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "cannot apply changes that need a refill",
        );
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.get_changes();
        changes.sort_by(|c1, c2| {
            compare_change_types(c1.change_type, c2.change_type)
                .then_with(|| self.query.compare(&c1.doc, &c2.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = Some(new_sync_state) != self.sync_state;
        self.sync_state = Some(new_sync_state);

        let snapshot = if !changes.is_empty() || sync_state_changed {
            Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
            })
        } else {
            None
        };
        ViewChange {
            snapshot,
            limbo_changes,
        }
    }

    /// Going offline drops the `current` claim; results stay but are
    /// flagged as from cache until the stream recovers.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            return self.apply_changes(
                ViewDocumentChanges {
                    document_set: self.document_set.clone(),
                    change_set: DocumentChangeSet::new(),
                    needs_refill: false,
                    mutated_keys: self.mutated_keys.clone(),
                },
                false,
                None,
            );
        }
        ViewChange {
            snapshot: None,
            limbo_changes: Vec::new(),
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        if let Some(change) = target_change {
            for key in change.added_documents.iter() {
                self.synced_documents = self.synced_documents.insert(key.clone());
            }
            for key in change.removed_documents.iter() {
                self.synced_documents = self.synced_documents.remove(key);
            }
            self.current = change.current;
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        // Limbo membership is only meaningful once the server claims the
        // view is current.
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::replace(&mut self.limbo_documents, document_key_set());
        for doc in self.document_set.iter() {
            if self.should_be_in_limbo(&doc.key) {
                self.limbo_documents = self.limbo_documents.insert(doc.key.clone());
            }
        }
        let mut changes = Vec::new();
        for key in old_limbo.iter() {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in self.limbo_documents.iter() {
            if !old_limbo.contains(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }

    /// A document is in limbo when we show it but the server has not
    /// confirmed it and no local mutation explains the difference.
    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            None => false,
            Some(doc) => {
                doc.state != crate::model::document::DocumentState::LocalMutations
            }
        }
    }

    /// Recomputes the view from a fresh query result, used after a refill.
    pub fn synchronize_with_documents(&self, docs: &MaybeDocumentMap) -> ViewDocumentChanges {
        self.compute_doc_changes(docs, None)
    }
}

fn should_wait_for_synced_document(new_doc: &Document, old_doc: &Document) -> bool {
    use crate::model::document::DocumentState::*;
    // The watch stream may echo an older committed state while a newer
    // local mutation is still pending; suppress the transient flicker.
    old_doc.state == LocalMutations
        && new_doc.state == CommittedMutations
}
