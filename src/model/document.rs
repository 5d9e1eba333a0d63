use crate::model::document_key::DocumentKey;
use crate::model::object_value::ObjectValue;
use crate::model::snapshot_version::SnapshotVersion;

/// How far a document's local data has travelled toward the server.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DocumentState {
    /// Local data matches what the server confirmed.
    Synced,
    /// Local mutations have been applied but not yet sent or acknowledged.
    LocalMutations,
    /// Mutations were acknowledged by the server but the watch stream has
    /// not caught up to the committed version yet.
    CommittedMutations,
}

/// A document that exists, with its data at a version.
#[derive(Clone, PartialEq, Debug)]
pub struct Document {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
    pub data: ObjectValue,
    pub state: DocumentState,
}

/// A document known not to exist at a version.
#[derive(Clone, PartialEq, Debug)]
pub struct NoDocument {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
    pub has_committed_mutations: bool,
}

/// A document whose contents are unknown: a write was acknowledged, but
/// the result of the mutation could not be computed locally (e.g. a patch
/// against a document we never fetched).
#[derive(Clone, PartialEq, Debug)]
pub struct UnknownDocument {
    pub key: DocumentKey,
    pub version: SnapshotVersion,
}

/// The three existence states a cached document can be in.
#[derive(Clone, PartialEq, Debug)]
pub enum MaybeDocument {
    Document(Document),
    NoDocument(NoDocument),
    UnknownDocument(UnknownDocument),
}

impl MaybeDocument {
    pub fn key(&self) -> &DocumentKey {
        match self {
            MaybeDocument::Document(doc) => &doc.key,
            MaybeDocument::NoDocument(doc) => &doc.key,
            MaybeDocument::UnknownDocument(doc) => &doc.key,
        }
    }

    pub fn version(&self) -> SnapshotVersion {
        match self {
            MaybeDocument::Document(doc) => doc.version,
            MaybeDocument::NoDocument(doc) => doc.version,
            MaybeDocument::UnknownDocument(doc) => doc.version,
        }
    }

    pub fn has_local_mutations(&self) -> bool {
        matches!(
            self,
            MaybeDocument::Document(Document {
                state: DocumentState::LocalMutations,
                ..
            })
        )
    }

    pub fn has_committed_mutations(&self) -> bool {
        match self {
            MaybeDocument::Document(doc) => doc.state == DocumentState::CommittedMutations,
            MaybeDocument::NoDocument(doc) => doc.has_committed_mutations,
            // An unknown document only ever arises from an acknowledged
            // mutation, so it always has committed mutations.
            MaybeDocument::UnknownDocument(_) => true,
        }
    }

    /// True while any kind of locally originated write is unconfirmed by
    /// the watch stream.
    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            MaybeDocument::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<Document> for MaybeDocument {
    fn from(doc: Document) -> Self {
        MaybeDocument::Document(doc)
    }
}

impl From<NoDocument> for MaybeDocument {
    fn from(doc: NoDocument) -> Self {
        MaybeDocument::NoDocument(doc)
    }
}

impl From<UnknownDocument> for MaybeDocument {
    fn from(doc: UnknownDocument) -> Self {
        MaybeDocument::UnknownDocument(doc)
    }
}
