pub mod collections;
pub mod document;
pub mod document_key;
pub mod mutation;
pub mod mutation_batch;
pub mod object_value;
pub mod resource_path;
pub mod snapshot_version;

pub use collections::{BatchId, DocumentKeySet, ListenSequenceNumber, MaybeDocumentMap, TargetId};
pub use document::{Document, MaybeDocument, NoDocument, UnknownDocument};
pub use document_key::DocumentKey;
pub use mutation::{Mutation, MutationResult, Precondition};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use object_value::{FieldPath, ObjectValue};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
