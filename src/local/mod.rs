pub mod local_documents_view;
pub mod local_store;
pub mod memory_mutation_queue;
pub mod memory_remote_document_cache;
pub mod memory_target_cache;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod target_data;

pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
pub use target_data::{TargetData, TargetPurpose};
