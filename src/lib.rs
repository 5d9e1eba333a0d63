//! Client-side synchronization engine for Firestore-style document stores.
//!
//! The crate keeps a local, offline-capable replica of a remote document
//! store in sync with a server-driven watch/write protocol. User writes are
//! applied optimistically against the local caches, queries are evaluated
//! into ordered snapshots, and a watch stream reconciles the replica with
//! the backend, including "limbo" resolution for documents the server has
//! not confirmed.
//!
//! All engine state is mutated through a single cooperative
//! [`AsyncQueue`](util::async_queue::AsyncQueue); network callbacks, timers
//! and user calls are funneled onto it so that the engine behaves like a
//! single-threaded actor.

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod util;

pub use crate::core::sync_engine::SyncEngine;
pub use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use crate::local::local_store::LocalStore;
pub use crate::remote::remote_store::RemoteStore;
