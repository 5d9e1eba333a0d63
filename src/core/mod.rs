pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use query::{Direction, Filter, FilterOp, OrderBy, Query};
pub use sync_engine::{PendingWrite, SnapshotListener, SyncEngine};
pub use target::Target;
pub use view_snapshot::{ChangeType, DocumentSet, DocumentViewChange, SyncState, ViewSnapshot};
