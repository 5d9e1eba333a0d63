pub mod assert;
pub mod async_queue;
pub mod backoff;
pub mod sorted_map;
pub mod sorted_set;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use backoff::ExponentialBackoff;
pub use sorted_map::SortedMap;
pub use sorted_set::SortedSet;
