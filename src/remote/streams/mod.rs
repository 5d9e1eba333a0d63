mod listen;
mod write;

pub use listen::{WatchStream, WatchStreamDelegate};
pub use write::{WriteStream, WriteStreamDelegate};
