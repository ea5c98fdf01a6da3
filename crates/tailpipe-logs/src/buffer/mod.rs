//! Columnar entry storage

mod array;
mod cache;
mod column;
mod list;

pub use array::{ArrayEntry, LogBufferArray};
pub use cache::{DEFAULT_CACHE_CAPACITY, LogEntryCache};
pub use list::{ListEntry, LogBufferList};
