//! Storage layer abstraction.
//!
//! The event store is an external collaborator of the deduplication engine.
//! Two reference adapters are provided:
//! - **Memory**: process-local maps, for tests and dry runs
//! - **`SQLite`**: durable single-file storage

// Allow significant_drop_tightening - dropping database connections slightly early
// provides no meaningful benefit.
#![allow(clippy::significant_drop_tightening)]

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;
pub use traits::EventStore;
