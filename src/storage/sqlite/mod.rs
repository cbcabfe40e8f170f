//! `SQLite` event store.
//!
//! ## Module Structure
//!
//! - [`connection`]: lock acquisition with poison recovery and pragma setup
//! - [`metrics`]: per-operation counters and latency histograms
//! - `event_store`: the [`EventStore`](crate::storage::traits::EventStore) implementation

mod connection;
mod event_store;
mod metrics;

pub use connection::{acquire_lock, configure_connection};
pub use event_store::SqliteEventStore;
pub use metrics::record_operation_metrics;
