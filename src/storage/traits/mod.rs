//! Storage backend traits.

mod event_store;

pub use event_store::EventStore;
