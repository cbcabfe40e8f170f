//! Event deduplication.
//!
//! Decides, under concurrent access, whether an extracted event candidate
//! repeats an event that is already stored.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      DeduplicationEngine                      │
//! │                                                               │
//! │   embed(title)  ──►  ExclusionGate::acquire  (FIFO)           │
//! │                           │                                   │
//! │            ┌──────────────┴──────────────┐                    │
//! │            ▼                             ▼                    │
//! │   ┌──────────────────┐         ┌──────────────────┐           │
//! │   │ SimilarityIndex  │         │   EventStore     │           │
//! │   │ title → (vector, │ ◄─────► │  get / create /  │           │
//! │   │         ids)     │  merge  │  update          │           │
//! │   └──────────────────┘ policy  └──────────────────┘           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dormsoup::services::deduplication::{DeduplicationConfig, DeduplicationEngine, SimilarityIndex};
//!
//! let engine = DeduplicationEngine::new(index, embedder, store, DeduplicationConfig::default());
//! let decision = engine.deduplicate(&candidate, &message_id, &thread_root).await?;
//! println!("{} #{}", decision.as_str(), decision.event_id());
//! ```

mod config;
mod engine;
mod gate;
mod index;
mod merge;

pub use config::{DEFAULT_NEIGHBORS, DeduplicationConfig};
pub use engine::DeduplicationEngine;
pub use gate::{ExclusionGate, GateGuard};
pub use index::{IndexEntry, Neighbor, SimilarityIndex, SnapshotPaths};
pub use merge::{
    MergeResolution, dates_compatible, is_all_day, locations_compatible, resolve,
    same_calendar_day,
};
