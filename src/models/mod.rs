//! Data models for dormsoup.
//!
//! This module contains the core data structures passed between the
//! pipeline, the deduplication engine and the external collaborators.

mod email;
mod event;
mod outcome;

pub use email::{MessageId, ParsedEmail, StoredEmail};
pub use event::{EventCandidate, EventId, NewEvent, StoredEvent};
pub use outcome::{CandidateDecision, ProcessingOutcome};
