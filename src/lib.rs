//! # Dormsoup
//!
//! Concurrent deduplication engine for calendar events extracted from email.
//!
//! Mailing-list announcements arrive as bursts of near-identical messages:
//! reminders, forwards, replies with corrected rooms. Dormsoup decides which
//! of the events extracted from them are new, which supersede an event that
//! is already stored, and which should be dropped.
//!
//! ## Features
//!
//! - Causal processing order across reply threads
//! - FIFO exclusion gate around every index/store read-modify-write
//! - Embedding similarity index with snapshot persistence and backup restore
//! - Deterministic merge policy over dates, locations and receipt times
//! - Pluggable embedders, extractors and event stores
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use dormsoup::{EmailPipeline, ParsedEmail};
//!
//! let pipeline = Arc::new(EmailPipeline::new(index, embedder, extractor, store, config));
//! let outcome = pipeline.process_email(email).await?;
//! println!("{outcome}");
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
#![allow(clippy::multiple_crate_versions)]

use thiserror::Error as ThisError;

pub mod config;
pub mod embedding;
pub mod extraction;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;

pub use config::DormsoupConfig;
pub use embedding::Embedder;
pub use extraction::{Extraction, ExtractionError, Extractor};
pub use models::{
    CandidateDecision, EventCandidate, EventId, MessageId, NewEvent, ParsedEmail,
    ProcessingOutcome, StoredEmail, StoredEvent,
};
pub use services::EmailPipeline;
pub use services::deduplication::{
    DeduplicationEngine, ExclusionGate, MergeResolution, SimilarityIndex,
};
pub use services::ordering::ThreadOrderingCoordinator;
pub use storage::EventStore;

/// Error type for dormsoup operations.
///
/// # Error Variant Triggers
///
/// | Variant | Raised When |
/// |---------|-------------|
/// | `InvalidInput` | Empty titles, embedding dimension mismatch, unparsable config values |
/// | `OperationFailed` | Store queries fail, filesystem I/O fails, embedding model fails |
/// | `IndexLoad` | The similarity snapshot and its backup are both unreadable |
#[derive(Debug, ThisError)]
pub enum Error {
    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// An operation failed.
    #[error("operation '{operation}' failed: {cause}")]
    OperationFailed {
        /// The operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },

    /// The similarity index could not be loaded, even from its backup.
    ///
    /// This is fatal at startup.
    #[error("failed to load similarity index from {path}: {cause}")]
    IndexLoad {
        /// Primary snapshot path.
        path: String,
        /// Why the final attempt failed.
        cause: String,
    },
}

impl Error {
    /// Shorthand for [`Error::OperationFailed`].
    pub fn operation(operation: impl Into<String>, cause: impl ToString) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result type alias for dormsoup operations.
pub type Result<T> = std::result::Result<T, Error>;
