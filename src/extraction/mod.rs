//! Event extraction boundary.
//!
//! Classification and extraction are performed by an external language model.
//! The pipeline only sees this trait: an email goes in, event candidates or a
//! classified failure come out. Retry policy belongs to the implementation.

mod fixture;

pub use fixture::{ExtractionFixture, FixtureEvent, FixtureExtractor, InboundRecord};

use crate::models::{EventCandidate, ParsedEmail, StoredEvent};
use async_trait::async_trait;
use thiserror::Error as ThisError;

/// Successful extraction result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// The email does not announce events.
    NotRelevant,
    /// Candidates found in the email, possibly none.
    Events(Vec<EventCandidate>),
}

/// Extraction failure, surfaced unchanged to the pipeline's caller.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ExtractionError {
    /// The backend could not be reached.
    #[error("extraction network error: {0}")]
    Network(String),
    /// The backend answered with something that does not parse.
    #[error("malformed extraction response: {0}")]
    MalformedResponse(String),
    /// The backend refused the request (content policy, quota).
    #[error("extraction rejected: {0}")]
    Rejected(String),
}

/// Trait for event extraction providers.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Extracts event candidates from an email.
    ///
    /// `thread_events` holds the events already stored for the email's reply
    /// thread, so that a reply ("room changed to 4-231") can be read in context.
    ///
    /// # Errors
    ///
    /// Returns an [`ExtractionError`] classifying why extraction failed.
    async fn extract(
        &self,
        email: &ParsedEmail,
        thread_events: &[StoredEvent],
    ) -> std::result::Result<Extraction, ExtractionError>;
}
