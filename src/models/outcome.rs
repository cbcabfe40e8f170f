//! Processing outcomes surfaced by the pipeline.

use super::EventId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the deduplication engine did with one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum CandidateDecision {
    /// No stored event matched; a new event was created.
    Inserted {
        /// ID of the created event.
        id: EventId,
        /// Candidate title.
        title: String,
    },
    /// A stored event matched and the candidate was fresher; the event was updated.
    Superseded {
        /// ID of the updated event.
        id: EventId,
        /// Candidate title.
        title: String,
    },
    /// A stored event matched and was at least as fresh; the candidate was dropped.
    Discarded {
        /// ID of the event that was kept.
        kept: EventId,
        /// Candidate title.
        title: String,
    },
}

impl CandidateDecision {
    /// Returns the ID of the stored event the decision refers to.
    #[must_use]
    pub const fn event_id(&self) -> EventId {
        match self {
            Self::Inserted { id, .. } | Self::Superseded { id, .. } => *id,
            Self::Discarded { kept, .. } => *kept,
        }
    }

    /// Returns the candidate's title.
    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Inserted { title, .. }
            | Self::Superseded { title, .. }
            | Self::Discarded { title, .. } => title,
        }
    }

    /// Returns the decision as a metrics label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted { .. } => "inserted",
            Self::Superseded { .. } => "superseded",
            Self::Discarded { .. } => "discarded",
        }
    }
}

/// Result of processing one email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    /// The email lacks fields processing depends on.
    MalformedEmail {
        /// Why the email was rejected.
        reason: String,
    },
    /// The message ID is already stored or currently in flight.
    DuplicateMessageId,
    /// The extractor classified the email as not announcing events.
    NotRelevant,
    /// A message in the reply chain is missing from the store.
    ThreadRootMissing,
    /// The extractor could not reach its backend.
    ExtractionNetworkError {
        /// Extractor-provided detail.
        detail: String,
    },
    /// The extractor's backend answered with something unparsable.
    ExtractionMalformedResponse {
        /// Extractor-provided detail.
        detail: String,
    },
    /// The extractor's backend refused the request.
    ExtractionRejected {
        /// Extractor-provided detail.
        detail: String,
    },
    /// The email was relevant but contained no events.
    ProcessedNoEvents,
    /// The email yielded one decision per extracted candidate.
    ProcessedWithEvents {
        /// Decisions in candidate order.
        decisions: Vec<CandidateDecision>,
    },
}

impl ProcessingOutcome {
    /// Returns the outcome as a metrics label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedEmail { .. } => "malformed_email",
            Self::DuplicateMessageId => "duplicate_message_id",
            Self::NotRelevant => "not_relevant",
            Self::ThreadRootMissing => "thread_root_missing",
            Self::ExtractionNetworkError { .. } => "extraction_network_error",
            Self::ExtractionMalformedResponse { .. } => "extraction_malformed_response",
            Self::ExtractionRejected { .. } => "extraction_rejected",
            Self::ProcessedNoEvents => "processed_no_events",
            Self::ProcessedWithEvents { .. } => "processed_with_events",
        }
    }

    /// Returns true if the email went through extraction successfully.
    #[must_use]
    pub const fn is_processed(&self) -> bool {
        matches!(
            self,
            Self::ProcessedNoEvents | Self::ProcessedWithEvents { .. }
        )
    }
}

impl fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedEmail { reason } => write!(f, "malformed_email ({reason})"),
            Self::ExtractionNetworkError { detail }
            | Self::ExtractionMalformedResponse { detail }
            | Self::ExtractionRejected { detail } => write!(f, "{} ({detail})", self.as_str()),
            Self::ProcessedWithEvents { decisions } => {
                write!(f, "processed_with_events:")?;
                for decision in decisions {
                    write!(
                        f,
                        " {}#{} {:?}",
                        decision.as_str(),
                        decision.event_id(),
                        decision.title()
                    )?;
                }
                Ok(())
            },
            _ => write!(f, "{}", self.as_str()),
        }
    }
}
