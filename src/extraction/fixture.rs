//! Replay extractor backed by pre-extracted records.

use super::{Extraction, ExtractionError, Extractor};
use crate::models::{EventCandidate, MessageId, ParsedEmail, StoredEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event as recorded by an earlier extraction run.
///
/// The receipt time is not part of the record; it is taken from the email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureEvent {
    /// Event title.
    pub title: String,
    /// Start time.
    pub date_time: DateTime<Utc>,
    /// Location.
    #[serde(default = "unknown_location")]
    pub location: String,
    /// Organizer.
    #[serde(default)]
    pub organizer: String,
    /// Duration in minutes.
    #[serde(default)]
    pub duration_minutes: u32,
}

fn unknown_location() -> String {
    "unknown".to_string()
}

impl FixtureEvent {
    /// Converts into a candidate extracted from an email received at `received_at`.
    #[must_use]
    pub fn into_candidate(self, received_at: DateTime<Utc>) -> EventCandidate {
        EventCandidate {
            title: self.title,
            date_time: self.date_time,
            location: self.location,
            organizer: self.organizer,
            duration_minutes: self.duration_minutes,
            source_received_at: received_at,
        }
    }
}

/// Recorded extraction result for one email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractionFixture {
    /// The email announced these events.
    Events {
        /// Extracted events.
        #[serde(default)]
        events: Vec<FixtureEvent>,
    },
    /// The email was classified as not announcing events.
    NotRelevant,
    /// The network call failed.
    NetworkError {
        /// Failure detail.
        #[serde(default)]
        detail: String,
    },
    /// The backend response did not parse.
    MalformedResponse {
        /// Failure detail.
        #[serde(default)]
        detail: String,
    },
    /// The backend refused the request.
    Rejected {
        /// Failure detail.
        #[serde(default)]
        detail: String,
    },
}

/// One inbound message for replay: the parsed email and its extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundRecord {
    /// The parsed email.
    pub email: ParsedEmail,
    /// What extraction produced for it.
    pub extraction: ExtractionFixture,
}

/// Extractor that answers from recorded extraction results.
#[derive(Debug, Clone, Default)]
pub struct FixtureExtractor {
    fixtures: HashMap<MessageId, ExtractionFixture>,
}

impl FixtureExtractor {
    /// Creates an empty extractor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an extractor from replay records.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a InboundRecord>) -> Self {
        let fixtures = records
            .into_iter()
            .map(|r| (r.email.message_id.clone(), r.extraction.clone()))
            .collect();
        Self { fixtures }
    }

    /// Registers the recorded result for a message.
    #[must_use]
    pub fn with_fixture(mut self, message_id: MessageId, fixture: ExtractionFixture) -> Self {
        self.fixtures.insert(message_id, fixture);
        self
    }
}

#[async_trait]
impl Extractor for FixtureExtractor {
    async fn extract(
        &self,
        email: &ParsedEmail,
        _thread_events: &[StoredEvent],
    ) -> Result<Extraction, ExtractionError> {
        let Some(fixture) = self.fixtures.get(&email.message_id) else {
            return Err(ExtractionError::MalformedResponse(format!(
                "no recorded extraction for {}",
                email.message_id
            )));
        };

        match fixture.clone() {
            ExtractionFixture::Events { events } => Ok(Extraction::Events(
                events
                    .into_iter()
                    .map(|e| e.into_candidate(email.received_at))
                    .collect(),
            )),
            ExtractionFixture::NotRelevant => Ok(Extraction::NotRelevant),
            ExtractionFixture::NetworkError { detail } => Err(ExtractionError::Network(detail)),
            ExtractionFixture::MalformedResponse { detail } => {
                Err(ExtractionError::MalformedResponse(detail))
            },
            ExtractionFixture::Rejected { detail } => Err(ExtractionError::Rejected(detail)),
        }
    }
}
