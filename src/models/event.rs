//! Event types and identifiers.

use super::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a stored event, assigned by the event store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(i64);

impl EventId {
    /// Creates a new event ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw integer value.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for EventId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// An event extracted from one email, not yet confirmed non-duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCandidate {
    /// Event title as written by the extractor.
    pub title: String,
    /// Start time. Midnight means the event is all-day.
    pub date_time: DateTime<Utc>,
    /// Free-form location, `"unknown"` when the email does not say.
    pub location: String,
    /// Hosting group or person.
    #[serde(default)]
    pub organizer: String,
    /// Duration in minutes.
    #[serde(default)]
    pub duration_minutes: u32,
    /// Receipt time of the email the candidate was extracted from.
    pub source_received_at: DateTime<Utc>,
}

/// Fields needed to create a stored event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    /// Event title.
    pub title: String,
    /// Start time.
    pub date_time: DateTime<Utc>,
    /// Location.
    pub location: String,
    /// Organizer.
    pub organizer: String,
    /// Duration in minutes.
    pub duration_minutes: u32,
    /// Receipt time of the source email.
    pub source_received_at: DateTime<Utc>,
    /// Message the event was extracted from.
    pub source_message_id: MessageId,
    /// Root of the source message's reply thread.
    pub thread_root: MessageId,
}

impl NewEvent {
    /// Builds a new event from a candidate and the message it came from.
    #[must_use]
    pub fn from_candidate(
        candidate: &EventCandidate,
        source_message_id: MessageId,
        thread_root: MessageId,
    ) -> Self {
        Self {
            title: candidate.title.clone(),
            date_time: candidate.date_time,
            location: candidate.location.clone(),
            organizer: candidate.organizer.clone(),
            duration_minutes: candidate.duration_minutes,
            source_received_at: candidate.source_received_at,
            source_message_id,
            thread_root,
        }
    }

    /// Attaches a store-assigned ID.
    #[must_use]
    pub fn with_id(self, id: EventId) -> StoredEvent {
        StoredEvent {
            id,
            title: self.title,
            date_time: self.date_time,
            location: self.location,
            organizer: self.organizer,
            duration_minutes: self.duration_minutes,
            source_received_at: self.source_received_at,
            source_message_id: self.source_message_id,
            thread_root: self.thread_root,
        }
    }
}

/// A persisted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Store-assigned ID.
    pub id: EventId,
    /// Event title.
    pub title: String,
    /// Start time.
    pub date_time: DateTime<Utc>,
    /// Location.
    pub location: String,
    /// Organizer.
    pub organizer: String,
    /// Duration in minutes.
    pub duration_minutes: u32,
    /// Receipt time of the email the current fields came from.
    pub source_received_at: DateTime<Utc>,
    /// Message the current fields came from.
    pub source_message_id: MessageId,
    /// Root of the source message's reply thread.
    pub thread_root: MessageId,
}

impl StoredEvent {
    /// Overwrites this event's fields with a fresher candidate, keeping the ID.
    pub fn supersede_with(
        &mut self,
        candidate: &EventCandidate,
        source_message_id: MessageId,
        thread_root: MessageId,
    ) {
        self.title.clone_from(&candidate.title);
        self.date_time = candidate.date_time;
        self.location.clone_from(&candidate.location);
        self.organizer.clone_from(&candidate.organizer);
        self.duration_minutes = candidate.duration_minutes;
        self.source_received_at = candidate.source_received_at;
        self.source_message_id = source_message_id;
        self.thread_root = thread_root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    #[test]
    fn test_supersede_keeps_id() {
        let mut stored = NewEvent {
            title: "Pottery night".to_string(),
            date_time: at(1_000),
            location: "Basement".to_string(),
            organizer: "Arts".to_string(),
            duration_minutes: 60,
            source_received_at: at(10),
            source_message_id: MessageId::new("a@x"),
            thread_root: MessageId::new("a@x"),
        }
        .with_id(EventId::new(7));

        let candidate = EventCandidate {
            title: "Pottery night (moved)".to_string(),
            date_time: at(2_000),
            location: "Lounge".to_string(),
            organizer: "Arts".to_string(),
            duration_minutes: 90,
            source_received_at: at(20),
        };
        stored.supersede_with(&candidate, MessageId::new("b@x"), MessageId::new("a@x"));

        assert_eq!(stored.id, EventId::new(7));
        assert_eq!(stored.title, "Pottery night (moved)");
        assert_eq!(stored.location, "Lounge");
        assert_eq!(stored.duration_minutes, 90);
        assert_eq!(stored.source_received_at, at(20));
        assert_eq!(stored.source_message_id.as_str(), "b@x");
    }

    #[test]
    fn test_event_id_serde_is_transparent() {
        let json = serde_json::to_string(&EventId::new(42)).unwrap_or_default();
        assert_eq!(json, "42");
    }
}
