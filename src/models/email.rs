//! Email types and identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// RFC 5322 `Message-ID` of an email, without surrounding angle brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Creates a new message ID, trimming whitespace and angle brackets.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        let trimmed = id
            .as_ref()
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>');
        Self(trimmed.to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// An inbound email after MIME parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedEmail {
    /// The message's own ID.
    pub message_id: MessageId,
    /// The `In-Reply-To` header, if this is a reply.
    #[serde(default)]
    pub in_reply_to: Option<MessageId>,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Sender address.
    pub sender: String,
    /// Plain-text body.
    #[serde(default)]
    pub body: String,
    /// When the mailbox received the message.
    pub received_at: DateTime<Utc>,
}

impl ParsedEmail {
    /// Checks that the email carries everything processing relies on.
    ///
    /// Returns the reason the email is malformed, or `None` if it is usable.
    #[must_use]
    pub fn malformed_reason(&self) -> Option<&'static str> {
        if self.message_id.is_empty() {
            return Some("missing Message-ID");
        }
        if self.sender.trim().is_empty() {
            return Some("missing sender");
        }
        if self.subject.trim().is_empty() && self.body.trim().is_empty() {
            return Some("empty subject and body");
        }
        match &self.in_reply_to {
            Some(parent) if parent.is_empty() => Some("empty In-Reply-To"),
            Some(parent) if parent == &self.message_id => Some("message replies to itself"),
            _ => None,
        }
    }

    /// Returns true if this email is a reply.
    #[must_use]
    pub const fn is_reply(&self) -> bool {
        self.in_reply_to.is_some()
    }
}

/// The store's record of a processed email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEmail {
    /// The message's own ID.
    pub message_id: MessageId,
    /// Parent message, if this is a reply.
    pub in_reply_to: Option<MessageId>,
    /// Earliest message of the reply chain (itself for a thread start).
    pub thread_root: MessageId,
    /// Subject line.
    pub subject: String,
    /// Sender address.
    pub sender: String,
    /// When the mailbox received the message.
    pub received_at: DateTime<Utc>,
}

impl StoredEmail {
    /// Builds the stored record for a parsed email anchored at `thread_root`.
    #[must_use]
    pub fn from_parsed(email: &ParsedEmail, thread_root: MessageId) -> Self {
        Self {
            message_id: email.message_id.clone(),
            in_reply_to: email.in_reply_to.clone(),
            thread_root,
            subject: email.subject.clone(),
            sender: email.sender.clone(),
            received_at: email.received_at,
        }
    }
}
