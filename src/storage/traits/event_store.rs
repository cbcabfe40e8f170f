//! Event store trait.

use crate::Result;
use crate::models::{EventId, MessageId, NewEvent, StoredEmail, StoredEvent};
use async_trait::async_trait;

/// Trait for the persistent store of processed emails and events.
///
/// The deduplication engine assumes no transactional guarantees: every
/// read-modify-write sequence it performs is serialized by the exclusion gate
/// instead.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Looks up a processed email by its message ID.
    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Option<StoredEmail>>;

    /// Returns the stored parent of `email`, or `None` if it has no parent
    /// or the parent is not stored.
    async fn find_reply_parent(&self, email: &StoredEmail) -> Result<Option<StoredEmail>> {
        match &email.in_reply_to {
            Some(parent) => self.find_by_message_id(parent).await,
            None => Ok(None),
        }
    }

    /// Returns every event whose source thread is rooted at `root`.
    async fn find_events_by_root(&self, root: &MessageId) -> Result<Vec<StoredEvent>>;

    /// Records a processed email.
    async fn insert_email(&self, email: &StoredEmail) -> Result<()>;

    /// Fetches an event by ID.
    async fn get_event(&self, id: EventId) -> Result<Option<StoredEvent>>;

    /// Creates an event and returns it with its assigned ID.
    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent>;

    /// Overwrites an existing event's fields.
    async fn update_event(&self, event: &StoredEvent) -> Result<()>;

    /// Deletes an event. Returns false if it did not exist.
    async fn delete_event(&self, id: EventId) -> Result<bool>;
}
