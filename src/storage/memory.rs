//! In-memory event store.

use crate::models::{EventId, MessageId, NewEvent, StoredEmail, StoredEvent};
use crate::storage::traits::EventStore;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct State {
    emails: HashMap<MessageId, StoredEmail>,
    events: BTreeMap<EventId, StoredEvent>,
    last_id: i64,
}

/// Event store backed by process-local maps.
///
/// IDs are assigned sequentially from 1. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    state: Mutex<State>,
}

impl MemoryEventStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns all stored events ordered by ID.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.lock().events.values().cloned().collect()
    }

    /// Returns the number of stored events.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Returns the number of stored emails.
    #[must_use]
    pub fn email_count(&self) -> usize {
        self.lock().emails.len()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Option<StoredEmail>> {
        Ok(self.lock().emails.get(message_id).cloned())
    }

    async fn find_events_by_root(&self, root: &MessageId) -> Result<Vec<StoredEvent>> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|e| &e.thread_root == root)
            .cloned()
            .collect())
    }

    async fn insert_email(&self, email: &StoredEmail) -> Result<()> {
        let mut state = self.lock();
        if state.emails.contains_key(&email.message_id) {
            return Err(Error::operation(
                "insert_email",
                format!("message {} already stored", email.message_id),
            ));
        }
        state.emails.insert(email.message_id.clone(), email.clone());
        Ok(())
    }

    async fn get_event(&self, id: EventId) -> Result<Option<StoredEvent>> {
        Ok(self.lock().events.get(&id).cloned())
    }

    async fn create_event(&self, event: NewEvent) -> Result<StoredEvent> {
        let mut state = self.lock();
        state.last_id += 1;
        let stored = event.with_id(EventId::new(state.last_id));
        state.events.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_event(&self, event: &StoredEvent) -> Result<()> {
        let mut state = self.lock();
        let Some(slot) = state.events.get_mut(&event.id) else {
            return Err(Error::operation(
                "update_event",
                format!("event {} not found", event.id),
            ));
        };
        slot.clone_from(event);
        Ok(())
    }

    async fn delete_event(&self, id: EventId) -> Result<bool> {
        Ok(self.lock().events.remove(&id).is_some())
    }
}
