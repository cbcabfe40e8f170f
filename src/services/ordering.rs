//! Causal ordering within reply threads.
//!
//! Every email in flight owns a [`CompletionToken`]. A reply waits on its
//! immediate parent's token before it is processed, so an event announced
//! in a thread root is always filed before a correction sent as a reply.
//!
//! Tokens are registered synchronously, before the processing future can
//! suspend, and are resolved by `Drop` on every exit path. Unrelated threads
//! and sibling replies are not ordered against each other.

use crate::models::MessageId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type InFlight = HashMap<MessageId, watch::Receiver<bool>>;

/// Tracks which messages are currently being processed.
#[derive(Debug, Clone, Default)]
pub struct ThreadOrderingCoordinator {
    in_flight: Arc<Mutex<InFlight>>,
}

impl ThreadOrderingCoordinator {
    /// Creates a coordinator with nothing in flight.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InFlight> {
        lock_in_flight(&self.in_flight)
    }

    /// Marks `message_id` as in flight.
    ///
    /// Returns `None` if that message is already in flight.
    #[must_use]
    pub fn register(&self, message_id: &MessageId) -> Option<CompletionToken> {
        let mut in_flight = self.lock();
        if in_flight.contains_key(message_id) {
            return None;
        }
        let (sender, receiver) = watch::channel(false);
        in_flight.insert(message_id.clone(), receiver);
        Some(CompletionToken {
            message_id: message_id.clone(),
            sender,
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Returns true while `message_id` holds a token.
    #[must_use]
    pub fn is_in_flight(&self, message_id: &MessageId) -> bool {
        self.lock().contains_key(message_id)
    }

    /// Number of messages in flight.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.lock().len()
    }

    /// Waits until `message_id` is no longer in flight.
    ///
    /// Returns at once if it holds no token. Nothing bounds the wait: a
    /// message whose processing never finishes blocks its replies.
    pub async fn wait_for(&self, message_id: &MessageId) {
        let receiver = self.lock().get(message_id).cloned();
        if let Some(mut receiver) = receiver {
            tracing::debug!(parent = %message_id, "Waiting for parent message");
            // A closed channel means the token was dropped, which resolves it.
            let _ = receiver.wait_for(|done| *done).await;
        }
    }
}

fn lock_in_flight(in_flight: &Mutex<InFlight>) -> MutexGuard<'_, InFlight> {
    in_flight.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Proof that a message is in flight. Dropping it resolves the message.
#[derive(Debug)]
#[must_use = "the message is resolved as soon as its token is dropped"]
pub struct CompletionToken {
    message_id: MessageId,
    sender: watch::Sender<bool>,
    in_flight: Arc<Mutex<InFlight>>,
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        lock_in_flight(&self.in_flight).remove(&self.message_id);
        self.sender.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_rejects_in_flight_duplicate() {
        let coordinator = ThreadOrderingCoordinator::new();
        let id = MessageId::new("root@mit.edu");

        let token = coordinator.register(&id);
        assert!(token.is_some());
        assert!(coordinator.register(&id).is_none());
        assert!(coordinator.is_in_flight(&id));

        drop(token);
        assert!(!coordinator.is_in_flight(&id));
        assert!(coordinator.register(&id).is_some());
    }

    #[tokio::test]
    async fn test_wait_for_unknown_returns_immediately() {
        let coordinator = ThreadOrderingCoordinator::new();
        tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.wait_for(&MessageId::new("nobody")),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_resolves_on_drop() {
        let coordinator = ThreadOrderingCoordinator::new();
        let id = MessageId::new("root@mit.edu");
        let token = coordinator.register(&id).unwrap();

        let waiter = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move { coordinator.wait_for(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(token);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(coordinator.in_flight_count(), 0);
    }
}
