//! Deduplication engine.
//!
//! Each candidate is embedded outside the critical section. Everything after
//! that (index lookup, merge decisions, store writes) happens while the
//! exclusion gate is held, so two candidates never interleave their
//! read-modify-write sequences.

use super::config::DeduplicationConfig;
use super::gate::ExclusionGate;
use super::index::{Neighbor, SimilarityIndex};
use super::merge::{MergeResolution, resolve};
use crate::embedding::Embedder;
use crate::models::{CandidateDecision, EventCandidate, EventId, MessageId, NewEvent};
use crate::storage::EventStore;
use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::instrument;

/// Decides whether extracted events are new, fresher, or redundant.
///
/// All mutation of the similarity index and the event store made on behalf
/// of one candidate happens under a single gate acquisition.
pub struct DeduplicationEngine {
    index: Mutex<SimilarityIndex>,
    gate: ExclusionGate,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn EventStore>,
    config: DeduplicationConfig,
}

impl DeduplicationEngine {
    /// Creates an engine over a loaded index.
    #[must_use]
    pub fn new(
        index: SimilarityIndex,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn EventStore>,
        config: DeduplicationConfig,
    ) -> Self {
        Self {
            index: Mutex::new(index),
            gate: ExclusionGate::new(),
            embedder,
            store,
            config,
        }
    }

    /// Returns the exclusion gate guarding the index and store.
    #[must_use]
    pub const fn gate(&self) -> &ExclusionGate {
        &self.gate
    }

    // Never held across an await.
    fn index(&self) -> MutexGuard<'_, SimilarityIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` against the current index state.
    pub fn inspect_index<R>(&self, f: impl FnOnce(&SimilarityIndex) -> R) -> R {
        f(&self.index())
    }

    /// Files one candidate: inserts it, supersedes a stored event with it, or
    /// discards it.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding fails, the embedding does not fit the
    /// index, or a store call fails. Index changes made before a store
    /// failure are kept; the candidate's own empty entry is always removed.
    #[instrument(
        skip(self, candidate),
        fields(
            title = %candidate.title,
            message_id = %source_message_id,
            decision = tracing::field::Empty
        )
    )]
    pub async fn deduplicate(
        &self,
        candidate: &EventCandidate,
        source_message_id: &MessageId,
        thread_root: &MessageId,
    ) -> Result<CandidateDecision> {
        if candidate.title.trim().is_empty() {
            return Err(Error::InvalidInput("candidate title is empty".to_string()));
        }

        let embedding = self.embedder.embed(&candidate.title).await?;

        let _guard = self.gate.acquire().await;

        let decision = if self.config.enabled {
            self.index().upsert(&candidate.title, embedding.clone(), [])?;
            let neighbors = self.index().knn(&embedding, self.config.neighbors);

            let result = self
                .decide(candidate, neighbors, source_message_id, thread_root)
                .await;
            self.index().delete_if_empty(&candidate.title);
            result?
        } else {
            tracing::debug!("Deduplication disabled, inserting");
            let created = self
                .insert(candidate, source_message_id, thread_root)
                .await?;
            self.index()
                .upsert(&candidate.title, embedding, [created.event_id()])?;
            created
        };

        tracing::Span::current().record("decision", decision.as_str());
        metrics::counter!("dedup_candidates_total", "decision" => decision.as_str()).increment(1);
        Ok(decision)
    }

    /// Walks the neighbors closest first and applies the merge policy to
    /// every event filed under them. Must be called with the gate held and
    /// the candidate's entry present.
    async fn decide(
        &self,
        candidate: &EventCandidate,
        neighbors: Vec<Neighbor>,
        source_message_id: &MessageId,
        thread_root: &MessageId,
    ) -> Result<CandidateDecision> {
        for neighbor in neighbors {
            let ids: Vec<EventId> = self
                .index()
                .get(&neighbor.key)
                .map(|e| e.event_ids.iter().copied().collect())
                .unwrap_or_default();

            for id in ids {
                let Some(mut existing) = self.store.get_event(id).await? else {
                    tracing::warn!(
                        event_id = %id,
                        neighbor = %neighbor.key,
                        "Indexed event missing from store, skipping"
                    );
                    metrics::counter!("dedup_store_inconsistency_total").increment(1);
                    continue;
                };

                let resolution = resolve(candidate, &existing);
                tracing::debug!(
                    event_id = %id,
                    neighbor = %neighbor.key,
                    distance = neighbor.distance,
                    resolution = resolution.as_str(),
                    "Compared against stored event"
                );

                if !resolution.is_decisive() {
                    continue;
                }
                if resolution == MergeResolution::DiscardCandidate {
                    return Ok(CandidateDecision::Discarded {
                        kept: id,
                        title: candidate.title.clone(),
                    });
                }

                existing.supersede_with(candidate, source_message_id.clone(), thread_root.clone());
                self.store.update_event(&existing).await?;
                self.index()
                    .move_event_id(id, &neighbor.key, &candidate.title);
                return Ok(CandidateDecision::Superseded {
                    id,
                    title: candidate.title.clone(),
                });
            }
        }

        let created = self
            .insert(candidate, source_message_id, thread_root)
            .await?;
        self.index()
            .add_event_id(&candidate.title, created.event_id());
        Ok(created)
    }

    async fn insert(
        &self,
        candidate: &EventCandidate,
        source_message_id: &MessageId,
        thread_root: &MessageId,
    ) -> Result<CandidateDecision> {
        let stored = self
            .store
            .create_event(NewEvent::from_candidate(
                candidate,
                source_message_id.clone(),
                thread_root.clone(),
            ))
            .await?;
        Ok(CandidateDecision::Inserted {
            id: stored.id,
            title: candidate.title.clone(),
        })
    }

    /// Deletes a stored event and removes its ID from the index.
    ///
    /// Returns false if the store had no such event.
    ///
    /// # Errors
    ///
    /// Returns an error if the store delete fails; the index is then untouched.
    #[instrument(skip(self), fields(event_id = %id))]
    pub async fn remove_event(&self, id: EventId) -> Result<bool> {
        let _guard = self.gate.acquire().await;

        let deleted = self.store.delete_event(id).await?;
        let touched = self.index().remove_event_id(id);
        tracing::info!(deleted, entries = touched.len(), "Removed event");
        Ok(deleted)
    }

    /// Returns the titles nearest to `title` without changing the index.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding fails or the embedding does not fit
    /// the index.
    pub async fn nearest(&self, title: &str, k: usize) -> Result<Vec<Neighbor>> {
        let embedding = self.embedder.embed(title).await?;
        let index = self.index();
        index.check_vector(&embedding)?;
        Ok(index.knn(&embedding, k))
    }

    /// Writes the index snapshot.
    ///
    /// Holds the gate so no half-filed candidate is captured.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn flush_index(&self) -> Result<()> {
        let _guard = self.gate.acquire().await;
        let start = Instant::now();
        self.index().flush()?;
        tracing::debug!(
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Flushed similarity index"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::models::{StoredEmail, StoredEvent};
    use crate::storage::MemoryEventStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Memory store whose event reads or updates can be switched to fail.
    #[derive(Default)]
    struct FailingStore {
        inner: MemoryEventStore,
        fail_get: AtomicBool,
        fail_update: AtomicBool,
    }

    #[async_trait]
    impl EventStore for FailingStore {
        async fn find_by_message_id(&self, message_id: &MessageId) -> Result<Option<StoredEmail>> {
            self.inner.find_by_message_id(message_id).await
        }

        async fn find_events_by_root(&self, root: &MessageId) -> Result<Vec<StoredEvent>> {
            self.inner.find_events_by_root(root).await
        }

        async fn insert_email(&self, email: &StoredEmail) -> Result<()> {
            self.inner.insert_email(email).await
        }

        async fn get_event(&self, id: EventId) -> Result<Option<StoredEvent>> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(Error::operation("get_event", "store offline"));
            }
            self.inner.get_event(id).await
        }

        async fn create_event(&self, event: NewEvent) -> Result<StoredEvent> {
            self.inner.create_event(event).await
        }

        async fn update_event(&self, event: &StoredEvent) -> Result<()> {
            if self.fail_update.load(Ordering::SeqCst) {
                return Err(Error::operation("update_event", "store offline"));
            }
            self.inner.update_event(event).await
        }

        async fn delete_event(&self, id: EventId) -> Result<bool> {
            self.inner.delete_event(id).await
        }
    }

    fn failing_engine() -> (DeduplicationEngine, Arc<FailingStore>) {
        let store = Arc::new(FailingStore::default());
        let embedder = Arc::new(HashEmbedder::new());
        let engine = DeduplicationEngine::new(
            SimilarityIndex::in_memory(Some(embedder.dimensions())),
            embedder,
            Arc::clone(&store) as Arc<dyn EventStore>,
            DeduplicationConfig::default(),
        );
        (engine, store)
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339)
            .map(|d| d.with_timezone(&Utc))
            .unwrap()
    }

    fn candidate(title: &str, date: &str, location: &str, received: &str) -> EventCandidate {
        EventCandidate {
            title: title.to_string(),
            date_time: at(date),
            location: location.to_string(),
            organizer: "SIPB".to_string(),
            duration_minutes: 60,
            source_received_at: at(received),
        }
    }

    fn engine(config: DeduplicationConfig) -> (DeduplicationEngine, Arc<MemoryEventStore>) {
        let store = Arc::new(MemoryEventStore::new());
        let embedder = Arc::new(HashEmbedder::new());
        let engine = DeduplicationEngine::new(
            SimilarityIndex::in_memory(Some(embedder.dimensions())),
            embedder,
            Arc::clone(&store) as Arc<dyn EventStore>,
            config,
        );
        (engine, store)
    }

    fn msg(id: &str) -> MessageId {
        MessageId::new(id)
    }

    #[tokio::test]
    async fn test_insert_then_discard_repeat() {
        let (engine, store) = engine(DeduplicationConfig::default());
        let first = candidate("Linux install fest", "2024-04-01T19:00:00Z", "32-G882", "2024-03-20T10:00:00Z");

        let decision = engine.deduplicate(&first, &msg("a"), &msg("a")).await.unwrap();
        assert!(matches!(decision, CandidateDecision::Inserted { .. }));

        let decision = engine.deduplicate(&first, &msg("b"), &msg("b")).await.unwrap();
        assert_eq!(
            decision,
            CandidateDecision::Discarded {
                kept: EventId::new(1),
                title: "Linux install fest".to_string()
            }
        );
        assert_eq!(store.event_count(), 1);
        engine.inspect_index(|index| {
            assert_eq!(index.len(), 1);
            assert_eq!(index.event_id_count(), 1);
        });
    }

    #[tokio::test]
    async fn test_fresher_candidate_supersedes_and_moves_id() {
        let (engine, store) = engine(DeduplicationConfig::default());
        let original = candidate("Pie night", "2024-04-01T00:00:00Z", "unknown", "2024-03-20T10:00:00Z");
        let refined = candidate("Pie night!", "2024-04-01T20:00:00Z", "Walker", "2024-03-21T10:00:00Z");

        engine.deduplicate(&original, &msg("a"), &msg("a")).await.unwrap();
        let decision = engine.deduplicate(&refined, &msg("b"), &msg("a")).await.unwrap();
        assert_eq!(
            decision,
            CandidateDecision::Superseded {
                id: EventId::new(1),
                title: "Pie night!".to_string()
            }
        );

        let stored = store.events();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].location, "Walker");
        assert_eq!(stored[0].source_message_id, msg("b"));
        engine.inspect_index(|index| {
            assert!(index.get("Pie night").is_none());
            assert!(index.get("Pie night!").unwrap().event_ids.contains(&EventId::new(1)));
        });
    }

    #[tokio::test]
    async fn test_unmergable_neighbor_inserts_new_event() {
        let (engine, store) = engine(DeduplicationConfig::default());
        let monday = candidate("Board games", "2024-04-01T19:00:00Z", "Baker", "2024-03-20T10:00:00Z");
        let tuesday = candidate("Board games", "2024-04-02T19:00:00Z", "Baker", "2024-03-21T10:00:00Z");

        engine.deduplicate(&monday, &msg("a"), &msg("a")).await.unwrap();
        let decision = engine.deduplicate(&tuesday, &msg("b"), &msg("b")).await.unwrap();
        assert!(matches!(decision, CandidateDecision::Inserted { id, .. } if id == EventId::new(2)));
        assert_eq!(store.event_count(), 2);
        engine.inspect_index(|index| {
            assert_eq!(index.get("Board games").unwrap().event_ids.len(), 2);
        });
    }

    #[tokio::test]
    async fn test_missing_store_event_is_skipped() {
        let (engine, store) = engine(DeduplicationConfig::default());
        let talk = candidate("Tech talk", "2024-04-01T19:00:00Z", "10-250", "2024-03-20T10:00:00Z");
        engine.deduplicate(&talk, &msg("a"), &msg("a")).await.unwrap();
        assert!(store.delete_event(EventId::new(1)).await.unwrap());

        let decision = engine.deduplicate(&talk, &msg("b"), &msg("b")).await.unwrap();
        assert!(matches!(decision, CandidateDecision::Inserted { id, .. } if id == EventId::new(2)));
    }

    #[tokio::test]
    async fn test_disabled_always_inserts() {
        let (engine, store) = engine(DeduplicationConfig::default().with_enabled(false));
        let talk = candidate("Tech talk", "2024-04-01T19:00:00Z", "10-250", "2024-03-20T10:00:00Z");
        engine.deduplicate(&talk, &msg("a"), &msg("a")).await.unwrap();
        engine.deduplicate(&talk, &msg("b"), &msg("b")).await.unwrap();
        assert_eq!(store.event_count(), 2);
    }

    #[tokio::test]
    async fn test_remove_event_scrubs_index() {
        let (engine, store) = engine(DeduplicationConfig::default());
        let talk = candidate("Tech talk", "2024-04-01T19:00:00Z", "10-250", "2024-03-20T10:00:00Z");
        engine.deduplicate(&talk, &msg("a"), &msg("a")).await.unwrap();

        assert!(engine.remove_event(EventId::new(1)).await.unwrap());
        assert!(!engine.remove_event(EventId::new(1)).await.unwrap());
        assert_eq!(store.event_count(), 0);
        engine.inspect_index(|index| assert!(index.is_empty()));
        assert!(!engine.gate().is_held());
    }

    #[tokio::test]
    async fn test_store_read_failure_releases_gate_and_drops_candidate_entry() {
        let (engine, store) = failing_engine();
        let pie = candidate("Pie night", "2024-04-01T19:00:00Z", "Walker", "2024-03-20T10:00:00Z");
        let copy = candidate("Pie night in Walker", "2024-04-01T19:00:00Z", "Walker", "2024-03-21T10:00:00Z");
        engine.deduplicate(&pie, &msg("a"), &msg("a")).await.unwrap();

        store.fail_get.store(true, Ordering::SeqCst);
        let err = engine.deduplicate(&copy, &msg("b"), &msg("b")).await.unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));
        assert!(!engine.gate().is_held());
        engine.inspect_index(|index| {
            assert_eq!(index.keys().collect::<Vec<_>>(), vec!["Pie night"]);
        });

        // The next candidate is filed normally.
        store.fail_get.store(false, Ordering::SeqCst);
        let decision = engine.deduplicate(&copy, &msg("b"), &msg("b")).await.unwrap();
        assert!(matches!(decision, CandidateDecision::Superseded { .. }));
    }

    #[tokio::test]
    async fn test_store_update_failure_keeps_existing_entry() {
        let (engine, store) = failing_engine();
        let pie = candidate("Pie night", "2024-04-01T19:00:00Z", "Walker", "2024-03-20T10:00:00Z");
        let fresher = candidate("Pie night!", "2024-04-01T19:00:00Z", "Walker", "2024-03-21T10:00:00Z");
        engine.deduplicate(&pie, &msg("a"), &msg("a")).await.unwrap();

        store.fail_update.store(true, Ordering::SeqCst);
        assert!(engine.deduplicate(&fresher, &msg("b"), &msg("b")).await.is_err());
        assert!(!engine.gate().is_held());
        engine.inspect_index(|index| {
            assert_eq!(index.keys().collect::<Vec<_>>(), vec!["Pie night"]);
            assert!(index.get("Pie night").unwrap().event_ids.contains(&EventId::new(1)));
        });
        assert_eq!(store.inner.events()[0].source_message_id, msg("a"));
    }

    #[tokio::test]
    async fn test_nearest_rejects_embedding_of_wrong_width() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let engine = DeduplicationEngine::new(
            SimilarityIndex::in_memory(Some(8)),
            Arc::new(HashEmbedder::with_dimensions(16)),
            store,
            DeduplicationConfig::default(),
        );
        let err = engine.nearest("Pie night", 3).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_empty_title_rejected() {
        let (engine, _) = engine(DeduplicationConfig::default());
        let blank = candidate("  ", "2024-04-01T19:00:00Z", "unknown", "2024-03-20T10:00:00Z");
        let err = engine.deduplicate(&blank, &msg("a"), &msg("a")).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
