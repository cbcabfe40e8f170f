//! Email processing pipeline.

use super::deduplication::{DeduplicationConfig, DeduplicationEngine, SimilarityIndex};
use super::ordering::{CompletionToken, ThreadOrderingCoordinator};
use crate::embedding::Embedder;
use crate::extraction::{Extraction, ExtractionError, Extractor};
use crate::models::{MessageId, ParsedEmail, ProcessingOutcome, StoredEmail};
use crate::storage::EventStore;
use crate::Result;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Wires ordering, extraction and deduplication together.
///
/// One pipeline owns the exclusion gate, the ordering coordinator and the
/// similarity index for the whole process. Share it behind an `Arc`.
pub struct EmailPipeline {
    engine: DeduplicationEngine,
    coordinator: ThreadOrderingCoordinator,
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn EventStore>,
}

impl EmailPipeline {
    /// Creates a pipeline.
    #[must_use]
    pub fn new(
        index: SimilarityIndex,
        embedder: Arc<dyn Embedder>,
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn EventStore>,
        config: DeduplicationConfig,
    ) -> Self {
        Self {
            engine: DeduplicationEngine::new(index, embedder, Arc::clone(&store), config),
            coordinator: ThreadOrderingCoordinator::new(),
            extractor,
            store,
        }
    }

    /// The deduplication engine.
    #[must_use]
    pub const fn engine(&self) -> &DeduplicationEngine {
        &self.engine
    }

    /// The thread ordering coordinator.
    #[must_use]
    pub const fn coordinator(&self) -> &ThreadOrderingCoordinator {
        &self.coordinator
    }

    /// Processes one email.
    ///
    /// The email is validated and registered as in flight when this method
    /// is called, before the returned future is first polled. A reply whose
    /// parent's future has been created therefore always waits for the parent,
    /// however the two futures are scheduled.
    ///
    /// # Errors
    ///
    /// The future resolves to an error for infrastructure failures (store,
    /// embedder, index). Everything else is a [`ProcessingOutcome`].
    pub fn process_email(
        self: &Arc<Self>,
        email: ParsedEmail,
    ) -> impl Future<Output = Result<ProcessingOutcome>> + Send + 'static {
        let span = tracing::info_span!(
            "process_email",
            message_id = %email.message_id,
            in_reply_to = tracing::field::Empty,
            outcome = tracing::field::Empty
        );
        if let Some(parent) = &email.in_reply_to {
            span.record("in_reply_to", tracing::field::display(parent));
        }

        let registration = self.register(&email);
        let pipeline = Arc::clone(self);

        async move {
            let start = Instant::now();
            let result = match registration {
                Ok(token) => {
                    let result = pipeline.run(&email).await;
                    drop(token);
                    result
                },
                Err(outcome) => Ok(outcome),
            };

            let label = match &result {
                Ok(outcome) => outcome.as_str(),
                Err(_) => "error",
            };
            tracing::Span::current().record("outcome", label);
            metrics::counter!("emails_processed_total", "outcome" => label).increment(1);
            metrics::histogram!("email_processing_duration_ms")
                .record(start.elapsed().as_secs_f64() * 1000.0);

            match &result {
                Ok(outcome) => tracing::info!(%outcome, "Processed email"),
                Err(e) => tracing::error!(error = %e, "Email processing failed"),
            }
            result
        }
        .instrument(span)
    }

    fn register(
        &self,
        email: &ParsedEmail,
    ) -> std::result::Result<CompletionToken, ProcessingOutcome> {
        if let Some(reason) = email.malformed_reason() {
            return Err(ProcessingOutcome::MalformedEmail {
                reason: reason.to_string(),
            });
        }
        self.coordinator
            .register(&email.message_id)
            .ok_or(ProcessingOutcome::DuplicateMessageId)
    }

    async fn run(&self, email: &ParsedEmail) -> Result<ProcessingOutcome> {
        if self.store.find_by_message_id(&email.message_id).await?.is_some() {
            return Ok(ProcessingOutcome::DuplicateMessageId);
        }

        let thread_root = match &email.in_reply_to {
            Some(parent) => {
                self.coordinator.wait_for(parent).await;
                match self.resolve_thread_root(parent).await? {
                    Some(root) => root,
                    None => return Ok(ProcessingOutcome::ThreadRootMissing),
                }
            },
            None => email.message_id.clone(),
        };

        self.store
            .insert_email(&StoredEmail::from_parsed(email, thread_root.clone()))
            .await?;

        let thread_events = self.store.find_events_by_root(&thread_root).await?;
        let candidates = match self.extractor.extract(email, &thread_events).await {
            Ok(Extraction::Events(candidates)) => candidates,
            Ok(Extraction::NotRelevant) => return Ok(ProcessingOutcome::NotRelevant),
            Err(err) => return Ok(extraction_failure(err)),
        };
        if candidates.is_empty() {
            return Ok(ProcessingOutcome::ProcessedNoEvents);
        }

        let mut decisions = Vec::with_capacity(candidates.len());
        for candidate in &candidates {
            decisions.push(
                self.engine
                    .deduplicate(candidate, &email.message_id, &thread_root)
                    .await?,
            );
        }
        Ok(ProcessingOutcome::ProcessedWithEvents { decisions })
    }

    /// Follows `in_reply_to` links from `parent` to the first message without
    /// one. Returns `None` if a link points at a message that is not stored.
    async fn resolve_thread_root(&self, parent: &MessageId) -> Result<Option<MessageId>> {
        let Some(mut current) = self.store.find_by_message_id(parent).await? else {
            tracing::warn!(parent = %parent, "Parent message not stored");
            return Ok(None);
        };

        let mut visited = HashSet::new();
        while visited.insert(current.message_id.clone()) {
            match self.store.find_reply_parent(&current).await? {
                Some(next) => current = next,
                None if current.in_reply_to.is_some() => {
                    tracing::warn!(
                        message_id = %current.message_id,
                        "Reply chain broken, ancestor not stored"
                    );
                    return Ok(None);
                },
                None => return Ok(Some(current.message_id)),
            }
        }

        tracing::warn!(message_id = %current.message_id, "Reply chain loops");
        Ok(None)
    }

    /// Writes the similarity index snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub async fn flush(&self) -> Result<()> {
        self.engine.flush_index().await
    }

    /// Flushes the index every `interval` until the handle is aborted.
    ///
    /// Failures are logged and retried on the next tick. A zero interval is
    /// raised to one second.
    pub fn spawn_periodic_flush(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = if interval.is_zero() {
            tracing::warn!("Flush interval is zero, using 1s");
            Duration::from_secs(1)
        } else {
            interval
        };
        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = pipeline.flush().await {
                    tracing::warn!(error = %e, "Periodic index flush failed");
                }
            }
        })
    }
}

fn extraction_failure(err: ExtractionError) -> ProcessingOutcome {
    tracing::warn!(error = %err, "Extraction failed");
    match err {
        ExtractionError::Network(detail) => ProcessingOutcome::ExtractionNetworkError { detail },
        ExtractionError::MalformedResponse(detail) => {
            ProcessingOutcome::ExtractionMalformedResponse { detail }
        },
        ExtractionError::Rejected(detail) => ProcessingOutcome::ExtractionRejected { detail },
    }
}
