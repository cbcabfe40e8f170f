//! Concurrency tests for thread ordering and the exclusion gate.
//!
//! - A reply is never processed before its parent has finished, whatever
//!   order the tasks are spawned in and however slow the parent is
//! - The gate grants in call order and never admits two holders

// Concurrency tests use expect/unwrap/panic for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dormsoup::embedding::HashEmbedder;
use dormsoup::extraction::{ExtractionFixture, FixtureEvent, FixtureExtractor};
use dormsoup::services::deduplication::{DeduplicationConfig, ExclusionGate, SimilarityIndex};
use dormsoup::storage::MemoryEventStore;
use dormsoup::{
    EmailPipeline, EventStore, Extraction, ExtractionError, Extractor, MessageId, ParsedEmail,
    ProcessingOutcome, StoredEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Wraps a fixture extractor, delaying chosen messages and logging what
/// each extraction saw.
struct RecordingExtractor {
    inner: FixtureExtractor,
    delays: HashMap<MessageId, Duration>,
    log: Arc<Mutex<Vec<String>>>,
    seen_events: Arc<Mutex<HashMap<MessageId, usize>>>,
}

#[async_trait]
impl Extractor for RecordingExtractor {
    async fn extract(
        &self,
        email: &ParsedEmail,
        thread_events: &[StoredEvent],
    ) -> Result<Extraction, ExtractionError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("start:{}", email.message_id));
        self.seen_events
            .lock()
            .unwrap()
            .insert(email.message_id.clone(), thread_events.len());

        if let Some(delay) = self.delays.get(&email.message_id) {
            tokio::time::sleep(*delay).await;
        }
        let result = self.inner.extract(email, thread_events).await;

        self.log
            .lock()
            .unwrap()
            .push(format!("end:{}", email.message_id));
        result
    }
}

/// Panics while extracting one chosen message.
struct PanickingExtractor {
    inner: FixtureExtractor,
    doomed: MessageId,
}

#[async_trait]
impl Extractor for PanickingExtractor {
    async fn extract(
        &self,
        email: &ParsedEmail,
        thread_events: &[StoredEvent],
    ) -> Result<Extraction, ExtractionError> {
        tokio::task::yield_now().await;
        if email.message_id == self.doomed {
            panic!("extractor crashed on {}", email.message_id);
        }
        self.inner.extract(email, thread_events).await
    }
}

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .map(|d| d.with_timezone(&Utc))
        .unwrap()
}

fn email(id: &str, parent: Option<&str>, received: &str) -> ParsedEmail {
    ParsedEmail {
        message_id: MessageId::new(id),
        in_reply_to: parent.map(MessageId::new),
        subject: "Spring concert".to_string(),
        sender: "concert@mit.edu".to_string(),
        body: "See you there".to_string(),
        received_at: at(received),
    }
}

fn one_event(title: &str, date: &str, location: &str) -> ExtractionFixture {
    ExtractionFixture::Events {
        events: vec![FixtureEvent {
            title: title.to_string(),
            date_time: at(date),
            location: location.to_string(),
            organizer: "MIT Concert Band".to_string(),
            duration_minutes: 90,
        }],
    }
}

struct Harness {
    pipeline: Arc<EmailPipeline>,
    log: Arc<Mutex<Vec<String>>>,
    seen_events: Arc<Mutex<HashMap<MessageId, usize>>>,
}

fn harness(root_delay: Duration) -> Harness {
    let inner = FixtureExtractor::new()
        .with_fixture(
            MessageId::new("root"),
            one_event("Spring concert", "2024-04-20T19:00:00Z", "Kresge"),
        )
        .with_fixture(
            MessageId::new("reply1"),
            one_event("Spring concert rehearsal", "2024-04-18T18:00:00Z", "Kresge"),
        )
        .with_fixture(
            MessageId::new("reply2"),
            one_event("Spring concert afterparty", "2024-04-20T22:00:00Z", "Walker"),
        );

    let log = Arc::new(Mutex::new(Vec::new()));
    let seen_events = Arc::new(Mutex::new(HashMap::new()));
    let extractor = RecordingExtractor {
        inner,
        delays: [(MessageId::new("root"), root_delay)].into_iter().collect(),
        log: Arc::clone(&log),
        seen_events: Arc::clone(&seen_events),
    };

    let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
    let pipeline = Arc::new(EmailPipeline::new(
        SimilarityIndex::in_memory(None),
        Arc::new(HashEmbedder::new()),
        Arc::new(extractor),
        store,
        DeduplicationConfig::default(),
    ));

    Harness {
        pipeline,
        log,
        seen_events,
    }
}

fn position(log: &[String], entry: &str) -> usize {
    log.iter()
        .position(|e| e == entry)
        .unwrap_or_else(|| panic!("{entry} missing from {log:?}"))
}

async fn run_thread_in_reverse_spawn_order(harness: &Harness) {
    let root = harness
        .pipeline
        .process_email(email("root", None, "2024-04-01T10:00:00Z"));
    let reply1 = harness
        .pipeline
        .process_email(email("reply1", Some("root"), "2024-04-01T11:00:00Z"));
    let reply2 = harness
        .pipeline
        .process_email(email("reply2", Some("reply1"), "2024-04-01T12:00:00Z"));

    let reply2 = tokio::spawn(reply2);
    tokio::task::yield_now().await;
    let reply1 = tokio::spawn(reply1);
    tokio::task::yield_now().await;
    let root = tokio::spawn(root);

    for handle in [reply2, reply1, root] {
        let outcome = handle.await.unwrap().unwrap();
        assert!(
            matches!(outcome, ProcessingOutcome::ProcessedWithEvents { .. }),
            "unexpected outcome {outcome}"
        );
    }
}

fn assert_causal_order(harness: &Harness) {
    let log = harness.log.lock().unwrap().clone();
    assert!(position(&log, "end:root") < position(&log, "start:reply1"));
    assert!(position(&log, "end:reply1") < position(&log, "start:reply2"));

    // Each reply saw every event filed by its ancestors.
    let seen = harness.seen_events.lock().unwrap();
    assert_eq!(seen[&MessageId::new("root")], 0);
    assert_eq!(seen[&MessageId::new("reply1")], 1);
    assert_eq!(seen[&MessageId::new("reply2")], 2);
}

#[tokio::test(flavor = "current_thread")]
async fn test_thread_order_with_slow_root_single_thread() {
    let harness = harness(Duration::from_millis(100));
    run_thread_in_reverse_spawn_order(&harness).await;
    assert_causal_order(&harness);
    assert_eq!(harness.pipeline.coordinator().in_flight_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_order_with_slow_root_multi_thread() {
    let harness = harness(Duration::from_millis(100));
    run_thread_in_reverse_spawn_order(&harness).await;
    assert_causal_order(&harness);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thread_order_without_delay() {
    let harness = harness(Duration::ZERO);
    run_thread_in_reverse_spawn_order(&harness).await;
    assert_causal_order(&harness);
}

#[tokio::test]
async fn test_unrelated_threads_are_not_serialized() {
    let harness = harness(Duration::from_millis(300));
    let root = harness
        .pipeline
        .process_email(email("root", None, "2024-04-01T10:00:00Z"));
    let other = harness
        .pipeline
        .process_email(email("elsewhere", None, "2024-04-01T10:30:00Z"));

    let root = tokio::spawn(root);
    // The unrelated message has no fixture, so it finishes as soon as it runs.
    let other = tokio::time::timeout(Duration::from_millis(200), other)
        .await
        .expect("unrelated message waited on the slow root")
        .unwrap();
    assert!(matches!(
        other,
        ProcessingOutcome::ExtractionMalformedResponse { .. }
    ));
    root.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reply_proceeds_after_parent_task_panics() {
    let extractor = PanickingExtractor {
        inner: FixtureExtractor::new().with_fixture(
            MessageId::new("reply1"),
            one_event("Spring concert rehearsal", "2024-04-18T18:00:00Z", "Kresge"),
        ),
        doomed: MessageId::new("root"),
    };
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = Arc::new(EmailPipeline::new(
        SimilarityIndex::in_memory(None),
        Arc::new(HashEmbedder::new()),
        Arc::new(extractor),
        Arc::clone(&store) as Arc<dyn EventStore>,
        DeduplicationConfig::default(),
    ));

    let root = pipeline.process_email(email("root", None, "2024-04-01T10:00:00Z"));
    let reply = pipeline.process_email(email("reply1", Some("root"), "2024-04-01T11:00:00Z"));
    let reply = tokio::spawn(reply);
    let root = tokio::spawn(root);

    let crashed = root.await.unwrap_err();
    assert!(crashed.is_panic());

    let outcome = tokio::time::timeout(Duration::from_secs(2), reply)
        .await
        .expect("reply stayed blocked on a crashed parent")
        .unwrap()
        .unwrap();
    assert!(
        matches!(outcome, ProcessingOutcome::ProcessedWithEvents { .. }),
        "unexpected outcome {outcome}"
    );
    assert_eq!(pipeline.coordinator().in_flight_count(), 0);
    assert_eq!(store.events()[0].thread_root, MessageId::new("root"));
}

#[tokio::test(flavor = "current_thread")]
async fn test_gate_grants_in_call_order() {
    let gate = Arc::new(ExclusionGate::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let holder = gate.acquire().await;
    let mut handles = Vec::new();
    for n in 0..8 {
        let task_gate = Arc::clone(&gate);
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let _guard = task_gate.acquire().await;
            order.lock().unwrap().push(n);
            tokio::time::sleep(Duration::from_millis(1)).await;
        }));
        while gate.queue_len() <= n {
            tokio::task::yield_now().await;
        }
    }
    drop(holder);

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_gate_never_admits_two_holders() {
    let gate = Arc::new(ExclusionGate::new());
    let holders = Arc::new(AtomicUsize::new(0));
    let max_seen = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let gate = Arc::clone(&gate);
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            tokio::spawn(async move {
                let _guard = gate.acquire().await;
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                holders.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    assert!(!gate.is_held());
}

#[tokio::test]
async fn test_cancelled_waiter_does_not_wedge_gate() {
    let gate = Arc::new(ExclusionGate::new());
    let holder = gate.acquire().await;

    let cancelled = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let _guard = gate.acquire().await;
        })
    };
    while gate.queue_len() == 0 {
        tokio::task::yield_now().await;
    }
    cancelled.abort();
    let _ = cancelled.await;
    drop(holder);

    tokio::time::timeout(Duration::from_millis(200), gate.acquire())
        .await
        .expect("gate stayed held after a cancelled waiter");
}
