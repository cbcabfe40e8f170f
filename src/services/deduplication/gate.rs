//! FIFO exclusion gate.
//!
//! One critical section at a time, granted in the order `acquire` was
//! called. Ownership passes straight from the releasing holder to the next
//! waiter, so a late arrival can never barge ahead of the queue.
//!
//! The gate is not reentrant: acquiring it again while holding a guard
//! deadlocks the task.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct GateState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

/// Process-wide critical section with FIFO fairness.
#[derive(Debug, Default)]
pub struct ExclusionGate {
    state: Mutex<GateState>,
}

impl ExclusionGate {
    /// Creates an unheld gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for exclusive ownership.
    ///
    /// Completes on first poll when the gate is free. The returned guard
    /// releases the gate when dropped.
    pub async fn acquire(&self) -> GateGuard<'_> {
        let start = Instant::now();
        let receiver = {
            let mut state = self.lock();
            if !state.held {
                state.held = true;
                return GateGuard { gate: self };
            }
            let (sender, receiver) = oneshot::channel();
            state.waiters.push_back(sender);
            receiver
        };

        let mut waiter = PendingWaiter {
            gate: self,
            receiver: Some(receiver),
        };
        waiter.granted().await;

        metrics::histogram!("gate_wait_duration_ms")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        GateGuard { gate: self }
    }

    /// Returns true while some task holds the gate.
    #[must_use]
    pub fn is_held(&self) -> bool {
        self.lock().held
    }

    /// Number of queued waiters, including ones whose futures were dropped
    /// but not yet skipped.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock().waiters.len()
    }

    fn release(&self) {
        let mut state = self.lock();
        while let Some(next) = state.waiters.pop_front() {
            // A failed send means the waiter went away; try the next one.
            if next.send(()).is_ok() {
                return;
            }
        }
        state.held = false;
    }
}

/// Exclusive ownership of an [`ExclusionGate`]. Dropping it releases the gate.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a ExclusionGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// A queued request. Dropping it after the grant was sent, but before it
/// was observed, hands ownership on instead of leaking it.
struct PendingWaiter<'a> {
    gate: &'a ExclusionGate,
    receiver: Option<oneshot::Receiver<()>>,
}

impl PendingWaiter<'_> {
    async fn granted(&mut self) {
        if let Some(receiver) = self.receiver.as_mut() {
            // Senders are only ever consumed by a grant.
            let _ = receiver.await;
        }
        self.receiver = None;
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                self.gate.release();
            }
        }
    }
}
