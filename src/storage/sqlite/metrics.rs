//! Metrics recording for the `SQLite` event store.

use std::time::Instant;

/// Records a counter and a latency histogram for one store operation.
///
/// `status` is `"success"` or `"error"`.
#[allow(clippy::cast_precision_loss)]
pub fn record_operation_metrics(operation: &'static str, start: Instant, status: &'static str) {
    metrics::counter!(
        "event_store_operations_total",
        "backend" => "sqlite",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
    metrics::histogram!(
        "event_store_operation_duration_ms",
        "backend" => "sqlite",
        "operation" => operation
    )
    .record(start.elapsed().as_secs_f64() * 1000.0);
}
