// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for offline-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `status`: success, failure, rejected, offline, suppressed, exhausted
//! - `operation`: create, delete, mark_read
//! - `kind`: domain event kind

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// CLIENT - Coordinator sync attempts and journal depth
// ═══════════════════════════════════════════════════════════════════════════

/// Record a client sync attempt outcome
pub fn record_sync_attempt(status: &str) {
    counter!(
        "offline_sync_attempts_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Set the number of journaled events still awaiting sync
pub fn set_pending_events(count: u64) {
    gauge!("offline_sync_pending_events").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SERVER - Processor batches and per-event outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record a processed sync request at the request level
pub fn record_sync_request(status: &str) {
    counter!(
        "offline_sync_requests_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record batch processing latency
pub fn record_sync_duration(duration: Duration) {
    histogram!("offline_sync_request_seconds").record(duration.as_secs_f64());
}

/// Record a per-event apply outcome
pub fn record_event_processed(status: &str) {
    counter!(
        "offline_sync_events_processed_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a duplicate submission answered from the processed-event record
pub fn record_replay() {
    counter!("offline_sync_replays_total").increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// GUARD - Cross-store link lifecycle
// ═══════════════════════════════════════════════════════════════════════════

/// Record a cross-store link operation outcome
pub fn record_link_operation(operation: &str, status: &str) {
    counter!(
        "offline_sync_link_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record links removed by an orphan sweep
pub fn record_orphans_removed(count: usize) {
    counter!("offline_sync_orphans_removed_total").increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// DISPATCH - Queue depth and handler failures
// ═══════════════════════════════════════════════════════════════════════════

/// Set the dispatch queue depth (events awaiting fan-out)
pub fn set_dispatch_queue_depth(depth: usize) {
    gauge!("offline_sync_dispatch_queue_depth").set(depth as f64);
}

/// Record a handler error or panic during fan-out
pub fn record_handler_failure(kind: &str, handler: &str) {
    counter!(
        "offline_sync_handler_failures_total",
        "kind" => kind.to_string(),
        "handler" => handler.to_string()
    )
    .increment(1);
}
