//! Per-client RPC counters. Batched calls count once per HTTP round trip;
//! `batch_entries` tracks how many JSON-RPC calls those trips carried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct RpcMetrics {
    round_trips: AtomicU64,
    failures: AtomicU64,
    timeouts: AtomicU64,
    latency_ns: AtomicU64,
    batches: AtomicU64,
    batch_entries: AtomicU64,
    missing_blocks: AtomicU64,
    oversized_responses: AtomicU64,
}

impl RpcMetrics {
    pub(crate) fn record_success(&self, latency: Duration) {
        self.record_round_trip(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.record_round_trip(latency);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// A `null` block answer. The round trip itself succeeded.
    pub(crate) fn record_missing_block(&self, latency: Duration) {
        self.record_round_trip(latency);
        self.missing_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_oversized(&self, latency: Duration) {
        self.record_failure(latency);
        self.oversized_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, entries: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_entries
            .fetch_add(entries as u64, Ordering::Relaxed);
    }

    fn record_round_trip(&self, latency: Duration) {
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        self.latency_ns
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RpcMetricsSnapshot {
        let total_requests = self.round_trips.load(Ordering::Relaxed);
        let total_errors = self.failures.load(Ordering::Relaxed);
        let batches = self.batches.load(Ordering::Relaxed);
        let batch_entries = self.batch_entries.load(Ordering::Relaxed);
        let latency_ms = self.latency_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        RpcMetricsSnapshot {
            total_requests,
            total_errors,
            total_timeouts: self.timeouts.load(Ordering::Relaxed),
            average_latency_ms: ratio(latency_ms, total_requests),
            error_rate: ratio(total_errors as f64, total_requests),
            batches,
            batch_entries,
            average_batch_size: ratio(batch_entries as f64, batches),
            missing_blocks: self.missing_blocks.load(Ordering::Relaxed),
            oversized_responses: self.oversized_responses.load(Ordering::Relaxed),
        }
    }
}

fn ratio(value: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        value / count as f64
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq)]
pub struct RpcMetricsSnapshot {
    /// HTTP round trips, batched or single.
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_timeouts: u64,
    pub average_latency_ms: f64,
    pub error_rate: f64,
    pub batches: u64,
    pub batch_entries: u64,
    pub average_batch_size: f64,
    pub missing_blocks: u64,
    pub oversized_responses: u64,
}
