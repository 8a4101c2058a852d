//! Relay usage counters and periodic emission.
//!
//! - [`RelayMetrics`] for lock-free per-request counters
//! - [`start_periodic_usage_flush`] for periodic metric emission
//!
//! The counters are also embedded in the `/health` report.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

/// Interval between `usage_summary` log lines.
pub const USAGE_FLUSH_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// RelayMetrics
// ============================================================================

/// Lock-free counters shared by every resource engine.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Inbound resource requests.
    pub requests: AtomicU64,
    /// Requests answered from a fresh cache entry.
    pub cache_hits: AtomicU64,
    /// Requests that found no fresh entry.
    pub cache_misses: AtomicU64,
    /// Calls actually sent upstream.
    pub upstream_calls: AtomicU64,
    /// Requests that joined another request's in-flight fetch.
    pub coalesced: AtomicU64,
    /// Requests answered locally with 429 while the gate was closed.
    pub blocked: AtomicU64,
    /// Upstream 429 responses.
    pub rate_limited: AtomicU64,
    /// Upstream non-2xx (other than 429) responses.
    pub upstream_errors: AtomicU64,
    /// Upstream calls that failed below HTTP.
    pub transport_failures: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub upstream_calls: u64,
    pub coalesced: u64,
    pub blocked: u64,
    pub rate_limited: u64,
    pub upstream_errors: u64,
    pub transport_failures: u64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_call(&self) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blocked(&self) {
        self.blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
        }
    }

    /// Emit current counters as a structured log line.
    pub fn emit_usage(&self, reason: &str) {
        let s = self.snapshot();
        info!(
            event = "usage_summary",
            reason = reason,
            requests = s.requests,
            cache_hits = s.cache_hits,
            cache_misses = s.cache_misses,
            upstream_calls = s.upstream_calls,
            coalesced = s.coalesced,
            blocked = s.blocked,
            rate_limited = s.rate_limited,
            upstream_errors = s.upstream_errors,
            transport_failures = s.transport_failures,
            "Usage metrics"
        );
    }
}

// ============================================================================
// Periodic flush
// ============================================================================

/// Emit `usage_summary` every `every` until `shutdown_rx` flips to `true`,
/// then emit a final summary.
pub fn start_periodic_usage_flush(
    metrics: Arc<RelayMetrics>,
    every: Duration,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    metrics.emit_usage("periodic");
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        metrics.emit_usage("shutdown");
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
