//! Pipeline metrics
//!
//! Process-wide counters for the capture, relay and publish stages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

/// Pipeline metrics collector
#[derive(Default)]
pub struct Metrics {
    /// Chunks emitted by the chunker
    chunks_captured: AtomicU64,

    /// Chunks handed to an open relay connection
    chunks_sent: AtomicU64,

    /// Chunks dropped because the relay was not open
    chunks_dropped_not_open: AtomicU64,

    /// Chunks dropped because the relay send buffer was full
    chunks_dropped_buffer_full: AtomicU64,

    /// Chunks evicted from the worker queue (drop-oldest)
    queue_evictions: AtomicU64,

    /// Chunks skipped because they failed to decode
    decode_failures: AtomicU64,

    /// FLV tags written to the publish connection
    tags_published: AtomicU64,

    /// Sessions that reached publishing
    sessions_started: AtomicU64,

    /// Sessions that ended in failure
    sessions_failed: AtomicU64,

    /// Sessions stopped on request
    sessions_stopped: AtomicU64,

    /// Startup timestamp (unix seconds)
    startup_time: AtomicU64,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            startup_time: AtomicU64::new(now),
            ..Default::default()
        }
    }

    pub fn chunk_captured(&self) {
        self.chunks_captured.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_sent(&self) {
        self.chunks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped_not_open(&self) {
        self.chunks_dropped_not_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn chunk_dropped_buffer_full(&self) {
        self.chunks_dropped_buffer_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_evicted(&self, count: u64) {
        self.queue_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn decode_failed(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tags_published(&self, count: u64) {
        self.tags_published.fetch_add(count, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        MetricsSnapshot {
            chunks_captured: self.chunks_captured.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            chunks_dropped_not_open: self.chunks_dropped_not_open.load(Ordering::Relaxed),
            chunks_dropped_buffer_full: self.chunks_dropped_buffer_full.load(Ordering::Relaxed),
            queue_evictions: self.queue_evictions.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            tags_published: self.tags_published.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_stopped: self.sessions_stopped.load(Ordering::Relaxed),
            uptime_secs: now.saturating_sub(self.startup_time.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub chunks_captured: u64,
    pub chunks_sent: u64,
    pub chunks_dropped_not_open: u64,
    pub chunks_dropped_buffer_full: u64,
    pub queue_evictions: u64,
    pub decode_failures: u64,
    pub tags_published: u64,
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub sessions_stopped: u64,
    pub uptime_secs: u64,
}

static GLOBAL_METRICS: OnceLock<Metrics> = OnceLock::new();

/// Process-wide metrics instance
pub fn global_metrics() -> &'static Metrics {
    GLOBAL_METRICS.get_or_init(Metrics::new)
}
