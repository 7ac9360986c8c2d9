//! Observability and Metrics
//!
//! Per-engine counters for connections, frames and pipeline outcomes.
//!
//! Every counter is a relaxed atomic; values are for monitoring, not for
//! synchronization.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Counters shared by every transport of one server
#[derive(Debug)]
pub struct Metrics {
    /// Sessions accepted (TCP/TLS connections, QUIC connections, DTLS sessions)
    pub connections_total: AtomicU64,
    /// Sessions currently open
    pub connections_active: AtomicU64,
    /// Frames decoded and dispatched
    pub frames_received: AtomicU64,
    /// Response frames handed to a reply channel
    pub frames_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Frames dropped by the codec
    pub decode_errors: AtomicU64,
    /// Replies that failed to reach the peer
    pub write_errors: AtomicU64,
    /// Packs with no registered handler
    pub not_found: AtomicU64,
    /// Handler panics converted to server-error replies
    pub panics_recovered: AtomicU64,
    /// Requests rejected by the rate limiter
    pub rate_limited: AtomicU64,
    /// Per-message tasks that could not be spawned
    pub spawn_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
            not_found: AtomicU64::new(0),
            panics_recovered: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            spawn_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self, byte_count: u64) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn frame_sent(&self, byte_count: u64) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn panic_recovered(&self) {
        self.panics_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawn_failure(&self) {
        self.spawn_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            panics_recovered: self.panics_recovered.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            spawn_failures: self.spawn_failures.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            frames_received = snapshot.frames_received,
            frames_sent = snapshot.frames_sent,
            bytes_received = snapshot.bytes_received,
            bytes_sent = snapshot.bytes_sent,
            decode_errors = snapshot.decode_errors,
            write_errors = snapshot.write_errors,
            not_found = snapshot.not_found,
            panics_recovered = snapshot.panics_recovered,
            rate_limited = snapshot.rate_limited,
            spawn_failures = snapshot.spawn_failures,
            uptime_seconds = snapshot.uptime_seconds,
            "Server metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub write_errors: u64,
    pub not_found: u64,
    pub panics_recovered: u64,
    pub rate_limited: u64,
    pub spawn_failures: u64,
    pub uptime_seconds: u64,
}

/// Tracks one session for its lifetime: counted on creation, closed on drop
pub struct ConnectionGuard {
    metrics: Arc<Metrics>,
    start: Instant,
    kind: &'static str,
}

impl ConnectionGuard {
    pub fn new(metrics: Arc<Metrics>, kind: &'static str) -> Self {
        metrics.connection_established();
        Self {
            metrics,
            start: Instant::now(),
            kind,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.connection_closed();
        debug!(
            kind = self.kind,
            duration_ms = self.start.elapsed().as_millis() as u64,
            "Session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard_tracks_active() {
        let metrics = Arc::new(Metrics::new());
        {
            let _a = ConnectionGuard::new(Arc::clone(&metrics), "tcp");
            let _b = ConnectionGuard::new(Arc::clone(&metrics), "quic");
            assert_eq!(metrics.snapshot().connections_active, 2);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.connections_active, 0);
        assert_eq!(snap.connections_total, 2);
    }

    #[test]
    fn test_frame_counters() {
        let metrics = Metrics::new();
        metrics.frame_received(17);
        metrics.frame_sent(12);
        metrics.frame_sent(12);
        let snap = metrics.snapshot();
        assert_eq!(snap.frames_received, 1);
        assert_eq!(snap.bytes_received, 17);
        assert_eq!(snap.frames_sent, 2);
        assert_eq!(snap.bytes_sent, 24);
    }
}
