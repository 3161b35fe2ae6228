//! Process-wide counters.
//!
//! Aggregates only; surfaced through log lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::server::registry::format_span;

/// Server metrics collector.
pub struct ServerMetrics {
    start_time: Instant,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    /// Connections closed by the blacklist
    rejected: AtomicU64,
    /// Clients that spoke neither SOCKS5 nor HTTP proxy
    protocol_errors: AtomicU64,
    /// Failed upstream or target dials
    upstream_failures: AtomicU64,
    /// Plaintext bytes from the plain side into the tunnel
    bytes_sealed: AtomicU64,
    /// Plaintext bytes out of the tunnel to the plain side
    bytes_opened: AtomicU64,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            upstream_failures: AtomicU64::new(0),
            bytes_sealed: AtomicU64::new(0),
            bytes_opened: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections. Returns the active count.
    pub fn increment_connections(&self) -> u64 {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upstream_failures(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the byte totals of a finished relay.
    pub fn add_relayed(&self, sealed: u64, opened: u64) {
        self.bytes_sealed.fetch_add(sealed, Ordering::Relaxed);
        self.bytes_opened.fetch_add(opened, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            rejected: self.rejected.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            bytes_sealed: self.bytes_sealed.load(Ordering::Relaxed),
            bytes_opened: self.bytes_opened.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected: u64,
    pub protocol_errors: u64,
    pub upstream_failures: u64,
    pub bytes_sealed: u64,
    pub bytes_opened: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "up {}, {} connections ({} active), {} rejected, {} protocol errors, \
             {} upstream failures, {}B sealed, {}B opened",
            format_span(self.uptime_secs as i64),
            self.total_connections,
            self.active_connections,
            self.rejected,
            self.protocol_errors,
            self.upstream_failures,
            self.bytes_sealed,
            self.bytes_opened
        )
    }
}
