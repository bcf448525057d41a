//! Observability: per-endpoint counters and the metric gateway.
//!
//! Counters are emitted twice: through the process-wide `metrics` facade
//! (picked up by whatever recorder the embedding application installs —
//! see [`gateway`]) and into an [`EngineStats`] atomic block shared across
//! one engine run for the programmatic [`EngineReport`]
//! (crate::engine::EngineReport).

pub mod gateway;

pub use gateway::{MetricGateway, MetricsServer};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use metrics::{counter, histogram};

/// Metric label form of an endpoint address: `host_port` with dots and
/// colons sanitized to underscores.
pub fn sanitize_addr(host: &str, port: u16) -> String {
    format!("{}_{}", host, port).replace(['.', ':'], "_")
}

/// A successful forced write, with emit-to-flush latency.
pub fn record_endpoint_send(addr: &str, latency: Duration) {
    let labels = [("endpoint", addr.to_string())];
    counter!("rdbshift_endpoint_sends_total", &labels).increment(1);
    histogram!("rdbshift_endpoint_send_latency_seconds", &labels).record(latency.as_secs_f64());
}

/// A non-error reply drained from an endpoint.
pub fn record_endpoint_success(addr: &str) {
    let labels = [("endpoint", addr.to_string())];
    counter!("rdbshift_endpoint_success_total", &labels).increment(1);
}

/// A failure, tagged by reason (`respond`, `connect`, `cross-slot`, …).
pub fn record_endpoint_failure(addr: &str, reason: &str) {
    let labels = [
        ("endpoint", addr.to_string()),
        ("reason", reason.to_string()),
    ];
    counter!("rdbshift_endpoint_failures_total", &labels).increment(1);
}

/// A supervisor-triggered endpoint rebuild.
pub fn record_endpoint_reconnect(addr: &str) {
    let labels = [("endpoint", addr.to_string())];
    counter!("rdbshift_endpoint_reconnects_total", &labels).increment(1);
}

/// Additive counters shared across all endpoints of one engine run.
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Forced writes.
    pub sends: AtomicU64,
    /// Non-error replies drained.
    pub successes: AtomicU64,
    /// Failures of any reason.
    pub failures: AtomicU64,
    /// Endpoint rebuilds.
    pub reconnects: AtomicU64,
}

impl EngineStats {
    /// A consistent-enough point-in-time copy.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sends: self.sends.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value copy of [`EngineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatsSnapshot {
    /// Forced writes.
    pub sends: u64,
    /// Non-error replies drained.
    pub successes: u64,
    /// Failures of any reason.
    pub failures: u64,
    /// Endpoint rebuilds.
    pub reconnects: u64,
}
