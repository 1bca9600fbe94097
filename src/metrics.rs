//! Metrics for harbor.

use iroh_metrics::{Counter, MetricsGroup};
use serde::{Deserialize, Serialize};

/// Metrics for the replication and admission protocols.
#[allow(missing_docs)]
#[derive(Debug, Default, Serialize, Deserialize, MetricsGroup)]
#[non_exhaustive]
#[metrics(name = "harbor")]
pub struct Metrics {
    /// Number of invitation claims that completed successfully.
    pub claims_succeeded: Counter,
    /// Number of invitation claims that failed or timed out.
    pub claims_failed: Counter,
    /// Number of auth secrets rejected by a claim validator.
    pub claims_rejected: Counter,
    /// Number of sync frames sent over replicator connections.
    pub frames_sent: Counter,
    /// Number of sync frames received and delivered to a connection.
    pub frames_recv: Counter,
    /// Number of inbound messages dropped by the demultiplexer.
    pub frames_dropped: Counter,
    /// Number of sync channel send retries.
    pub channel_retries: Counter,
    /// Number of sync channels forcibly closed after exhausting retries.
    pub channel_retry_failures: Counter,
    /// Number of replicator connections opened.
    pub connections_opened: Counter,
    /// Number of replicator connections closed.
    pub connections_closed: Counter,
    /// Number of registry flushes performed.
    pub registry_flushes: Counter,
    /// Number of inbound updates dropped for unknown documents.
    pub updates_dropped: Counter,
}
