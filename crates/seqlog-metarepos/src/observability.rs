//! Metrics for the metadata repository
//!
//! Lightweight, Rust-native metrics using the `metrics` crate with
//! Prometheus export support.
//!
//! # Feature Flags
//!
//! ```toml
//! # Cargo.toml
//! seqlog-metarepos = { version = "0.1", features = ["metrics-prometheus"] }
//! ```
//!
//! Without the feature every call compiles to nothing.
//!
//! # Usage
//!
//! ```rust,ignore
//! use seqlog_metarepos::observability::{init_metrics, RepositoryMetrics};
//!
//! init_metrics(None)?;
//! RepositoryMetrics::increment_commit_rounds();
//! RepositoryMetrics::set_applied_index(42);
//! ```

#![cfg_attr(not(feature = "metrics-prometheus"), allow(unused_variables))]

use crate::error::Result;
#[cfg(feature = "metrics-prometheus")]
use crate::error::RepositoryError;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

// ============================================================================
// Repository Metrics
// ============================================================================

/// Apply loop and request metrics
pub struct RepositoryMetrics;

impl RepositoryMetrics {
    // ---- Counters ----

    /// Entries proposed to the consensus log
    pub fn increment_proposals(kind: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_proposals_total", "kind" => kind).increment(1);
    }

    /// Commit rounds appended
    pub fn increment_commit_rounds() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_commit_rounds_total").increment(1);
    }

    /// Entries committed across all log streams
    pub fn add_committed_entries(count: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_committed_entries_total").increment(count);
    }

    /// Commit proposals rejected because their base version was stale
    pub fn increment_stale_rounds() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_stale_rounds_total").increment(1);
    }

    /// Reports accepted into the store
    pub fn add_reports_applied(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_reports_applied_total").increment(count as u64);
    }

    /// Snapshots taken
    pub fn increment_snapshots() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_snapshots_total").increment(1);
    }

    /// Client requests that hit their deadline
    pub fn increment_deadline_exceeded(op: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_deadline_exceeded_total", "op" => op).increment(1);
    }

    // ---- Gauges ----

    pub fn set_applied_index(index: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_applied_index").set(index as f64);
    }

    pub fn set_last_version(version: u64) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_last_version").set(version as f64);
    }

    pub fn set_commit_history_len(len: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_commit_history_rounds").set(len as f64);
    }

    /// Whether this replica is the leader (1 = yes, 0 = no)
    pub fn set_is_leader(is_leader: bool) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_is_leader").set(if is_leader { 1.0 } else { 0.0 });
    }

    // ---- Histograms ----

    /// Time from proposal to apply result for a client request
    pub fn record_request_latency(op: &'static str, duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("seqlog_mr_request_latency_seconds", "op" => op)
            .record(duration.as_secs_f64());
    }

    pub fn record_snapshot_duration(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("seqlog_mr_snapshot_duration_seconds").record(duration.as_secs_f64());
    }

    /// Reports batched into one `Reports` entry
    pub fn record_report_batch(size: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("seqlog_mr_report_batch_size").record(size as f64);
    }
}

// ============================================================================
// Collector Metrics
// ============================================================================

/// Storage node polling metrics
pub struct CollectorMetrics;

impl CollectorMetrics {
    pub fn set_executor_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_collector_executors").set(count as f64);
    }

    pub fn set_committer_count(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::gauge!("seqlog_mr_collector_committers").set(count as f64);
    }

    pub fn record_report_latency(duration: Duration) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::histogram!("seqlog_mr_get_report_latency_seconds").record(duration.as_secs_f64());
    }

    pub fn increment_rpc_errors(rpc: &'static str) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_storage_node_rpc_errors_total", "rpc" => rpc).increment(1);
    }

    pub fn add_commits_pushed(count: usize) {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_commits_pushed_total").increment(count as u64);
    }

    /// Reports dropped because the report queue was full
    pub fn increment_reports_dropped() {
        #[cfg(feature = "metrics-prometheus")]
        metrics::counter!("seqlog_mr_reports_dropped_total").increment(1);
    }
}

/// Install the Prometheus recorder with an HTTP listener serving `/metrics`
#[cfg(feature = "metrics-prometheus")]
pub fn init_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| {
            RepositoryError::InvalidConfig(format!("metrics exporter on {addr}: {e}"))
        })?;
    tracing::info!(%addr, "Serving repository metrics");
    Ok(())
}

static EXPORTER: OnceLock<Option<SocketAddr>> = OnceLock::new();

/// Set up metrics export once per process
///
/// Later calls are no-ops. Without the `metrics-prometheus` feature the
/// address is ignored.
pub fn init_metrics(prometheus_addr: Option<SocketAddr>) -> Result<()> {
    if EXPORTER.set(prometheus_addr).is_err() {
        return Ok(());
    }
    #[cfg(feature = "metrics-prometheus")]
    if let Some(addr) = prometheus_addr {
        init_prometheus_exporter(addr)?;
    }
    Ok(())
}
