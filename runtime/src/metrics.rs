//! Prometheus metrics for the consumer.
//!
//! The runtime components record through the `metrics` facade; this module
//! registers the metric descriptions and exposes them over HTTP for
//! Prometheus scraping.
//!
//! # Metrics
//!
//! - `messages_consumed_total` — messages pulled from the command queue
//! - `mailboxes_active` — live per-key mailboxes
//! - `in_flight_messages` — contexts enqueued or executing
//! - `handler_duration_seconds` — handler execution time
//! - `optimistic_concurrency_retries_total` — conflict retries
//! - `handler_failures_total{kind=domain|system}` — failed handlings
//! - `outbox_envelopes_published_total` / `outbox_publish_errors_total` —
//!   transport publishes
//!
//! # Example
//!
//! ```rust,no_run
//! use mailroom_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Initialize metrics and start the HTTP exporter.
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed. If a
    /// recorder is already installed (common in tests), the call logs a
    /// warning and succeeds.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Latency buckets for handler durations
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install() {
            Ok(()) => {
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Install a recorder without the HTTP listener and keep the handle,
    /// for rendering metrics in-process (tests, embedding).
    ///
    /// # Errors
    ///
    /// Returns an error if the exporter cannot be built or installed.
    pub fn start_local(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new();
        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` unless [`MetricsServer::start_local`] installed the
    /// recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "messages_consumed_total",
        "Total number of messages pulled from the command queue"
    );
    describe_gauge!(
        "mailboxes_active",
        "Number of live per-key mailboxes"
    );
    describe_gauge!(
        "in_flight_messages",
        "Number of contexts enqueued or executing"
    );
    describe_histogram!(
        "handler_duration_seconds",
        "Time taken to execute command handlers"
    );
    describe_counter!(
        "optimistic_concurrency_retries_total",
        "Total number of optimistic-concurrency retries"
    );
    describe_counter!(
        "handler_failures_total",
        "Total number of failed command handlings by kind (domain|system)"
    );
    describe_counter!(
        "outbox_envelopes_published_total",
        "Total number of outbox envelopes published to the transport"
    );
    describe_counter!(
        "outbox_publish_errors_total",
        "Total number of transport publish errors (recovered by the outbox relay)"
    );
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.render().is_none());
    }

    #[test]
    fn local_recorder_renders_registered_metrics() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start_local().expect("local recorder should install");

        counter!("messages_consumed_total").increment(3);
        gauge!("in_flight_messages").set(2.0);

        // If another test installed the global recorder first, the handle
        // is None; metrics still flow to the shared recorder.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("messages_consumed_total"));
            assert!(rendered.contains("in_flight_messages"));
        }
    }
}
