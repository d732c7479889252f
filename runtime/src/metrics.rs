//! Prometheus metrics for the consumption pipeline.
//!
//! This module provides metric collection for:
//! - Message intake and settlement (acknowledge, release)
//! - Retry lane scheduling and dead-lettering
//! - Dispatcher latency
//! - Partition worker lifecycle
//!
//! # Example
//!
//! ```rust,no_run
//! use notification_relay_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://0.0.0.0:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use notification_relay_core::error::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other crates
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
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

    /// Initialize metrics and start the HTTP listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or its address cannot
    /// be bound.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), the call
    /// is logged and treated as success.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            // In tests, multiple MetricsServer instances may be created
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        tokio::spawn(async move {
            // `ExporterError` (metrics-exporter-prometheus 0.15) implements
            // neither `Debug` nor `Display`, so it cannot be recorded as a field.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped");
            }
        });

        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Intake
    describe_counter!(
        "consumer_messages_received_total",
        "Total number of messages received from the bus"
    );
    describe_counter!(
        "consumer_messages_skipped_total",
        "Messages discarded while a released partition rewinds"
    );

    // Settlement
    describe_counter!(
        "consumer_messages_acknowledged_total",
        "Total number of messages whose consumer position was committed"
    );
    describe_counter!(
        "consumer_messages_unacknowledged_total",
        "Messages left unacknowledged because the sink or retry lane failed"
    );
    describe_counter!(
        "consumer_messages_released_total",
        "Messages rewound for bus-level redelivery"
    );
    describe_counter!(
        "consumer_settlement_errors_total",
        "Failures to commit or rewind a consumer position"
    );

    // Retry lane and dead letters
    describe_counter!(
        "consumer_retries_scheduled_total",
        "Total number of redeliveries scheduled on the retry lane"
    );
    describe_histogram!(
        "consumer_retry_delay_seconds",
        "Backoff delay of scheduled redeliveries"
    );
    describe_counter!(
        "consumer_dead_letters_total",
        "Total number of messages written to the dead-letter sink"
    );

    // Dispatch
    describe_histogram!(
        "consumer_dispatch_duration_seconds",
        "Time taken by the dispatcher per attempt"
    );
    describe_counter!(
        "consumer_dispatch_failures_total",
        "Dispatcher failures by kind"
    );

    // Workers
    describe_gauge!(
        "consumer_active_workers",
        "Number of running partition workers"
    );
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record a received message.
    pub fn record_received(topic: &str) {
        counter!("consumer_messages_received_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message discarded while its partition rewinds.
    pub fn record_skipped(topic: &str) {
        counter!("consumer_messages_skipped_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a committed message.
    pub fn record_acknowledged(topic: &str) {
        counter!("consumer_messages_acknowledged_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a message left unacknowledged.
    pub fn record_unacknowledged(topic: &str) {
        counter!("consumer_messages_unacknowledged_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a partition rewind.
    pub fn record_released(topic: &str) {
        counter!("consumer_messages_released_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a failed commit or rewind.
    pub fn record_settlement_error(topic: &str) {
        counter!("consumer_settlement_errors_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a scheduled redelivery.
    pub fn record_retry_scheduled(topic: &str, delay: Duration) {
        counter!("consumer_retries_scheduled_total", "topic" => topic.to_string()).increment(1);
        histogram!("consumer_retry_delay_seconds").record(delay.as_secs_f64());
    }

    /// Record a dead-lettered message.
    pub fn record_dead_lettered(topic: &str, kind: ErrorKind) {
        counter!(
            "consumer_dead_letters_total",
            "topic" => topic.to_string(),
            "kind" => kind.as_str()
        )
        .increment(1);
    }

    /// Record one dispatcher call.
    pub fn record_dispatch(duration: Duration, failure: Option<ErrorKind>) {
        histogram!("consumer_dispatch_duration_seconds").record(duration.as_secs_f64());
        if let Some(kind) = failure {
            counter!("consumer_dispatch_failures_total", "kind" => kind.as_str()).increment(1);
        }
    }

    /// Record a partition worker starting.
    pub fn record_worker_started() {
        gauge!("consumer_active_workers").increment(1.0);
    }

    /// Record a partition worker stopping.
    pub fn record_worker_stopped() {
        gauge!("consumer_active_workers").decrement(1.0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn test_metrics_server_render() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut server = MetricsServer::new(addr);
        server.start().unwrap();

        ConsumerMetrics::record_received("reservation-created");
        ConsumerMetrics::record_dead_lettered("reservation-created", ErrorKind::Decode);
        ConsumerMetrics::record_dispatch(Duration::from_millis(5), None);

        // If another test installed the recorder first, handle is None.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("consumer_messages_received_total"));
            assert!(rendered.contains("consumer_dead_letters_total"));
        }
    }
}
