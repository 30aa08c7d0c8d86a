//! Prometheus metrics for the ember client.
//!
//! Enable the `metrics` feature flag to use this functionality.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ember_client::metrics::ClientMetrics;
//!
//! let metrics = ClientMetrics::new("myapp")?;
//! let cluster = Cluster::connect_with_telemetry(config, Arc::new(metrics.clone())).await?;
//! metrics.track_connections(cluster.subscribe_events());
//!
//! // Export for Prometheus scraping
//! let text = metrics.encode_text()?;
//! ```

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::ConnectionEvent;
use crate::diagnostics::{OperationEvent, OperationOutcome, Telemetry};

/// Prometheus metrics for tracking client behavior.
///
/// This struct provides metrics for monitoring:
/// - Connection lifecycle
/// - Operation counts and latencies by operation
/// - Errors by category
/// - Retries
///
/// All metrics are thread-safe and can be shared across async tasks.
#[derive(Clone)]
pub struct ClientMetrics {
    registry: Registry,
    connections_active: IntGauge,
    connections_total: IntCounter,
    requests_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    errors_total: IntCounterVec,
    retries_total: IntCounter,
}

fn metric_error(e: prometheus::Error) -> MetricsError {
    MetricsError::new(format!("metric creation failed: {}", e))
}

impl ClientMetrics {
    /// Creates a new `ClientMetrics` instance with the given prefix.
    ///
    /// The prefix is prepended to all metric names to allow multiple clients
    /// to coexist in the same application.
    pub fn new(prefix: &str) -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let connections_active = IntGauge::with_opts(Opts::new(
            format!("{}_connections_active", prefix),
            "Number of currently open node connections",
        ))
        .map_err(metric_error)?;

        let connections_total = IntCounter::with_opts(Opts::new(
            format!("{}_connections_total", prefix),
            "Total number of node connections opened since client start",
        ))
        .map_err(metric_error)?;

        let requests_total = IntCounterVec::new(
            Opts::new(
                format!("{}_requests_total", prefix),
                "Total number of operations by operation and outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metric_error)?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                format!("{}_request_duration_seconds", prefix),
                "Operation duration in seconds, including retries",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ]),
            &["operation"],
        )
        .map_err(metric_error)?;

        let errors_total = IntCounterVec::new(
            Opts::new(
                format!("{}_errors_total", prefix),
                "Total number of failed operations by error category",
            ),
            &["category"],
        )
        .map_err(metric_error)?;

        let retries_total = IntCounter::with_opts(Opts::new(
            format!("{}_retries_total", prefix),
            "Total number of retried attempts",
        ))
        .map_err(metric_error)?;

        registry
            .register(Box::new(connections_active.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(connections_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(requests_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(request_duration_seconds.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(errors_total.clone()))
            .map_err(metric_error)?;
        registry
            .register(Box::new(retries_total.clone()))
            .map_err(metric_error)?;

        Ok(Self {
            registry,
            connections_active,
            connections_total,
            requests_total,
            request_duration_seconds,
            errors_total,
            retries_total,
        })
    }

    /// Records that a new connection was opened.
    pub fn record_connection_opened(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    /// Records that a connection was closed.
    pub fn record_connection_closed(&self) {
        self.connections_active.dec();
    }

    /// Updates connection gauges from a lifecycle event.
    pub fn record_connection_event(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { .. } => self.record_connection_opened(),
            ConnectionEvent::Disconnected { .. } => self.record_connection_closed(),
            _ => {}
        }
    }

    /// Spawns a task feeding connection events into the gauges until the
    /// channel closes.
    pub fn track_connections(
        &self,
        mut events: broadcast::Receiver<ConnectionEvent>,
    ) -> JoinHandle<()> {
        let metrics = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => metrics.record_connection_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "metrics fell behind connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Records a completed operation with its duration.
    pub fn record_request(&self, operation: &str, outcome: &str, duration: Duration) {
        self.requests_total
            .with_label_values(&[operation, outcome])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Records an error occurrence.
    pub fn record_error(&self, category: &str) {
        self.errors_total.with_label_values(&[category]).inc();
    }

    /// Returns the current number of active connections.
    pub fn active_connections(&self) -> i64 {
        self.connections_active.get()
    }

    /// Returns the total number of connections opened.
    pub fn total_connections(&self) -> u64 {
        self.connections_total.get()
    }

    /// Returns the total number of retried attempts.
    pub fn total_retries(&self) -> u64 {
        self.retries_total.get()
    }

    /// Gathers all metric families for Prometheus exposition.
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encodes all metrics as Prometheus text format.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let metric_families = self.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| MetricsError::new(format!("encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::new(format!("invalid UTF-8: {}", e)))
    }

    /// Returns a reference to the underlying Prometheus registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Telemetry for ClientMetrics {
    fn record(&self, event: &OperationEvent) {
        let label = event.outcome.label();
        self.record_request(event.operation, label, event.latency);
        if let OperationOutcome::Failure { .. } = event.outcome {
            self.record_error(label);
        }
        if event.attempts > 1 {
            self.retries_total.inc_by(u64::from(event.attempts - 1));
        }
    }
}

impl std::fmt::Debug for ClientMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientMetrics")
            .field("connections_active", &self.connections_active.get())
            .field("connections_total", &self.connections_total.get())
            .finish_non_exhaustive()
    }
}

/// Error type for metrics operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsError {
    message: String,
}

impl MetricsError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MetricsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "metrics error: {}", self.message)
    }
}

impl std::error::Error for MetricsError {}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::ErrorCategory;

    fn event(outcome: OperationOutcome, attempts: u32) -> OperationEvent {
        OperationEvent {
            operation: "get",
            outcome,
            latency: Duration::from_millis(2),
            attempts,
            node: None,
        }
    }

    #[test]
    fn test_metrics_record_events() {
        let metrics = ClientMetrics::new("test").unwrap();
        metrics.record(&event(OperationOutcome::Success, 1));
        metrics.record(&event(
            OperationOutcome::Failure {
                category: ErrorCategory::Ambiguous,
                error: "ambiguous timeout".to_string(),
            },
            3,
        ));

        assert_eq!(metrics.total_retries(), 2);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("test_requests_total"));
        assert!(text.contains("outcome=\"ambiguous\""));
        assert!(text.contains("test_errors_total{category=\"ambiguous\"} 1"));
    }

    #[test]
    fn test_connection_events_move_gauges() {
        let metrics = ClientMetrics::new("conn").unwrap();
        let address = "127.0.0.1:11210".parse().unwrap();
        let id = crate::connection::ConnectionId::new();

        metrics.record_connection_event(&ConnectionEvent::Connected { id, address });
        metrics.record_connection_event(&ConnectionEvent::Connected { id, address });
        metrics.record_connection_event(&ConnectionEvent::Disconnected {
            id,
            address,
            error: None,
        });

        assert_eq!(metrics.total_connections(), 2);
        assert_eq!(metrics.active_connections(), 1);
    }

    #[test]
    fn test_duplicate_prefix_registries_are_independent() {
        let a = ClientMetrics::new("dup").unwrap();
        let b = ClientMetrics::new("dup").unwrap();
        a.record_connection_opened();
        assert_eq!(b.total_connections(), 0);
    }
}
