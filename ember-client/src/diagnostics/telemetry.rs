//! Per-operation telemetry callbacks.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ember_core::{EmberError, ErrorCategory};

/// How a dispatched operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed.
    Failure {
        /// Error category.
        category: ErrorCategory,
        /// Rendered error.
        error: String,
    },
}

impl OperationOutcome {
    /// Builds the outcome for a dispatch result.
    pub fn from_result<T>(result: &Result<T, EmberError>) -> Self {
        match result {
            Ok(_) => Self::Success,
            Err(e) => Self::Failure {
                category: e.category(),
                error: e.to_string(),
            },
        }
    }

    /// Returns `true` for [`OperationOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Short label for logs and metric labels.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { category, .. } => match category {
                ErrorCategory::Transient => "transient",
                ErrorCategory::Conflict => "conflict",
                ErrorCategory::Ambiguous => "ambiguous",
                ErrorCategory::Fatal => "fatal",
                ErrorCategory::Definite => "failed",
            },
        }
    }
}

/// One finished operation, as reported to [`Telemetry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    /// Operation name, e.g. `get` or `mutate_in`.
    pub operation: &'static str,
    /// How it ended.
    pub outcome: OperationOutcome,
    /// Time from dispatch to resolution, including retries.
    pub latency: Duration,
    /// Number of attempts made.
    pub attempts: u32,
    /// Node the last attempt was sent to, if any.
    pub node: Option<SocketAddr>,
}

/// Receives an event for every dispatched operation.
///
/// Called inline on the dispatching task, so implementations should not block.
pub trait Telemetry: Send + Sync + fmt::Debug {
    /// Records one finished operation.
    fn record(&self, event: &OperationEvent);
}

/// Logs every operation through `tracing` at debug level, failures at warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn record(&self, event: &OperationEvent) {
        match &event.outcome {
            OperationOutcome::Success => tracing::debug!(
                operation = event.operation,
                latency_us = event.latency.as_micros() as u64,
                attempts = event.attempts,
                node = ?event.node,
                "operation completed"
            ),
            OperationOutcome::Failure { error, .. } => tracing::warn!(
                operation = event.operation,
                outcome = event.outcome.label(),
                latency_us = event.latency.as_micros() as u64,
                attempts = event.attempts,
                node = ?event.node,
                error = %error,
                "operation failed"
            ),
        }
    }
}

/// Fans an event out to several sinks.
#[derive(Debug, Default, Clone)]
pub struct CompositeTelemetry {
    sinks: Vec<Arc<dyn Telemetry>>,
}

impl CompositeTelemetry {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with(mut self, sink: Arc<dyn Telemetry>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if there are no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Telemetry for CompositeTelemetry {
    fn record(&self, event: &OperationEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct Recording(Mutex<Vec<OperationEvent>>);

    impl Telemetry for Recording {
        fn record(&self, event: &OperationEvent) {
            self.0.lock().push(event.clone());
        }
    }

    fn event(outcome: OperationOutcome) -> OperationEvent {
        OperationEvent {
            operation: "get",
            outcome,
            latency: Duration::from_millis(3),
            attempts: 1,
            node: None,
        }
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: Result<(), EmberError> = Ok(());
        assert!(OperationOutcome::from_result(&ok).is_success());

        let err: Result<(), EmberError> = Err(EmberError::AmbiguousTimeout("upsert".into()));
        let outcome = OperationOutcome::from_result(&err);
        assert_eq!(outcome.label(), "ambiguous");
    }

    #[test]
    fn test_composite_fans_out() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let composite = CompositeTelemetry::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(TracingTelemetry));
        assert_eq!(composite.len(), 3);

        composite.record(&event(OperationOutcome::Success));
        assert_eq!(a.0.lock().len(), 1);
        assert_eq!(b.0.lock()[0].operation, "get");
    }
}
