//! Diagnostics and monitoring utilities.

mod ping;
mod slow_ops;
mod telemetry;

pub use ping::{EndpointPing, PingReport};
pub use slow_ops::{OperationTracker, SlowOperationDetector};
pub use telemetry::{
    CompositeTelemetry, OperationEvent, OperationOutcome, Telemetry, TracingTelemetry,
};

#[cfg(feature = "metrics")]
pub use crate::metrics::{ClientMetrics, MetricsError};
