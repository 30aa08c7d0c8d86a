//! Slow operation detection and logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::telemetry::{OperationEvent, Telemetry};

/// Detects and logs slow operations based on a configurable threshold.
///
/// Works as a [`Telemetry`] sink for dispatched operations, and through
/// [`start_operation`](Self::start_operation) for longer units of work such
/// as transaction commits.
#[derive(Debug)]
pub struct SlowOperationDetector {
    threshold: Duration,
    logging: bool,
    total_operations: AtomicU64,
    slow_operations: AtomicU64,
}

impl SlowOperationDetector {
    /// Creates a new detector with the specified threshold.
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            logging: true,
            total_operations: AtomicU64::new(0),
            slow_operations: AtomicU64::new(0),
        }
    }

    /// Turns warning logs on or off; counting continues either way.
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Returns the configured slow operation threshold.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Starts tracking an operation.
    ///
    /// Returns a tracker that checks the elapsed time against the threshold
    /// when dropped or finished.
    pub fn start_operation(&self, name: impl Into<String>) -> OperationTracker<'_> {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        OperationTracker {
            detector: self,
            name: name.into(),
            start: Instant::now(),
            finished: false,
        }
    }

    /// Records an operation's duration manually.
    pub fn record_duration(&self, name: &str, duration: Duration) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.check_and_warn(name, duration, None);
    }

    /// Returns the total number of operations tracked.
    pub fn total_operations(&self) -> u64 {
        self.total_operations.load(Ordering::Relaxed)
    }

    /// Returns the number of slow operations detected.
    pub fn slow_operations(&self) -> u64 {
        self.slow_operations.load(Ordering::Relaxed)
    }

    /// Resets the operation counters.
    pub fn reset(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.slow_operations.store(0, Ordering::Relaxed);
    }

    fn check_and_warn(&self, name: &str, duration: Duration, event: Option<&OperationEvent>) {
        if duration <= self.threshold {
            return;
        }
        self.slow_operations.fetch_add(1, Ordering::Relaxed);
        if !self.logging {
            return;
        }
        match event {
            Some(event) => tracing::warn!(
                operation = %name,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.threshold.as_millis() as u64,
                attempts = event.attempts,
                node = ?event.node,
                outcome = event.outcome.label(),
                "slow operation detected"
            ),
            None => tracing::warn!(
                operation = %name,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.threshold.as_millis() as u64,
                "slow operation detected"
            ),
        }
    }
}

impl Telemetry for SlowOperationDetector {
    fn record(&self, event: &OperationEvent) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        self.check_and_warn(event.operation, event.latency, Some(event));
    }
}

/// Tracks the duration of an operation.
///
/// When dropped or finished, logs a warning if the operation exceeded the threshold.
#[derive(Debug)]
pub struct OperationTracker<'a> {
    detector: &'a SlowOperationDetector,
    name: String,
    start: Instant,
    finished: bool,
}

impl<'a> OperationTracker<'a> {
    /// Returns the elapsed duration since the operation started.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes tracking and returns the duration.
    pub fn finish(mut self) -> Duration {
        self.finished = true;
        let duration = self.start.elapsed();
        self.detector.check_and_warn(&self.name, duration, None);
        duration
    }
}

impl Drop for OperationTracker<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let duration = self.start.elapsed();
            self.detector.check_and_warn(&self.name, duration, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::OperationOutcome;
    use std::thread;

    fn event(latency: Duration) -> OperationEvent {
        OperationEvent {
            operation: "upsert",
            outcome: OperationOutcome::Success,
            latency,
            attempts: 2,
            node: None,
        }
    }

    #[test]
    fn test_new_detector() {
        let detector = SlowOperationDetector::new(Duration::from_millis(100));
        assert_eq!(detector.threshold(), Duration::from_millis(100));
        assert_eq!(detector.total_operations(), 0);
        assert_eq!(detector.slow_operations(), 0);
    }

    #[test]
    fn test_record_fast_event() {
        let detector = SlowOperationDetector::new(Duration::from_millis(100));
        detector.record(&event(Duration::from_millis(10)));

        assert_eq!(detector.total_operations(), 1);
        assert_eq!(detector.slow_operations(), 0);
    }

    #[test]
    fn test_record_slow_event() {
        let detector = SlowOperationDetector::new(Duration::from_millis(100));
        detector.record(&event(Duration::from_millis(150)));

        assert_eq!(detector.total_operations(), 1);
        assert_eq!(detector.slow_operations(), 1);
    }

    #[test]
    fn test_record_at_threshold_not_slow() {
        let detector = SlowOperationDetector::new(Duration::from_millis(100));
        detector.record_duration("exact_op", Duration::from_millis(100));

        assert_eq!(detector.total_operations(), 1);
        assert_eq!(detector.slow_operations(), 0);
    }

    #[test]
    fn test_logging_disabled_still_counts() {
        let detector = SlowOperationDetector::new(Duration::ZERO).with_logging(false);
        detector.record_duration("quiet", Duration::from_millis(1));
        assert_eq!(detector.slow_operations(), 1);
    }

    #[test]
    fn test_tracker_detects_slow_on_drop() {
        let detector = SlowOperationDetector::new(Duration::from_millis(5));
        {
            let _tracker = detector.start_operation("commit");
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(detector.total_operations(), 1);
        assert_eq!(detector.slow_operations(), 1);
    }

    #[test]
    fn test_tracker_finish() {
        let detector = SlowOperationDetector::new(Duration::from_secs(10));
        let tracker = detector.start_operation("finish_test");
        assert_eq!(tracker.name(), "finish_test");

        let duration = tracker.finish();
        assert!(duration < Duration::from_secs(1));
        assert_eq!(detector.slow_operations(), 0);
    }

    #[test]
    fn test_reset() {
        let detector = SlowOperationDetector::new(Duration::from_millis(50));
        detector.record_duration("op1", Duration::from_millis(10));
        detector.record_duration("op2", Duration::from_millis(100));
        assert_eq!(detector.slow_operations(), 1);

        detector.reset();

        assert_eq!(detector.total_operations(), 0);
        assert_eq!(detector.slow_operations(), 0);
    }
}
