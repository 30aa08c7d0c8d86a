//! Per-call dispatch overrides.

use std::time::Duration;

use crate::config::RetryConfig;

/// Overrides applied to a single [`Dispatcher::execute`](super::Dispatcher::execute) call.
///
/// Unset fields fall back to the client configuration.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    /// End-to-end deadline for the call, including retries.
    pub timeout: Option<Duration>,
    /// Retry policy for the call.
    pub retry: Option<RetryConfig>,
    /// Treat the request as idempotent (or not) regardless of its opcode.
    pub idempotent: Option<bool>,
}

impl DispatchOptions {
    /// Options with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Overrides the idempotency classification.
    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }
}
