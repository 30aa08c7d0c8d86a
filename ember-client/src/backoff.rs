//! Capped exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Calculates the next backoff duration with jitter applied.
pub(crate) fn calculate_backoff_with_jitter(
    current_backoff: Duration,
    multiplier: f64,
    max_backoff: Duration,
    jitter: f64,
) -> Duration {
    let base_backoff = current_backoff.as_secs_f64() * multiplier;

    let jitter_factor = if jitter > 0.0 {
        let mut rng = rand::thread_rng();
        1.0 + rng.gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    let jittered_backoff = base_backoff * jitter_factor;

    std::cmp::min(Duration::from_secs_f64(jittered_backoff.max(0.0)), max_backoff)
}

/// Stateful backoff sequence built from a [`RetryConfig`].
///
/// The first delay is the configured initial backoff; each following one is
/// multiplied, jittered and capped at the maximum.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    next: Duration,
    multiplier: f64,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub(crate) fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_backoff(),
            multiplier: config.multiplier(),
            max: config.max_backoff(),
            jitter: config.jitter(),
        }
    }

    /// Returns the delay to wait now and advances the sequence.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = calculate_backoff_with_jitter(current, self.multiplier, self.max, self.jitter)
            .max(current.min(self.max));
        current
    }
}
