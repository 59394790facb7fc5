//! Backoff policy for transport failures.
//!
//! Loops that hit a [`TransportError`](super::TransportError) sleep through
//! this schedule instead of spinning, and reset it on the next success.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Standard backoff for transport receive/send failures.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Unbounded attempts (the loop's active flag bounds the retry lifetime)
/// - Jitter enabled
pub fn transport_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .without_max_times()
        .with_jitter()
}

/// Running backoff state for a transport loop.
///
/// `delay` yields the next sleep duration; `reset` is called after any
/// successful transport operation.
pub struct TransportBackoff {
    current: Box<dyn Iterator<Item = Duration> + Send>,
}

impl TransportBackoff {
    /// Fresh schedule from [`transport_backoff`].
    pub fn new() -> Self {
        Self {
            current: Box::new(transport_backoff().build()),
        }
    }

    /// Next delay in the schedule.
    pub fn delay(&mut self) -> Duration {
        self.current.next().unwrap_or(Duration::from_secs(5))
    }

    /// Restart the schedule after a success.
    pub fn reset(&mut self) {
        self.current = Box::new(transport_backoff().build());
    }
}

impl Default for TransportBackoff {
    fn default() -> Self {
        Self::new()
    }
}
