//! Reconnect backoff policy.

use std::time::{Duration, Instant};

use rand::Rng;

/// Milliseconds cap on any computed delay; far longer than any reconnect
/// delay worth using.
const MAX_DELAY_MS: u64 = i32::MAX as u64;

/// Jittered exponential backoff with a reset threshold.
///
/// The delay ceiling for attempt `k` is `min(max_delay, initial * 2^k)`;
/// the actual delay is uniformly distributed over the upper half of the
/// ceiling, so a fleet of clients does not reconnect in lockstep. A
/// connection that stayed up at least `reset_threshold` resets the attempt
/// counter, so an occasional drop on a healthy stream reconnects fast.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BackoffPolicy {
    pub(crate) max_delay: Duration,
    pub(crate) reset_threshold: Duration,
}

impl BackoffPolicy {
    /// The attempt counter to use for the next delay computation.
    pub(crate) fn reset_attempts(&self, attempts: u32, connected_at: Option<Instant>) -> u32 {
        match connected_at {
            Some(opened) if opened.elapsed() >= self.reset_threshold => 1,
            _ => attempts,
        }
    }

    /// The delay before reconnect attempt `attempts`.
    ///
    /// `initial` is read per call because the server can move it with a
    /// `retry:` directive mid-stream.
    pub(crate) fn delay(&self, initial: Duration, attempts: u32) -> Duration {
        let initial_ms = duration_ms(initial);
        let max_ms = duration_ms(self.max_delay);
        let scale = match 1u64.checked_shl(attempts) {
            Some(scale) => scale,
            None => u64::MAX,
        };
        let ceiling = max_ms.min(initial_ms.saturating_mul(scale)).min(MAX_DELAY_MS);
        if ceiling == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        Duration::from_millis(ceiling / 2 + rng.random_range(0..ceiling) / 2)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
