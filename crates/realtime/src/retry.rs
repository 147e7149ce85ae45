//! Reconnect bookkeeping.

use std::time::Duration;

use rand::Rng;

use crate::types::ReconnectConfig;

/// Consecutive-failure counter and the last scheduled delay.
///
/// Delays never decrease within a failure streak and never exceed
/// `max_delay`; jitter is absorbed by clamping against the previous delay.
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    attempt: u32,
    next_delay: Duration,
    ceiling_signalled: bool,
}

impl RetryState {
    /// Number of consecutive failed attempts.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Clears the streak after a healthy channel.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Records a failure and returns the delay before the next attempt.
    pub(crate) fn on_failure(&mut self, config: &ReconnectConfig) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.on_failure_with(config, unit)
    }

    /// [`on_failure`](Self::on_failure) with an explicit jitter unit in
    /// `[-1.0, 1.0]`.
    pub(crate) fn on_failure_with(&mut self, config: &ReconnectConfig, unit: f64) -> Duration {
        let delay = if self.attempt >= config.attempt_ceiling {
            config.max_delay
        } else {
            config
                .delay_for_attempt(self.attempt, unit)
                .max(self.next_delay)
                .min(config.max_delay)
        };
        self.attempt = self.attempt.saturating_add(1);
        self.next_delay = delay;
        delay
    }

    /// Returns true exactly once per streak, when the attempt ceiling is hit.
    pub(crate) fn take_ceiling_crossing(&mut self, config: &ReconnectConfig) -> bool {
        if !self.ceiling_signalled && self.attempt >= config.attempt_ceiling {
            self.ceiling_signalled = true;
            return true;
        }
        false
    }
}
