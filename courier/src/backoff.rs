//! Bounded exponential backoff for per-message retries.
//!
//! The schedule is a pure function of the attempt number: attempt `n` (1-based,
//! counting the attempt that just failed) waits `initial * multiplier^(n-1)`,
//! capped at `max_interval`. The schedule is exhausted once `max_attempts`
//! handler calls have been made, or once the cumulative scheduled wait would
//! exceed `max_elapsed`, whichever comes first.

use rand::Rng;
use std::time::Duration;

use crate::config::{BackoffConfig, ConfigResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    multiplier: f64,
    randomization_factor: f64,
    max_interval: Duration,
    max_elapsed: Duration,
    max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(config: &BackoffConfig) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self::from_validated(config))
    }

    fn from_validated(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial_interval(),
            multiplier: config.multiplier,
            randomization_factor: config.randomization_factor,
            max_interval: config.max_interval(),
            max_elapsed: config.max_elapsed(),
            max_attempts: config.max_attempts,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay scheduled after the given failed attempt, ignoring exhaustion.
    pub fn interval(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before the next attempt after `attempt` calls have failed, or
    /// `None` when no further attempt is allowed.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let delay = self.interval(attempt);
        if self.cumulative_delay(attempt) > self.max_elapsed {
            return None;
        }
        Some(delay)
    }

    /// Sum of the scheduled delays for attempts `1..=attempt`.
    pub fn cumulative_delay(&self, attempt: u32) -> Duration {
        let mut total = Duration::ZERO;
        for n in 1..=attempt {
            let delay = self.interval(n);
            total = total.saturating_add(delay);
            if delay == self.max_interval {
                // Remaining terms are all capped.
                let remaining = attempt - n;
                return total.saturating_add(self.max_interval.saturating_mul(remaining));
            }
        }
        total
    }

    /// Spread a delay uniformly over `delay * (1 ± randomization_factor)`.
    pub fn jitter(&self, delay: Duration) -> Duration {
        if self.randomization_factor == 0.0 || delay.is_zero() {
            return delay;
        }
        let secs = delay.as_secs_f64();
        let spread = secs * self.randomization_factor;
        let jittered = rand::thread_rng().gen_range((secs - spread)..=(secs + spread));
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(self.max_interval)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_validated(&BackoffConfig::default())
    }
}
