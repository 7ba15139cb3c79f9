//! Reconnect backoff schedule.

use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Exponential backoff parameters for the client reconnect loop.
#[derive(Clone, Copy, Debug)]
pub struct BackoffOptions {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Ceiling applied to the exponential schedule.
    pub max_delay: Duration,
    /// Multiplier between consecutive attempts.
    pub factor: f64,
    /// Upward jitter factor in `0.0..=1.0`.
    pub randomisation_factor: f64,
}

impl Default for BackoffOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
            randomisation_factor: 0.25,
        }
    }
}

impl BackoffOptions {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(Error::config("Initial reconnect delay must be > 0"));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::config(
                "Max reconnect delay must be >= initial reconnect delay",
            ));
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return Err(Error::config("Backoff factor must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.randomisation_factor) {
            return Err(Error::config(
                "Randomisation factor must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    ///
    /// `delay_n = min(max_delay, initial_delay * factor^(n-1))`, perturbed
    /// upward by at most `randomisation_factor`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = self.factor.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let base = (self.initial_delay.as_secs_f64() * exponent).min(self.max_delay.as_secs_f64());

        if self.randomisation_factor == 0.0 {
            return Duration::from_secs_f64(base);
        }

        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(0.0..=self.randomisation_factor);
        Duration::from_secs_f64(base * (1.0 + jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_is_exponential_and_capped() {
        let backoff = BackoffOptions {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            randomisation_factor: 0.0,
        };
        let delays: Vec<u128> = (1..=6).map(|n| backoff.delay_for(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = BackoffOptions {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            factor: 2.0,
            randomisation_factor: 0.25,
        };
        for attempt in 1..=8 {
            let base = (1000.0 * 2.0_f64.powi(attempt as i32 - 1)).min(10_000.0);
            let delay = backoff.delay_for(attempt).as_secs_f64() * 1000.0;
            assert!(delay >= base - 1.0, "attempt {attempt}: {delay} < {base}");
            assert!(
                delay <= base * 1.25 + 1.0,
                "attempt {attempt}: {delay} > {}",
                base * 1.25
            );
        }
    }

    #[test]
    fn rejects_bad_parameters() {
        let mut backoff = BackoffOptions::default();
        backoff.factor = 0.5;
        assert!(backoff.validate().is_err());

        let mut backoff = BackoffOptions::default();
        backoff.randomisation_factor = 1.5;
        assert!(backoff.validate().is_err());

        let mut backoff = BackoffOptions::default();
        backoff.max_delay = Duration::from_millis(1);
        assert!(backoff.validate().is_err());

        assert!(BackoffOptions::default().validate().is_ok());
    }
}
