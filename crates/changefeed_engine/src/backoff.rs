//! Backoff state for a single consumption loop.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Tracks consecutive waits and yields the next delay.
///
/// Delays grow geometrically from `initial_delay` up to `max_delay` and are
/// jittered by `±jitter`. A jittered delay never exceeds `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff at its minimum delay.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the un-jittered delay the next wait would use.
    pub fn current(&self) -> Duration {
        self.config.base_delay(self.attempt)
    }

    /// Number of consecutive waits since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Returns the next delay and grows the backoff.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_hint(None)
    }

    /// Like [`next_delay`](Self::next_delay), but a larger store hint wins.
    pub fn next_delay_with_hint(&mut self, hint: Option<Duration>) -> Duration {
        let delay = self.jittered(self.current());
        self.attempt = self.attempt.saturating_add(1);
        match hint {
            Some(hint) if hint > delay => hint.min(self.config.max_delay),
            _ => delay,
        }
    }

    /// Returns to the minimum delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter;
        if jitter.is_nan() || jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let jitter = jitter.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor).min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn exact() -> BackoffConfig {
        BackoffConfig::default().without_jitter()
    }

    #[test]
    fn grows_until_cap() {
        let mut backoff = Backoff::new(exact());
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.attempts(), 7);
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = Backoff::new(exact());
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.current(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn larger_hint_wins_but_is_capped() {
        let mut backoff = Backoff::new(exact());
        assert_eq!(
            backoff.next_delay_with_hint(Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        // A smaller hint does not shorten the computed delay.
        assert_eq!(
            backoff.next_delay_with_hint(Some(Duration::from_millis(10))),
            Duration::from_secs(2)
        );
        assert_eq!(
            backoff.next_delay_with_hint(Some(Duration::from_secs(600))),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn out_of_range_settings_do_not_panic() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{ "jitter": 1.5, "multiplier": -2.0 }"#).unwrap();
        assert!(config.validate().is_err());

        let mut backoff = Backoff::new(config.clone());
        for _ in 0..10 {
            let delay = backoff.next_delay();
            assert!(delay <= config.max_delay);
            assert!(delay <= Duration::from_secs(2));
        }

        let mut backoff = Backoff::new(BackoffConfig {
            jitter: f64::NAN,
            ..exact()
        });
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn jittered_delay_stays_in_bounds(waits in 0u32..20) {
            let config = BackoffConfig::default();
            let mut backoff = Backoff::new(config.clone());
            for _ in 0..waits {
                backoff.next_delay();
            }
            let base = backoff.current();
            let delay = backoff.next_delay();

            prop_assert!(delay <= config.max_delay);
            prop_assert!(delay >= base.mul_f64(0.8));
            prop_assert!(delay <= base.mul_f64(1.2));
        }
    }
}
