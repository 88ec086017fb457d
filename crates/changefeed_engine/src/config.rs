//! Configuration for change feed consumption.

use crate::error::ConfigError;
use changefeed_protocol::{DeliveryMode, DowngradePolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Configuration for a consumption job.
///
/// Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Maximum number of changes requested per poll.
    pub page_size_hint: u32,
    /// Deadline for a single poll.
    #[serde(with = "duration_ms", rename = "poll_timeout_ms")]
    pub poll_timeout: Duration,
    /// Enriched or plain delivery, fixed at stream start.
    pub mode: DeliveryMode,
    /// Reaction to a store that drops metadata.
    pub downgrade: DowngradePolicy,
    /// Backoff between empty polls and retries.
    pub backoff: BackoffConfig,
    /// Attempts to save a cursor before the range halts.
    pub persist_attempts: u32,
    /// Redeliveries of a failing batch allowed before the range halts.
    pub max_redeliveries: Option<u32>,
    /// Consecutive empty polls after which a range stops.
    pub max_idle_polls: Option<u32>,
    /// Restart from the beginning after the cursor expires.
    pub restart_on_expired: bool,
    /// Time allowed for loops to stop after cancellation.
    #[serde(with = "duration_ms", rename = "shutdown_grace_ms")]
    pub shutdown_grace: Duration,
    /// Extra headers sent with every read.
    pub extra_headers: BTreeMap<String, String>,
}

impl FeedConfig {
    /// Creates a configuration for the given delivery mode.
    pub fn new(mode: DeliveryMode) -> Self {
        Self {
            page_size_hint: 100,
            poll_timeout: Duration::from_secs(10),
            mode,
            downgrade: DowngradePolicy::Fail,
            backoff: BackoffConfig::default(),
            persist_attempts: 3,
            max_redeliveries: None,
            max_idle_polls: None,
            restart_on_expired: true,
            shutdown_grace: Duration::from_secs(5),
            extra_headers: BTreeMap::new(),
        }
    }

    /// Sets the page size hint.
    pub fn with_page_size_hint(mut self, size: u32) -> Self {
        self.page_size_hint = size;
        self
    }

    /// Sets the poll deadline.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Sets the downgrade policy.
    pub fn with_downgrade(mut self, policy: DowngradePolicy) -> Self {
        self.downgrade = policy;
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the number of cursor save attempts.
    pub fn with_persist_attempts(mut self, attempts: u32) -> Self {
        self.persist_attempts = attempts.max(1);
        self
    }

    /// Halts a range once a failing batch was redelivered `limit` times.
    pub fn with_max_redeliveries(mut self, limit: u32) -> Self {
        self.max_redeliveries = Some(limit);
        self
    }

    /// Stops a range after `limit` consecutive empty polls.
    pub fn with_max_idle_polls(mut self, limit: u32) -> Self {
        self.max_idle_polls = Some(limit);
        self
    }

    /// Sets whether an expired cursor restarts the range.
    pub fn with_restart_on_expired(mut self, restart: bool) -> Self {
        self.restart_on_expired = restart;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Adds an extra request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    /// Checks the settings a loop cannot run with.
    ///
    /// Deserialized configurations bypass the builders, so this is checked
    /// again when a loop starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size_hint == 0 {
            return Err(ConfigError::new("page_size_hint", "must be at least 1"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::new("poll_timeout_ms", "must be positive"));
        }
        if self.persist_attempts == 0 {
            return Err(ConfigError::new("persist_attempts", "must be at least 1"));
        }
        self.backoff.validate()
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::new(DeliveryMode::Enriched)
    }
}

/// Exponential backoff with a ceiling and jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First delay, and the delay after a reset.
    #[serde(with = "duration_ms", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Ceiling for any delay.
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Growth factor per consecutive delay.
    pub multiplier: f64,
    /// Relative jitter applied to each delay (0.2 = ±20%).
    pub jitter: f64,
}

impl BackoffConfig {
    /// Creates a configuration with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the relative jitter, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(self) -> Self {
        self.with_jitter(0.0)
    }

    /// Checks that the delays can be computed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::new(
                "backoff.multiplier",
                format!("must be a finite number >= 1.0, got {}", self.multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::new(
                "backoff.jitter",
                format!("must be within 0.0..=1.0, got {}", self.jitter),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::new(
                "backoff.initial_delay_ms",
                format!(
                    "{}ms exceeds max_delay_ms {}ms",
                    self.initial_delay.as_millis(),
                    self.max_delay.as_millis()
                ),
            ));
        }
        Ok(())
    }

    /// Un-jittered delay for the n-th consecutive wait (0-indexed).
    ///
    /// A multiplier below 1.0 is treated as 1.0.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.multiplier.max(1.0);
        let secs = self.initial_delay.as_secs_f64() * multiplier.powi(attempt.min(64) as i32);
        if !secs.is_finite() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
