//! Backoff policies for reconnection
//!
//! A backoff policy is pure computation: it turns a configuration into the
//! ordered list of delays a [`RetryOperation`](crate::RetryOperation) waits
//! between attempts. Nothing here touches timers.
//!
//! # Policies
//!
//! - **Exponential**: `round(r * max(min_delay, 1ms) * factor^i)` for each
//!   retry `i`, where `r` is 1, or uniform in `[1, 2)` when randomized.
//!   Randomized schedules are sorted so delays never shrink.
//! - **Fixed**: a literal list of delays, returned unchanged. Useful for
//!   deterministic tests.
//!
//! `max_delay` is validated against `min_delay` but does not clamp the
//! computed delays.
//!
//! # Examples
//!
//! ```rust
//! use relink_client::BackoffConfig;
//! use std::time::Duration;
//!
//! let config = BackoffConfig::default()
//!     .with_retries(3)
//!     .with_min_delay(Duration::from_millis(100));
//!
//! let delays = config.compute_delays().unwrap();
//! assert_eq!(delays, vec![
//!     Duration::from_millis(100),
//!     Duration::from_millis(200),
//!     Duration::from_millis(400),
//! ]);
//! ```

use rand::Rng;
use relink_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of retries when none is configured
pub const DEFAULT_RETRIES: u32 = 10;

/// Default multiplier between consecutive delays
pub const DEFAULT_FACTOR: f64 = 2.0;

/// Default first delay
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(1000);

/// Exponential backoff configuration
///
/// Deserializes from a map where every field is optional; durations are
/// given in milliseconds:
///
/// ```json
/// { "retries": 5, "factor": 2.0, "min_delay_ms": 500, "max_delay_ms": 8000, "randomize": true }
/// ```
///
/// An explicit `"retries": null` means unbounded retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Number of retries, `None` for unbounded
    pub retries: Option<u32>,
    /// Multiplier applied per retry, at least 1
    pub factor: f64,
    /// Delay before the first retry (floored at 1ms when computing)
    #[serde(rename = "min_delay_ms", with = "millis")]
    pub min_delay: Duration,
    /// Upper bound that `min_delay` must not exceed, `None` for unbounded
    #[serde(rename = "max_delay_ms", with = "opt_millis")]
    pub max_delay: Option<Duration>,
    /// Multiply each delay by a random factor in `[1, 2)`
    pub randomize: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            retries: Some(DEFAULT_RETRIES),
            factor: DEFAULT_FACTOR,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: None,
            randomize: false,
        }
    }
}

impl BackoffConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Retry without bound (forever mode)
    pub fn unbounded(mut self) -> Self {
        self.retries = None;
        self
    }

    /// Set the multiplier
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the first delay
    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        self.min_delay = min_delay;
        self
    }

    /// Set the upper bound
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Enable or disable randomization
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Whether retries are unbounded
    pub fn is_unbounded(&self) -> bool {
        self.retries.is_none()
    }

    /// Check the configuration invariants
    ///
    /// # Errors
    ///
    /// `Error::Config` when `max_delay < min_delay`, or when `factor` is
    /// not a finite number of at least 1.
    pub fn validate(&self) -> Result<()> {
        if let Some(max_delay) = self.max_delay {
            if max_delay < self.min_delay {
                return Err(Error::Config(format!(
                    "min_delay ({:?}) > max_delay ({:?})",
                    self.min_delay, max_delay
                )));
            }
        }

        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(Error::Config(format!(
                "factor must be a finite number >= 1, got {}",
                self.factor
            )));
        }

        Ok(())
    }

    /// Compute the delay schedule
    ///
    /// Unbounded configurations produce a schedule of [`DEFAULT_RETRIES`]
    /// entries; the retry operation replays the last one forever.
    pub fn compute_delays(&self) -> Result<Vec<Duration>> {
        self.validate()?;

        let base = (self.min_delay.as_millis() as f64).max(1.0);
        let count = self.retries.unwrap_or(DEFAULT_RETRIES);
        let mut rng = rand::thread_rng();

        let mut delays: Vec<Duration> = (0..count)
            .map(|attempt| {
                let random = if self.randomize {
                    rng.gen_range(1.0..2.0)
                } else {
                    1.0
                };
                let millis = (random * base * self.factor.powi(attempt as i32)).round();
                Duration::from_millis(millis as u64)
            })
            .collect();

        // Random factors can put a late delay below an early one
        if self.randomize {
            delays.sort();
        }

        Ok(delays)
    }
}

/// Compute the delay schedule for `config`
pub fn compute_delays(config: &BackoffConfig) -> Result<Vec<Duration>> {
    config.compute_delays()
}

/// A backoff policy
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Exponential schedule computed from a configuration
    Exponential(BackoffConfig),
    /// Literal schedule used as is
    Fixed(Vec<Duration>),
}

impl Backoff {
    /// The delay schedule of this policy
    pub fn delays(&self) -> Result<Vec<Duration>> {
        match self {
            Backoff::Exponential(config) => config.compute_delays(),
            Backoff::Fixed(delays) => Ok(delays.clone()),
        }
    }

    /// Check the policy without computing it
    pub fn validate(&self) -> Result<()> {
        match self {
            Backoff::Exponential(config) => config.validate(),
            Backoff::Fixed(_) => Ok(()),
        }
    }

    /// Whether the policy asks for unbounded retries
    pub fn is_unbounded(&self) -> bool {
        match self {
            Backoff::Exponential(config) => config.is_unbounded(),
            Backoff::Fixed(_) => false,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential(BackoffConfig::default())
    }
}

impl From<BackoffConfig> for Backoff {
    fn from(config: BackoffConfig) -> Self {
        Backoff::Exponential(config)
    }
}

impl From<Vec<Duration>> for Backoff {
    fn from(delays: Vec<Duration>) -> Self {
        Backoff::Fixed(delays)
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&(duration.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
