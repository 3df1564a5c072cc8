//! Reconnect backoff for an unreachable gateway
//!
//! When a bootstrap fails the supervisor lands in the `Error` connectivity
//! state. Instead of re-bootstrapping in a tight loop it waits for the delay
//! computed by [`ReconnectPolicy::delay_for`]. A host "online" transition
//! always bootstraps immediately and ignores the backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between bootstrap attempts
///
/// ```rust
/// use std::time::Duration;
/// use webphone_core::client::recovery::ReconnectPolicy;
///
/// let policy = ReconnectPolicy {
///     use_jitter: false,
///     ..ReconnectPolicy::default()
/// };
/// assert_eq!(policy.delay_for(1), Some(Duration::from_secs(1)));
/// assert_eq!(policy.delay_for(2), Some(Duration::from_secs(2)));
/// assert_eq!(policy.delay_for(3), Some(Duration::from_secs(4)));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Give up after this many consecutive failures (`None` retries forever)
    pub max_attempts: Option<u32>,
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Add ±10% jitter to each delay
    pub use_jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Short delays, for tests and local gateways
    pub fn quick() -> Self {
        Self {
            max_attempts: Some(5),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            use_jitter: false,
        }
    }

    /// Only reconnect on a host online transition
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    /// Delay before the next bootstrap after `failures` consecutive
    /// failures. `None` once the attempt budget is spent.
    pub fn delay_for(&self, failures: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if failures > max {
                return None;
            }
        }
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);

        let actual = if self.use_jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.2;
            capped * (1.0 + jitter)
        } else {
            capped
        };
        Some(Duration::from_millis(actual.max(0.0) as u64))
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
