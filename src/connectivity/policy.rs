use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded exponential backoff for automatic reconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Attempts before giving up and requiring a manual retry
    pub max_attempts: u8,

    /// Delay before the first attempt
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Factor applied to the delay after every failed attempt
    pub backoff_multiplier: f64,

    /// Upper bound for any single delay
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(16),
        }
    }
}

impl ReconnectionPolicy {
    /// Delay before the given 1-based attempt.
    ///
    /// `min(initial_delay * backoff_multiplier^(attempt - 1), max_delay)`,
    /// zero for attempt 0.
    pub fn delay(&self, attempt: u8) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor = self.backoff_multiplier.powi(attempt as i32 - 1);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled.max(0.0))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err("initial_delay must not exceed max_delay".to_string());
        }
        Ok(())
    }
}

/// Serialize a `Duration` as whole milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
