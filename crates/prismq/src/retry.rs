//! Exponential backoff with jitter.

use serde::{Deserialize, Serialize};

/// Retry behavior for failed tasks.
///
/// The delay before attempt `n` becomes eligible again is
/// `initial_delay * multiplier^(n - 1)`, capped at `max_delay`, then scaled
/// by a uniform factor in `[1 - jitter, 1 + jitter]` and floored at zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in seconds.
    pub initial_delay_seconds: f64,
    /// Delay cap, in seconds.
    pub max_delay_seconds: f64,
    /// Exponential base.
    pub backoff_multiplier: f64,
    /// Uniform jitter half-width; 0 disables jitter.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_seconds: 1.0,
            max_delay_seconds: 300.0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// A config with no jitter and a tiny base delay. Test suites use this to
    /// keep retry timing deterministic and fast.
    pub fn immediate() -> Self {
        Self {
            initial_delay_seconds: 0.01,
            max_delay_seconds: 1.0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

/// Compute the backoff delay in seconds before retry `attempt` (1-indexed).
pub fn backoff_delay_seconds(attempt: u32, config: &RetryConfig) -> f64 {
    let exponent = attempt.saturating_sub(1);
    let mut delay = config.initial_delay_seconds * config.backoff_multiplier.powi(exponent as i32);
    delay = delay.min(config.max_delay_seconds);

    // Uniform draw in [1 - jitter, 1 + jitter] to spread retry storms.
    let jitter = config.jitter_factor * (2.0 * fastrand::f64() - 1.0);
    delay *= 1.0 + jitter;

    delay.max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            initial_delay_seconds: 1.0,
            max_delay_seconds: 300.0,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let config = no_jitter();
        assert_eq!(backoff_delay_seconds(1, &config), 1.0);
        assert_eq!(backoff_delay_seconds(2, &config), 2.0);
        assert_eq!(backoff_delay_seconds(3, &config), 4.0);
        assert_eq!(backoff_delay_seconds(4, &config), 8.0);
    }

    #[test]
    fn test_delay_is_monotonic_without_jitter() {
        let config = no_jitter();
        let mut last = 0.0;
        for attempt in 1..=20 {
            let delay = backoff_delay_seconds(attempt, &config);
            assert!(delay >= last, "attempt {attempt}: {delay} < {last}");
            last = delay;
        }
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = no_jitter();
        // 2^9 = 512 > 300
        assert_eq!(backoff_delay_seconds(10, &config), 300.0);
        assert_eq!(backoff_delay_seconds(30, &config), 300.0);
    }

    #[test]
    fn test_jittered_delay_stays_in_envelope() {
        let config = RetryConfig::default();
        for attempt in 1..=12 {
            for _ in 0..50 {
                let delay = backoff_delay_seconds(attempt, &config);
                assert!(delay >= 0.0);
                assert!(
                    delay <= config.max_delay_seconds * (1.0 + config.jitter_factor),
                    "attempt {attempt}: {delay}"
                );
            }
        }
    }

    #[test]
    fn test_default_matches_documented_values() {
        let config = RetryConfig::default();
        assert_eq!(config.initial_delay_seconds, 1.0);
        assert_eq!(config.max_delay_seconds, 300.0);
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.jitter_factor, 0.1);
    }

    #[test]
    fn test_config_deserializes_with_partial_fields() {
        let config: RetryConfig = serde_json::from_str(r#"{ "jitter_factor": 0.0 }"#).unwrap();
        assert_eq!(config.jitter_factor, 0.0);
        assert_eq!(config.max_delay_seconds, 300.0);
    }
}
