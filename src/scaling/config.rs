//! Autoscaling policy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bounds and hysteresis of the scaling controller.
///
/// Durations are written as whole seconds in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    /// Smallest pool size. At least 1.
    pub min_workers: usize,
    /// Largest pool size. At least `min_workers`.
    pub max_workers: usize,
    /// Scale up when `pending > workers * scale_up_threshold`.
    pub scale_up_threshold: f64,
    /// Scale down when `pending < workers * scale_down_threshold`.
    pub scale_down_threshold: f64,
    /// Minimum time between two scaling actions. At least 10 s.
    #[serde(with = "secs")]
    pub scale_cooldown: Duration,
    /// Time without pending entries before scaling down is allowed. At least 60 s.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,
    /// Control loop period. At least 1 s.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 10,
            scale_up_threshold: 2.0,
            scale_down_threshold: 0.25,
            scale_cooldown: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl ScalingConfig {
    /// Check the bounds. Returns [`Error::Config`] naming the first violated rule.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(Error::Config(msg.to_string()));
        if self.min_workers < 1 {
            return fail("min_workers must be >= 1");
        }
        if self.max_workers < self.min_workers {
            return fail("max_workers must be >= min_workers");
        }
        if self.scale_up_threshold <= self.scale_down_threshold {
            return fail("scale_up_threshold must be > scale_down_threshold");
        }
        if self.scale_cooldown < Duration::from_secs(10) {
            return fail("scale_cooldown must be >= 10 seconds");
        }
        if self.idle_timeout < Duration::from_secs(60) {
            return fail("idle_timeout must be >= 60 seconds");
        }
        if self.poll_interval < Duration::from_secs(1) {
            return fail("poll_interval must be >= 1 second");
        }
        Ok(())
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ScalingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn each_rule_is_enforced() {
        let cases: Vec<(ScalingConfig, &str)> = vec![
            (
                ScalingConfig {
                    min_workers: 0,
                    ..Default::default()
                },
                "min_workers",
            ),
            (
                ScalingConfig {
                    min_workers: 5,
                    max_workers: 4,
                    ..Default::default()
                },
                "max_workers",
            ),
            (
                ScalingConfig {
                    scale_up_threshold: 0.25,
                    ..Default::default()
                },
                "scale_up_threshold",
            ),
            (
                ScalingConfig {
                    scale_cooldown: Duration::from_secs(9),
                    ..Default::default()
                },
                "scale_cooldown",
            ),
            (
                ScalingConfig {
                    idle_timeout: Duration::from_secs(59),
                    ..Default::default()
                },
                "idle_timeout",
            ),
            (
                ScalingConfig {
                    poll_interval: Duration::ZERO,
                    ..Default::default()
                },
                "poll_interval",
            ),
        ];
        for (config, field) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{field}: got {err}");
        }
    }

    #[test]
    fn deserializes_seconds_with_defaults() {
        let config: ScalingConfig =
            serde_json::from_str(r#"{"max_workers": 4, "scale_cooldown": 30}"#).unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.scale_cooldown, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
    }
}
