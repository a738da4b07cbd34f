//! Layered settings shared by the control CLI and the worker.
//!
//! Values come from built-in defaults, then an optional JSON file, then `STREAMFOLD_*`
//! environment variables.
//!
//! # Environment Variables
//!
//! | Variable                     | Default                  | Description                     |
//! |------------------------------|--------------------------|---------------------------------|
//! | `STREAMFOLD_REDIS_URL`       | `redis://127.0.0.1:6379` | Broker connection URL           |
//! | `STREAMFOLD_STREAM`          | `events`                 | Stream name                     |
//! | `STREAMFOLD_GROUP`           | `workers`                | Consumer group name             |
//! | `STREAMFOLD_KEY_PREFIX`      | `streamfold`             | Prefix of checkpoint keys       |
//! | `STREAMFOLD_BLOCK_MS`        | `5000`                   | Read block time in milliseconds |
//! | `STREAMFOLD_COUNT`           | `10`                     | Entries per read                |
//! | `STREAMFOLD_MAX_LENGTH`      | `10000`                  | Approximate stream length cap   |
//! | `STREAMFOLD_CHECKPOINT_TTL`  | `604800`                 | Checkpoint expiry in seconds    |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consumer::ConsumerConfig;
use crate::error::{Error, Result};
use crate::producer::ProducerConfig;
use crate::scaling::ScalingConfig;

/// Broker URL used when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
/// Stream consumed and published to by default.
pub const DEFAULT_STREAM: &str = "events";
/// Consumer group shared by the workers by default.
pub const DEFAULT_GROUP: &str = "workers";

/// Resolved settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker connection URL.
    pub redis_url: String,
    /// Stream read by workers and written by producers.
    pub stream: String,
    /// Consumer group the workers join.
    pub group: String,
    /// Prefix of checkpoint keys.
    pub key_prefix: String,
    /// How long one group read waits for new entries. Must be at least 1.
    pub block_ms: u64,
    /// Maximum entries per read.
    pub count: usize,
    /// Approximate cap applied on publish; `None` disables trimming.
    pub max_length: Option<usize>,
    /// Checkpoint expiry in seconds.
    pub checkpoint_ttl_secs: u64,
    /// Worker pool bounds and thresholds.
    pub scaling: ScalingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            stream: DEFAULT_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            key_prefix: crate::checkpoint::DEFAULT_KEY_PREFIX.to_string(),
            block_ms: crate::consumer::DEFAULT_BLOCK.as_millis() as u64,
            count: crate::consumer::DEFAULT_COUNT,
            max_length: Some(crate::producer::DEFAULT_MAX_LENGTH),
            checkpoint_ttl_secs: crate::checkpoint::DEFAULT_CHECKPOINT_TTL.as_secs(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, overlaid with `path` when given, overlaid with the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env_from(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a JSON settings file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))
    }

    /// Overlay variables looked up through `lookup`.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STREAMFOLD_REDIS_URL") {
            self.redis_url = v;
        }
        if let Some(v) = lookup("STREAMFOLD_STREAM") {
            self.stream = v;
        }
        if let Some(v) = lookup("STREAMFOLD_GROUP") {
            self.group = v;
        }
        if let Some(v) = lookup("STREAMFOLD_KEY_PREFIX") {
            self.key_prefix = v;
        }
        if let Some(v) = lookup("STREAMFOLD_BLOCK_MS") {
            self.block_ms = parse_var("STREAMFOLD_BLOCK_MS", &v)?;
        }
        if let Some(v) = lookup("STREAMFOLD_COUNT") {
            self.count = parse_var("STREAMFOLD_COUNT", &v)?;
        }
        if let Some(v) = lookup("STREAMFOLD_MAX_LENGTH") {
            let n: usize = parse_var("STREAMFOLD_MAX_LENGTH", &v)?;
            self.max_length = (n > 0).then_some(n);
        }
        if let Some(v) = lookup("STREAMFOLD_CHECKPOINT_TTL") {
            self.checkpoint_ttl_secs = parse_var("STREAMFOLD_CHECKPOINT_TTL", &v)?;
        }
        Ok(())
    }

    /// Check names, read sizing and the scaling section.
    pub fn validate(&self) -> Result<()> {
        crate::types::validate_name("stream", &self.stream)?;
        crate::types::validate_name("group", &self.group)?;
        if self.key_prefix.is_empty() {
            return Err(Error::Config("key_prefix must not be empty".into()));
        }
        if self.block_ms == 0 {
            return Err(Error::Config("block_ms must be >= 1".into()));
        }
        if self.count == 0 {
            return Err(Error::Config("count must be >= 1".into()));
        }
        self.scaling.validate()
    }

    /// Read block time as a `Duration`.
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    /// Checkpoint expiry as a `Duration`.
    pub fn checkpoint_ttl(&self) -> Duration {
        Duration::from_secs(self.checkpoint_ttl_secs)
    }

    /// Producer settings for the configured stream, trimmed at `max_length`.
    pub fn producer_config(&self) -> ProducerConfig {
        ProducerConfig {
            max_length: self.max_length,
            ..ProducerConfig::new(&self.stream)
        }
    }

    /// Consumer settings for `consumer` in the configured stream and group.
    ///
    /// # Arguments
    ///
    /// * `consumer` - Consumer name, unique within the group.
    ///
    /// # Returns
    ///
    /// A [`ConsumerConfig`] with `block` and `count` taken from these settings and
    /// everything else at its default.
    pub fn consumer_config(&self, consumer: &str) -> ConsumerConfig {
        let mut config = ConsumerConfig::new(&self.stream, &self.group, consumer);
        config.block = self.block();
        config.count = self.count;
        config
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::Config(format!("{name} is not valid ({value:?}): {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use serial_test::serial;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let s = Settings::default();
        assert!(s.validate().is_ok());
        assert_eq!(s.block(), Duration::from_secs(5));
        assert_eq!(s.count, 10);
        assert_eq!(s.checkpoint_ttl(), Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn env_overrides_defaults() {
        let mut s = Settings::default();
        s.apply_env_from(vars(&[
            ("STREAMFOLD_STREAM", "orders"),
            ("STREAMFOLD_BLOCK_MS", "250"),
            ("STREAMFOLD_MAX_LENGTH", "0"),
        ]))
        .unwrap();
        assert_eq!(s.stream, "orders");
        assert_eq!(s.block(), Duration::from_millis(250));
        assert_eq!(s.max_length, None);
        assert_eq!(s.group, DEFAULT_GROUP);
    }

    #[test]
    fn bad_number_names_the_variable() {
        let mut s = Settings::default();
        let err = s
            .apply_env_from(vars(&[("STREAMFOLD_COUNT", "lots")]))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("STREAMFOLD_COUNT"), "got: {err}");
    }

    #[test]
    fn file_then_env_layering() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"stream": "from-file", "group": "g1", "scaling": {{"max_workers": 3}}}}"#
        )
        .unwrap();
        let mut s = Settings::from_file(file.path()).unwrap();
        assert_eq!(s.stream, "from-file");
        assert_eq!(s.scaling.max_workers, 3);
        assert_eq!(s.count, 10);

        s.apply_env_from(vars(&[("STREAMFOLD_GROUP", "g2")])).unwrap();
        assert_eq!(s.stream, "from-file");
        assert_eq!(s.group, "g2");
    }

    #[test]
    fn unreadable_or_malformed_file_is_a_config_error() {
        let missing = Settings::from_file(Path::new("/nonexistent/streamfold.json"));
        assert!(matches!(missing, Err(Error::Config(_))));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(Settings::from_file(file.path()), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_names_fail_validation() {
        let s = Settings {
            stream: "has space".into(),
            ..Settings::default()
        };
        assert!(matches!(s.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn zero_block_time_is_rejected() {
        // Arrange
        let mut s = Settings::default();
        s.apply_env_from(vars(&[("STREAMFOLD_BLOCK_MS", "0")])).unwrap();

        // Act
        let result = s.validate();

        // Assert
        match result {
            Err(Error::Config(msg)) => assert!(msg.contains("block_ms"), "got: {msg}"),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn producer_config_carries_max_length() {
        // Arrange
        let mut s = Settings::default();
        s.apply_env_from(vars(&[
            ("STREAMFOLD_STREAM", "orders"),
            ("STREAMFOLD_MAX_LENGTH", "250"),
        ]))
        .unwrap();

        // Act
        let capped = s.producer_config();
        s.apply_env_from(vars(&[("STREAMFOLD_MAX_LENGTH", "0")])).unwrap();
        let uncapped = s.producer_config();

        // Assert
        assert_eq!(capped.stream, "orders");
        assert_eq!(capped.max_length, Some(250));
        assert!(capped.auto_create_stream);
        assert_eq!(uncapped.max_length, None);
    }

    #[test]
    fn consumer_config_carries_read_sizing() {
        let s = Settings {
            block_ms: 750,
            count: 3,
            ..Settings::default()
        };
        let config = s.consumer_config("worker-2");
        assert_eq!(config.stream, DEFAULT_STREAM);
        assert_eq!(config.group, DEFAULT_GROUP);
        assert_eq!(config.consumer, "worker-2");
        assert_eq!(config.block, Duration::from_millis(750));
        assert_eq!(config.count, 3);
    }

    #[test]
    #[serial]
    fn load_reads_process_environment() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STREAMFOLD_GROUP", "env-group") };
        unsafe { std::env::remove_var("STREAMFOLD_STREAM") };
        let s = Settings::load(None).unwrap();
        unsafe { std::env::remove_var("STREAMFOLD_GROUP") };
        assert_eq!(s.group, "env-group");
        assert_eq!(s.stream, DEFAULT_STREAM);
    }

    #[test]
    #[serial]
    fn load_rejects_invalid_environment() {
        // SAFETY: serial test -- no concurrent env mutation.
        unsafe { std::env::set_var("STREAMFOLD_BLOCK_MS", "-5") };
        let result = Settings::load(None);
        unsafe { std::env::remove_var("STREAMFOLD_BLOCK_MS") };
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
