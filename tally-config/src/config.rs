use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tally_analytics::AnalyticsConfig;
use tally_log::{Level, LogConfig};
use tally_redis::RedisConfig;

/// Name of the configuration file within the configuration directory.
const CONFIG_FILE: &str = "config.yml";

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// Indicates config related errors.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Failed to save a file.
    #[error("could not write config file")]
    CouldNotWriteFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
}

/// An error returned when loading or validating the configuration.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{origin}")]
pub struct ConfigError {
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    origin: ConfigErrorSource,
    kind: ConfigErrorKind,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            cause: None,
            origin: ConfigErrorSource::None,
            kind,
        }
    }

    #[inline]
    fn wrap<E>(error: E, kind: ConfigErrorKind) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            cause: Some(Box::new(error)),
            ..Self::new(kind)
        }
    }

    #[inline]
    fn field<E>(error: E, field: &'static str) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            origin: ConfigErrorSource::FieldOverride(field.to_owned()),
            ..Self::wrap(error, ConfigErrorKind::InvalidValue)
        }
    }

    #[inline]
    fn file(mut self, path: impl AsRef<Path>) -> Self {
        self.origin = ConfigErrorSource::File(path.as_ref().to_path_buf());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

/// Controls internal reporting to a statsd server.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Metrics {
    /// Hostname and port of the statsd server.
    ///
    /// Defaults to `None`, which disables metrics.
    pub statsd: Option<String>,

    /// Common prefix that is added to all metrics.
    ///
    /// Defaults to `"tally"`.
    pub prefix: String,

    /// Default tags to apply to all metrics.
    pub default_tags: BTreeMap<String, String>,

    /// Tag name to report the hostname to for each metric.
    ///
    /// Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,

    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    ///
    /// For example, a value of `0.3` means that only 30% of the emitted metrics will be sent.
    /// Defaults to `1.0` (100%).
    pub sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tally".to_owned(),
            default_tags: BTreeMap::new(),
            hostname_tag: None,
            sample_rate: 1.0,
        }
    }
}

/// The contents of `config.yml`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
struct ConfigValues {
    logging: LogConfig,
    metrics: Metrics,
    redis: Option<RedisConfig>,
    analytics: AnalyticsConfig,
}

/// Configuration values that can be overridden from the command line or the environment.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The Redis server URL, replacing the configured Redis section.
    pub redis_url: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
    /// The UTC offset of day buckets in seconds.
    pub utc_offset_secs: Option<String>,
    /// The shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

/// Configuration of the Tally analytics service.
#[derive(Clone, Debug, Default)]
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl Config {
    /// Loads the configuration from `config.yml` in the given directory.
    ///
    /// A missing file yields the default configuration. A file that exists but cannot be read or
    /// parsed is an error.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let file = path.join(CONFIG_FILE);

        let values = match fs::read_to_string(&file) {
            Ok(contents) => Self::parse(&contents).map_err(|e| e.file(&file))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ConfigValues::default(),
            Err(e) => {
                return Err(ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&file));
            }
        };

        Ok(Self { values, path })
    }

    /// Parses the configuration from a YAML string.
    ///
    /// This is mostly useful for tests.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            values: Self::parse(yaml)?,
            path: PathBuf::new(),
        })
    }

    fn parse(yaml: &str) -> Result<ConfigValues, ConfigError> {
        // An empty file parses as null, which stands for all defaults.
        if yaml.trim().is_empty() {
            return Ok(ConfigValues::default());
        }

        serde_yaml::from_str(yaml).map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml))
    }

    /// Overrides configuration values from other sources, such as the command line.
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        if let Some(redis_url) = overrides.redis_url {
            self.values.redis = Some(RedisConfig::single(redis_url));
        }

        if let Some(level) = overrides.log_level {
            self.values.logging.level = level
                .parse::<Level>()
                .map_err(|e| ConfigError::field(e, "log_level"))?;
        }

        if let Some(offset) = overrides.utc_offset_secs {
            self.values.analytics.utc_offset_secs = offset
                .parse()
                .map_err(|e| ConfigError::field(e, "utc_offset_secs"))?;
        }

        if let Some(timeout) = overrides.shutdown_timeout {
            self.values.analytics.shutdown_timeout_secs = timeout
                .parse()
                .map_err(|e| ConfigError::field(e, "shutdown_timeout"))?;
        }

        Ok(self)
    }

    /// Returns the directory the configuration was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serializes the effective configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::CouldNotWriteFile))
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &LogConfig {
        &self.values.logging
    }

    /// Returns the metrics configuration.
    pub fn metrics(&self) -> &Metrics {
        &self.values.metrics
    }

    /// Returns the Redis configuration, if any.
    ///
    /// Without Redis, the service keeps analytics in process memory.
    pub fn redis(&self) -> Option<&RedisConfig> {
        self.values.redis.as_ref()
    }

    /// Returns the analytics engine configuration.
    pub fn analytics(&self) -> &AnalyticsConfig {
        &self.values.analytics
    }

    /// Returns the time granted to services to drain on shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        self.values.analytics.shutdown_timeout()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_path(dir.path()).unwrap();

        assert!(config.redis().is_none());
        assert_eq!(config.metrics().prefix, "tally");
        assert_eq!(config.analytics().queue_capacity(), 1000);
        assert_eq!(config.path(), dir.path());
    }

    #[test]
    fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "").unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.logging().level, Level::Info);
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
logging:
  level: debug
metrics:
  statsd: "127.0.0.1:8125"
  default_tags:
    region: eu
redis: "redis://127.0.0.1:6379"
analytics:
  key_prefix: stats
  utc_offset_secs: 28800
  compaction_deadline_secs: 600
"#;
        fs::write(dir.path().join(CONFIG_FILE), yaml).unwrap();

        let config = Config::from_path(dir.path()).unwrap();
        assert_eq!(config.logging().level, Level::Debug);
        assert_eq!(config.metrics().statsd.as_deref(), Some("127.0.0.1:8125"));
        assert_eq!(config.metrics().default_tags["region"], "eu");
        assert!(matches!(config.redis(), Some(RedisConfig::Single(url)) if url.ends_with(":6379")));
        assert_eq!(config.analytics().key_prefix, "stats");
        assert_eq!(config.analytics().utc_offset_secs, 28800);
        assert_eq!(
            config.analytics().compaction_deadline(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.analytics().realtime_minutes(), 15);
    }

    #[test]
    fn test_bad_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CONFIG_FILE);
        fs::write(&file, "analytics: [").unwrap();

        let error = Config::from_path(dir.path()).unwrap_err();
        assert_eq!(error.kind(), ConfigErrorKind::BadYaml);
        assert!(error.to_string().contains(&file.display().to_string()));
    }

    #[test]
    fn test_override() {
        let mut config = Config::default();
        config
            .apply_override(OverridableConfig {
                redis_url: Some("redis://cache:6379".to_owned()),
                log_level: Some("trace".to_owned()),
                utc_offset_secs: Some("-3600".to_owned()),
                shutdown_timeout: None,
            })
            .unwrap();

        assert!(matches!(config.redis(), Some(RedisConfig::Single(url)) if url == "redis://cache:6379"));
        assert_eq!(config.logging().level, Level::Trace);
        assert_eq!(config.analytics().utc_offset_secs, -3600);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_override() {
        let mut config = Config::default();
        let error = config
            .apply_override(OverridableConfig {
                log_level: Some("loud".to_owned()),
                ..Default::default()
            })
            .unwrap_err();

        assert_eq!(error.kind(), ConfigErrorKind::InvalidValue);
        assert_eq!(error.to_string(), "invalid config value (field log_level)");
    }

    #[test]
    fn test_show_roundtrip() {
        let config = Config::from_yaml("analytics:\n  realtime_minutes: 30\n").unwrap();
        let yaml = config.to_yaml_string().unwrap();

        let reparsed = Config::from_yaml(&yaml).unwrap();
        similar_asserts::assert_eq!(
            reparsed.analytics().realtime_minutes(),
            config.analytics().realtime_minutes()
        );
    }
}
