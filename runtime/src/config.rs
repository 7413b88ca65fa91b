//! Consumer configuration.
//!
//! Loaded from a TOML file whose tables mirror the dotted option names:
//!
//! ```toml
//! [threadpool]
//! nums = 4
//!
//! [mongodb]
//! uri = "mongodb://localhost:27017/?replicaSet=rs0"
//! database = "demo"
//! collections = ["orders", "tPlayerPoints"]
//!
//! [mongodb.resumetoken]
//! collection = "resumeTokens"
//!
//! [mongodb.retry]
//! maxattempts = 5
//! initialdelayms = 1000
//!
//! [lifecycle]
//! timeout-per-shutdown-phase = "30s"
//!
//! [prometheus.server]
//! port = 8081
//!
//! [tps]
//! alpha = 0.1
//! ```
//!
//! The file path comes from `CHANGEFEED_CONFIG` (default `changefeed.toml`).
//! `MONGODB_URI` and `PROMETHEUS_PORT` override the matching options.
//!
//! # Example
//!
//! ```no_run
//! use changefeed_runtime::config::ConsumerConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConsumerConfig::load()?;
//! let mediator_config = config.mediator_config()?;
//! println!("Watching {:?} with {} workers", config.mongodb.collections, mediator_config.workers);
//! # Ok(())
//! # }
//! ```

use crate::mediator::MediatorConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "CHANGEFEED_CONFIG";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "changefeed.toml";

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// An environment override has a bad value
    #[error("Invalid value for environment variable {var}: {value}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
    /// A value is missing or out of range
    #[error("Configuration validation failed: {0}")]
    Invalid(String),
}

/// `[threadpool]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadPoolConfig {
    /// Workers per collection
    pub nums: usize,
    /// Per-worker queue bound; unbounded when absent
    #[serde(default, rename = "queue-capacity", skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
}

/// `[mongodb.resumetoken]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeTokenConfig {
    /// Collection holding resume records
    #[serde(default = "default_resume_token_collection")]
    pub collection: String,
}

impl Default for ResumeTokenConfig {
    fn default() -> Self {
        Self {
            collection: default_resume_token_collection(),
        }
    }
}

/// `[mongodb.retry]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Consecutive failed attempts before a listener gives up
    #[serde(default = "default_max_attempts")]
    pub maxattempts: u32,
    /// First reconnect delay in milliseconds. Later delays double up to
    /// 60 seconds, or up to this value when it is longer.
    #[serde(default = "default_initial_delay_ms")]
    pub initialdelayms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            maxattempts: default_max_attempts(),
            initialdelayms: default_initial_delay_ms(),
        }
    }
}

/// `[mongodb]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Connection string
    #[serde(default)]
    pub uri: String,
    /// Database holding the watched collections
    pub database: String,
    /// Watched collections, in binding order
    #[serde(default)]
    pub collections: Vec<String>,
    /// Resume record settings
    #[serde(default)]
    pub resumetoken: ResumeTokenConfig,
    /// Reconnect settings
    #[serde(default)]
    pub retry: RetryConfig,
}

/// `[lifecycle]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Shutdown bound, e.g. `30s`, `500ms`, `1m`
    #[serde(
        rename = "timeout-per-shutdown-phase",
        default = "default_shutdown_timeout"
    )]
    pub timeout_per_shutdown_phase: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            timeout_per_shutdown_phase: default_shutdown_timeout(),
        }
    }
}

/// `[prometheus.server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusServerConfig {
    /// Scrape port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for PrometheusServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

/// `[prometheus]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    /// Scrape server settings
    #[serde(default)]
    pub server: PrometheusServerConfig,
}

/// `[tps]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TpsConfig {
    /// EWMA smoothing factor in `(0, 1]`; 0.3 when unset, 0.1 recommended
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl Default for TpsConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
        }
    }
}

/// Complete consumer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Worker pool settings
    pub threadpool: ThreadPoolConfig,
    /// Source settings
    pub mongodb: MongoConfig,
    /// Shutdown settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    /// Scrape endpoint settings
    #[serde(default)]
    pub prometheus: PrometheusConfig,
    /// Throughput estimator settings
    #[serde(default)]
    pub tps: TpsConfig,
}

fn default_resume_token_collection() -> String {
    "resumeTokens".to_string()
}

const fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

const fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

const fn default_port() -> u16 {
    8081
}

const fn default_alpha() -> f64 {
    crate::tps::DEFAULT_ALPHA
}

impl ConsumerConfig {
    /// Load from `CHANGEFEED_CONFIG` (or `changefeed.toml`), apply environment
    /// overrides and validate.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, an
    /// override is malformed, or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path, |var| std::env::var(var).ok())
    }

    /// Load from `path` with overrides resolved through `env`.
    ///
    /// # Errors
    ///
    /// See [`ConsumerConfig::load`].
    pub fn load_from<P, E>(path: P, env: E) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        E: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(env)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Parse TOML without overrides or validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `MONGODB_URI` and `PROMETHEUS_PORT` overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Env`] if `PROMETHEUS_PORT` is not a port number.
    pub fn apply_env<E>(&mut self, env: E) -> Result<(), ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        if let Some(uri) = env("MONGODB_URI") {
            self.mongodb.uri = uri;
        }
        if let Some(port) = env("PROMETHEUS_PORT") {
            self.prometheus.server.port = port.trim().parse().map_err(|_| ConfigError::Env {
                var: "PROMETHEUS_PORT",
                value: port,
            })?;
        }
        Ok(())
    }

    /// Check every constraint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first violated option.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.threadpool.nums == 0 {
            return invalid("threadpool.nums must be at least 1");
        }
        if self.threadpool.queue_capacity == Some(0) {
            return invalid("threadpool.queue-capacity must be at least 1");
        }
        if self.mongodb.uri.trim().is_empty() {
            return invalid("mongodb.uri is required");
        }
        if self.mongodb.database.trim().is_empty() {
            return invalid("mongodb.database is required");
        }
        if self.mongodb.collections.is_empty() {
            return invalid("mongodb.collections must list at least one collection");
        }
        let mut seen = HashSet::new();
        for name in &self.mongodb.collections {
            if name.trim().is_empty() {
                return invalid("mongodb.collections contains an empty name");
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "mongodb.collections lists {name} more than once"
                )));
            }
        }
        if self.mongodb.resumetoken.collection.trim().is_empty() {
            return invalid("mongodb.resumetoken.collection must not be empty");
        }
        if self.mongodb.retry.maxattempts == 0 {
            return invalid("mongodb.retry.maxattempts must be at least 1");
        }
        if !(self.tps.alpha > 0.0 && self.tps.alpha <= 1.0) {
            return invalid("tps.alpha must be in (0, 1]");
        }
        self.shutdown_timeout()?;
        Ok(())
    }

    /// Parsed `lifecycle.timeout-per-shutdown-phase`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the duration does not parse.
    pub fn shutdown_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.lifecycle.timeout_per_shutdown_phase).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "lifecycle.timeout-per-shutdown-phase: cannot parse {:?}",
                self.lifecycle.timeout_per_shutdown_phase
            ))
        })
    }

    /// Reconnect policy from `mongodb.retry`.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.mongodb.retry.maxattempts)
            .initial_delay(Duration::from_millis(self.mongodb.retry.initialdelayms))
            .build()
    }

    /// Scrape server address (all interfaces).
    #[must_use]
    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.prometheus.server.port))
    }

    /// Runtime knobs for the mediator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the shutdown timeout does not parse.
    pub fn mediator_config(&self) -> Result<MediatorConfig, ConfigError> {
        Ok(MediatorConfig::new(self.threadpool.nums)
            .with_retry(self.retry_policy())
            .with_shutdown_timeout(self.shutdown_timeout()?)
            .with_tps_alpha(self.tps.alpha)
            .with_queue_capacity(self.threadpool.queue_capacity))
    }
}

/// Parse a duration such as `30s`, `250ms`, `5m` or `1h`. A bare number is
/// milliseconds.
#[must_use]
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit.trim() {
        "" | "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const MINIMAL: &str = r#"
        [threadpool]
        nums = 4

        [mongodb]
        uri = "mongodb://localhost:27017"
        database = "demo"
        collections = ["orders", "users"]
    "#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.mongodb.resumetoken.collection, "resumeTokens");
        assert_eq!(config.mongodb.retry.maxattempts, 5);
        assert_eq!(config.mongodb.retry.initialdelayms, 1000);
        assert_eq!(config.shutdown_timeout().unwrap(), Duration::from_secs(30));
        assert_eq!(config.prometheus.server.port, 8081);
        assert!((config.tps.alpha - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.threadpool.queue_capacity, None);
    }

    #[test]
    fn dotted_names_map_to_nested_tables() {
        let text = format!(
            "{MINIMAL}\n[mongodb.retry]\nmaxattempts = 7\ninitialdelayms = 250\n\
             [lifecycle]\ntimeout-per-shutdown-phase = \"2m\"\n\
             [prometheus.server]\nport = 9100\n[tps]\nalpha = 0.1\n"
        );
        let config = ConsumerConfig::from_toml_str(&text).unwrap();
        config.validate().unwrap();

        let mediator = config.mediator_config().unwrap();
        assert_eq!(mediator.workers, 4);
        assert_eq!(mediator.retry.max_attempts, 7);
        assert_eq!(mediator.retry.initial_delay, Duration::from_millis(250));
        assert_eq!(mediator.shutdown_timeout, Duration::from_secs(120));
        assert_eq!(config.metrics_addr().port(), 9100);
        assert!((mediator.tps_alpha - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn initial_delay_above_a_minute_is_honoured() {
        let text = format!("{MINIMAL}\n[mongodb.retry]\ninitialdelayms = 90000\n");
        let config = ConsumerConfig::from_toml_str(&text).unwrap();

        let retry = config.retry_policy();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(90));
        assert_eq!(retry.max_delay, Duration::from_secs(90));
    }

    #[test]
    fn env_overrides_uri_and_port() {
        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config
            .apply_env(|var| match var {
                "MONGODB_URI" => Some("mongodb://db:27017".to_string()),
                "PROMETHEUS_PORT" => Some("9999".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.mongodb.uri, "mongodb://db:27017");
        assert_eq!(config.prometheus.server.port, 9999);

        let bad = config.apply_env(|var| (var == "PROMETHEUS_PORT").then(|| "http".to_string()));
        assert!(matches!(bad, Err(ConfigError::Env { var: "PROMETHEUS_PORT", .. })));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.mongodb.collections.clear();
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.mongodb.collections.push("orders".into());
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.threadpool.nums = 0;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.tps.alpha = 0.0;
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.lifecycle.timeout_per_shutdown_phase = "soon".into();
        assert!(config.validate().is_err());

        let mut config = ConsumerConfig::from_toml_str(MINIMAL).unwrap();
        config.mongodb.uri.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_required_section_fails_to_parse() {
        let result = ConsumerConfig::from_toml_str("[mongodb]\ndatabase = \"demo\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = std::env::temp_dir().join(format!("changefeed-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("changefeed.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = ConsumerConfig::load_from(&path, no_env).unwrap();
        assert_eq!(config.mongodb.collections, vec!["orders", "users"]);

        let missing = ConsumerConfig::load_from(dir.join("absent.toml"), no_env);
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("10 fortnights"), None);
    }
}
