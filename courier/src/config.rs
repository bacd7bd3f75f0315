use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::observability::logging::{LogFormat, LogLevel};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration file: {0}")]
    FileError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration shared by consumers, producers and the Redis pub/sub helpers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub app_name: String,
    pub server: String,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
    pub redis: RedisSettings,
    pub logging: LogSettings,
}

/// Retry schedule for a single inbound message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub randomization_factor: f64,
    pub max_interval_seconds: u64,
    pub max_elapsed_seconds: u64,
    /// Total handler invocations allowed, first attempt included
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Defaults to `app_name` when empty
    pub group_id: String,
    pub backoff: BackoffConfig,
    pub disable_payload_logging: bool,
}

/// What `publish` does when the listener has not yet taken the previous message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressMode {
    Block,
    FailFast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    pub ingress_capacity: usize,
    pub ingress_mode: IngressMode,
    /// Evict pending publishes older than this; `None` keeps them until an outcome arrives
    pub pending_ttl_seconds: Option<u64>,
    pub disable_payload_logging: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    pub url: String,
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: LogLevel,
    pub format: LogFormat,
    pub include_line_numbers: bool,
    pub include_thread_ids: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            app_name: "courier".to_string(),
            server: "local".to_string(),
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
            redis: RedisSettings::default(),
            logging: LogSettings::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 5_000,
            multiplier: 1.25,
            randomization_factor: 0.0,
            max_interval_seconds: 30 * 60,
            max_elapsed_seconds: 12 * 60 * 60,
            max_attempts: 36,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            backoff: BackoffConfig::default(),
            disable_payload_logging: false,
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            ingress_capacity: 1,
            ingress_mode: IngressMode::Block,
            pending_ttl_seconds: None,
            disable_payload_logging: false,
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            channels: Vec::new(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            include_line_numbers: true,
            include_thread_ids: false,
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_seconds)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "backoff initial interval must be greater than zero".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(format!(
                "backoff multiplier must be >= 1, got {}",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.randomization_factor) {
            return Err(ConfigError::InvalidValue(format!(
                "backoff randomization factor must be in [0, 1), got {}",
                self.randomization_factor
            )));
        }
        if self.max_interval() < self.initial_interval() {
            return Err(ConfigError::InvalidValue(
                "backoff max interval is shorter than the initial interval".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "backoff max attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl ProducerSettings {
    pub fn pending_ttl(&self) -> Option<Duration> {
        self.pending_ttl_seconds.map(Duration::from_secs)
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: BrokerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `COURIER_*` environment variables on top of the defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = BrokerConfig::default();

        if let Ok(app_name) = std::env::var("COURIER_APP_NAME") {
            config.app_name = app_name;
        }
        if let Ok(server) = std::env::var("COURIER_SERVER") {
            config.server = server;
        }

        if let Ok(group_id) = std::env::var("COURIER_CONSUMER_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Ok(attempts) = std::env::var("COURIER_CONSUMER_MAX_ATTEMPTS") {
            config.consumer.backoff.max_attempts = attempts.parse().map_err(|_| {
                ConfigError::InvalidValue("Invalid COURIER_CONSUMER_MAX_ATTEMPTS".to_string())
            })?;
        }
        if let Ok(value) = std::env::var("COURIER_CONSUMER_DISABLE_PAYLOAD_LOGGING") {
            config.consumer.disable_payload_logging = parse_bool(&value).ok_or_else(|| {
                ConfigError::InvalidValue(
                    "Invalid COURIER_CONSUMER_DISABLE_PAYLOAD_LOGGING".to_string(),
                )
            })?;
        }

        if let Ok(mode) = std::env::var("COURIER_PRODUCER_INGRESS_MODE") {
            config.producer.ingress_mode = match mode.to_lowercase().as_str() {
                "block" => IngressMode::Block,
                "fail_fast" | "fail-fast" => IngressMode::FailFast,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "Invalid COURIER_PRODUCER_INGRESS_MODE: {}",
                        mode
                    )))
                }
            };
        }
        if let Ok(ttl) = std::env::var("COURIER_PRODUCER_PENDING_TTL_SECONDS") {
            config.producer.pending_ttl_seconds = Some(ttl.parse().map_err(|_| {
                ConfigError::InvalidValue("Invalid COURIER_PRODUCER_PENDING_TTL_SECONDS".to_string())
            })?);
        }

        if let Ok(redis_url) = std::env::var("COURIER_REDIS_URL") {
            config.redis.url = redis_url;
        }
        if let Ok(channels) = std::env::var("COURIER_REDIS_CHANNELS") {
            config.redis.channels = channels
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(level) = std::env::var("COURIER_LOG_LEVEL") {
            config.logging.level = LogLevel::parse(&level).ok_or_else(|| {
                ConfigError::InvalidValue(format!("Invalid COURIER_LOG_LEVEL: {}", level))
            })?;
        }
        if let Ok(format) = std::env::var("COURIER_LOG_FORMAT") {
            config.logging.format = match format.to_lowercase().as_str() {
                "pretty" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                "compact" => LogFormat::Compact,
                _ => {
                    return Err(ConfigError::InvalidValue(format!(
                        "Invalid COURIER_LOG_FORMAT: {}",
                        format
                    )))
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::MissingField("app_name".to_string()));
        }
        if self.server.trim().is_empty() {
            return Err(ConfigError::MissingField("server".to_string()));
        }
        self.consumer.backoff.validate()?;
        if self.producer.ingress_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "producer ingress capacity must be at least 1".to_string(),
            ));
        }
        if self.producer.pending_ttl_seconds == Some(0) {
            return Err(ConfigError::InvalidValue(
                "producer pending TTL must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Client identifier reported to the broker: `app_name.server`, with `:` and `|` replaced
    pub fn client_id(&self) -> String {
        format!("{}.{}", self.app_name, self.server)
            .replace(':', ".")
            .replace('|', ".")
    }

    pub fn group_id(&self) -> &str {
        if self.consumer.group_id.is_empty() {
            &self.app_name
        } else {
            &self.consumer.group_id
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.consumer.backoff.max_attempts, 36);
        assert_eq!(config.consumer.backoff.initial_interval(), Duration::from_secs(5));
        assert_eq!(config.consumer.backoff.max_interval(), Duration::from_secs(1800));
        assert_eq!(config.consumer.backoff.max_elapsed(), Duration::from_secs(43_200));
        assert_eq!(config.producer.ingress_mode, IngressMode::Block);
        assert!(config.producer.pending_ttl().is_none());
    }

    #[test]
    fn test_client_id_sanitized() {
        let config = BrokerConfig {
            app_name: "billing".to_string(),
            server: "host:9092|rack-a".to_string(),
            ..Default::default()
        };
        assert_eq!(config.client_id(), "billing.host.9092.rack-a");
    }

    #[test]
    fn test_group_id_defaults_to_app_name() {
        let mut config = BrokerConfig::default();
        assert_eq!(config.group_id(), "courier");

        config.consumer.group_id = "legacy_group".to_string();
        assert_eq!(config.group_id(), "legacy_group");
    }

    #[test]
    fn test_invalid_backoff() {
        let mut config = BrokerConfig::default();
        config.consumer.backoff.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.consumer.backoff.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = BrokerConfig::default();
        config.consumer.backoff.randomization_factor = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let mut config = BrokerConfig::default();
        config.producer.pending_ttl_seconds = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let config = BrokerConfig::from_toml_str(
            r#"
            app_name = "orders"
            server = "eu-1"

            [consumer]
            disable_payload_logging = true

            [consumer.backoff]
            initial_interval_ms = 100
            max_attempts = 5

            [producer]
            ingress_mode = "fail_fast"
            pending_ttl_seconds = 60

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.app_name, "orders");
        assert!(config.consumer.disable_payload_logging);
        assert_eq!(config.consumer.backoff.initial_interval_ms, 100);
        assert_eq!(config.consumer.backoff.max_attempts, 5);
        assert_eq!(config.consumer.backoff.multiplier, 1.25);
        assert_eq!(config.producer.ingress_mode, IngressMode::FailFast);
        assert_eq!(config.producer.pending_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let result = BrokerConfig::from_toml_str(
            r#"
            app_name = ""
            "#,
        );
        assert!(matches!(result, Err(ConfigError::MissingField(_))));
    }

    const ENV_VARS: [&str; 11] = [
        "COURIER_APP_NAME",
        "COURIER_SERVER",
        "COURIER_CONSUMER_GROUP_ID",
        "COURIER_CONSUMER_MAX_ATTEMPTS",
        "COURIER_CONSUMER_DISABLE_PAYLOAD_LOGGING",
        "COURIER_PRODUCER_INGRESS_MODE",
        "COURIER_PRODUCER_PENDING_TTL_SECONDS",
        "COURIER_REDIS_URL",
        "COURIER_REDIS_CHANNELS",
        "COURIER_LOG_LEVEL",
        "COURIER_LOG_FORMAT",
    ];

    fn clear_env() {
        for name in ENV_VARS {
            std::env::remove_var(name);
        }
    }

    // Single test so no other test races on the process environment.
    #[test]
    fn test_from_env() {
        clear_env();
        let config = BrokerConfig::from_env().unwrap();
        assert_eq!(config.app_name, "courier");
        assert_eq!(config.producer.ingress_mode, IngressMode::Block);

        std::env::set_var("COURIER_APP_NAME", "billing");
        std::env::set_var("COURIER_SERVER", "host:9092");
        std::env::set_var("COURIER_CONSUMER_GROUP_ID", "billing-workers");
        std::env::set_var("COURIER_CONSUMER_MAX_ATTEMPTS", "4");
        std::env::set_var("COURIER_CONSUMER_DISABLE_PAYLOAD_LOGGING", "yes");
        std::env::set_var("COURIER_PRODUCER_INGRESS_MODE", "fail-fast");
        std::env::set_var("COURIER_PRODUCER_PENDING_TTL_SECONDS", "90");
        std::env::set_var("COURIER_REDIS_URL", "redis://cache:6379");
        std::env::set_var("COURIER_REDIS_CHANNELS", " events:a , ,events:b ");
        std::env::set_var("COURIER_LOG_LEVEL", "WARN");
        std::env::set_var("COURIER_LOG_FORMAT", "compact");

        let config = BrokerConfig::from_env().unwrap();
        assert_eq!(config.client_id(), "billing.host.9092");
        assert_eq!(config.group_id(), "billing-workers");
        assert_eq!(config.consumer.backoff.max_attempts, 4);
        assert!(config.consumer.disable_payload_logging);
        assert_eq!(config.producer.ingress_mode, IngressMode::FailFast);
        assert_eq!(config.producer.pending_ttl(), Some(Duration::from_secs(90)));
        assert_eq!(config.redis.url, "redis://cache:6379");
        assert_eq!(config.redis.channels, vec!["events:a", "events:b"]);
        assert_eq!(config.logging.level, LogLevel::Warn);
        assert_eq!(config.logging.format, LogFormat::Compact);

        std::env::set_var("COURIER_PRODUCER_INGRESS_MODE", "drop");
        assert!(matches!(
            BrokerConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));
        std::env::set_var("COURIER_PRODUCER_INGRESS_MODE", "block");

        std::env::set_var("COURIER_CONSUMER_MAX_ATTEMPTS", "0");
        assert!(matches!(
            BrokerConfig::from_env(),
            Err(ConfigError::InvalidValue(_))
        ));

        clear_env();
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
