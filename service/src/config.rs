//! Configuration management for the notification service.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Values that are present but unparseable are reported rather than
//! silently replaced by a default.

use notification_relay_runtime::ConsumerSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Topics consumed when `TOPICS_SUBSCRIBED` is not set.
pub const DEFAULT_TOPICS: &str = "reservation-created,reservation-confirmed,reservation-cancelled";

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value for {var}: {value:?} ({reason})")]
    InvalidValue {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A variable required by the chosen setup is missing
    #[error("Missing required variable {0}")]
    Missing(&'static str),

    /// Values parse but do not make sense together
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where dead-letter records are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterBackend {
    /// `{topic}-dlt` on the broker
    Kafka,
    /// The `dead_letters` table
    Postgres,
}

impl FromStr for DeadLetterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" | "redpanda" => Ok(Self::Kafka),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown backend {other}")),
        }
    }
}

impl fmt::Display for DeadLetterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kafka => f.write_str("kafka"),
            Self::Postgres => f.write_str("postgres"),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Consumer behaviour
    pub consumer: ConsumerConfig,
    /// RedPanda/Kafka configuration
    pub redpanda: RedpandaConfig,
    /// Dead-letter storage
    pub dead_letter: DeadLetterConfig,
    /// Prometheus listener address
    pub metrics_addr: SocketAddr,
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Maximum attempts per message, including the first (default: 3)
    pub max_attempts: u32,
    /// Delay after the first failure in milliseconds (default: 1000)
    pub base_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Source topics
    pub topics_subscribed: Vec<String>,
    /// Consumer group id (default: `notification-group`)
    pub consumer_group: String,
    /// Pause before redelivering an unsettled message, in milliseconds
    pub release_delay_ms: u64,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,
}

/// RedPanda/Kafka configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedpandaConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
}

/// Dead-letter configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Selected backend (default: kafka)
    pub backend: DeadLetterBackend,
    /// `PostgreSQL` URL, required for the postgres backend
    pub database_url: Option<String>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// A `.env` file is honoured if the binary loaded it beforehand.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value cannot be parsed or the result
    /// fails [`Config::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let topics_raw = var("TOPICS_SUBSCRIBED").unwrap_or_else(|| DEFAULT_TOPICS.to_string());
        let topics_subscribed = topics_raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();

        let config = Self {
            consumer: ConsumerConfig {
                max_attempts: parse_or(var("MAX_ATTEMPTS"), "MAX_ATTEMPTS", 3)?,
                base_delay_ms: parse_or(var("BASE_DELAY_MS"), "BASE_DELAY_MS", 1000)?,
                backoff_multiplier: parse_or(var("BACKOFF_MULTIPLIER"), "BACKOFF_MULTIPLIER", 2.0)?,
                topics_subscribed,
                consumer_group: var("CONSUMER_GROUP").unwrap_or_else(|| "notification-group".to_string()),
                release_delay_ms: parse_or(var("RELEASE_DELAY_MS"), "RELEASE_DELAY_MS", 1000)?,
                shutdown_timeout_secs: parse_or(var("SHUTDOWN_TIMEOUT_SECS"), "SHUTDOWN_TIMEOUT_SECS", 30)?,
            },
            redpanda: RedpandaConfig {
                brokers: var("REDPANDA_BROKERS").unwrap_or_else(|| "localhost:9092".to_string()),
            },
            dead_letter: DeadLetterConfig {
                backend: parse_or(var("DEAD_LETTER_BACKEND"), "DEAD_LETTER_BACKEND", DeadLetterBackend::Kafka)?,
                database_url: var("DATABASE_URL"),
            },
            metrics_addr: parse_or(
                var("METRICS_ADDR"),
                "METRICS_ADDR",
                SocketAddr::from(([0, 0, 0, 0], 9090)),
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that values make sense together.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let consumer = &self.consumer;

        if consumer.max_attempts == 0 {
            return Err(ConfigError::Invalid("MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if !consumer.backoff_multiplier.is_finite() || consumer.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "BACKOFF_MULTIPLIER must be >= 1.0, got {}",
                consumer.backoff_multiplier
            )));
        }
        if consumer.topics_subscribed.is_empty() {
            return Err(ConfigError::Invalid("TOPICS_SUBSCRIBED is empty".to_string()));
        }
        if consumer.consumer_group.trim().is_empty() {
            return Err(ConfigError::Invalid("CONSUMER_GROUP is empty".to_string()));
        }
        if self.redpanda.brokers.trim().is_empty() {
            return Err(ConfigError::Missing("REDPANDA_BROKERS"));
        }
        if self.dead_letter.backend == DeadLetterBackend::Postgres && self.dead_letter.database_url.is_none() {
            return Err(ConfigError::Missing("DATABASE_URL"));
        }

        Ok(())
    }

    /// Consumer runtime settings derived from this configuration.
    #[must_use]
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings::builder()
            .max_attempts(self.consumer.max_attempts)
            .base_delay_ms(self.consumer.base_delay_ms)
            .backoff_multiplier(self.consumer.backoff_multiplier)
            .topics(self.consumer.topics_subscribed.iter().cloned())
            .consumer_group(self.consumer.consumer_group.clone())
            .release_delay(Duration::from_millis(self.consumer.release_delay_ms))
            .shutdown_timeout(Duration::from_secs(self.consumer.shutdown_timeout_secs))
            .build()
    }
}

fn parse_or<T>(raw: Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(value) = raw else {
        return Ok(default);
    };

    match value.trim().parse() {
        Ok(parsed) => Ok(parsed),
        Err(e) => Err(ConfigError::InvalidValue {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}
