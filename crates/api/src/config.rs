//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use event_pipeline::{BrokerSettings, RetryConfig};

/// Log output format of the `fmt` layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `API_KEY`: required `x-api-key` value; unset disables the check
/// - `DATABASE_URL`: PostgreSQL document store; unset keeps documents in memory
/// - `RETRY_MAX_ATTEMPTS`, `RETRY_INITIAL_BACKOFF_MS`, `RETRY_MAX_BACKOFF_MS`,
///   `RETRY_MULTIPLIER`: handler retry policy
/// - `MAX_OUTSTANDING_MESSAGES`: in-flight deliveries per subscription
/// - `MAX_DELIVERY_ATTEMPTS`: deliveries before a nacked message is
///   dead-lettered to `<subscription>.dlq`
/// - `SHUTDOWN_TIMEOUT_SECS`: how long subscriptions get to drain
/// - `BATCH_JOB_SELECTOR`: job launched for each processing request
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub api_key: Option<String>,
    pub database_url: Option<String>,
    pub retry: RetryConfig,
    pub max_outstanding: usize,
    pub max_delivery_attempts: u32,
    pub shutdown_timeout: Duration,
    pub batch_job_selector: String,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `lookup`. Unparsable values fall back to
    /// their defaults; empty strings count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| non_empty(&lookup, key);
        let defaults = Self::default();

        let retry = RetryConfig {
            max_attempts: parsed(&lookup, "RETRY_MAX_ATTEMPTS")
                .unwrap_or(defaults.retry.max_attempts),
            initial_backoff: parsed(&lookup, "RETRY_INITIAL_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_backoff),
            max_backoff: parsed(&lookup, "RETRY_MAX_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_backoff),
            multiplier: parsed(&lookup, "RETRY_MULTIPLIER").unwrap_or(defaults.retry.multiplier),
        };

        Self {
            host: var("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parsed(&lookup, "LOG_FORMAT").unwrap_or(defaults.log_format),
            api_key: var("API_KEY"),
            database_url: var("DATABASE_URL"),
            retry,
            max_outstanding: parsed(&lookup, "MAX_OUTSTANDING_MESSAGES")
                .unwrap_or(defaults.max_outstanding),
            max_delivery_attempts: parsed(&lookup, "MAX_DELIVERY_ATTEMPTS")
                .unwrap_or(defaults.max_delivery_attempts),
            shutdown_timeout: parsed(&lookup, "SHUTDOWN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            batch_job_selector: var("BATCH_JOB_SELECTOR").unwrap_or(defaults.batch_job_selector),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Broker flow control derived from this configuration.
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            max_outstanding: self.max_outstanding.max(1),
            max_delivery_attempts: self.max_delivery_attempts.max(1),
            ..BrokerSettings::default()
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    non_empty(lookup, key).and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            api_key: None,
            database_url: None,
            retry: RetryConfig::default(),
            max_outstanding: 10,
            max_delivery_attempts: 5,
            shutdown_timeout: Duration::from_secs(10),
            batch_job_selector: "image-processor".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_map(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = from_map(&[]);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.api_key.is_none());
        assert!(config.database_url.is_none());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.max_outstanding, 10);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.batch_job_selector, "image-processor");
    }

    #[test]
    fn test_overrides() {
        let config = from_map(&[
            ("PORT", "8080"),
            ("LOG_FORMAT", "JSON"),
            ("API_KEY", "secret"),
            ("RETRY_MAX_ATTEMPTS", "3"),
            ("RETRY_INITIAL_BACKOFF_MS", "250"),
            ("RETRY_MULTIPLIER", "1.5"),
            ("MAX_OUTSTANDING_MESSAGES", "32"),
            ("MAX_DELIVERY_ATTEMPTS", "8"),
            ("BATCH_JOB_SELECTOR", "thumbnailer"),
        ]);
        assert_eq!(config.port, 8080);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(60));
        assert_eq!(config.retry.multiplier, 1.5);
        assert_eq!(config.broker_settings().max_outstanding, 32);
        assert_eq!(config.broker_settings().max_delivery_attempts, 8);
        assert_eq!(config.batch_job_selector, "thumbnailer");
    }

    #[test]
    fn test_invalid_and_empty_values_fall_back() {
        let config = from_map(&[("PORT", "not-a-port"), ("API_KEY", "  "), ("LOG_FORMAT", "xml")]);
        assert_eq!(config.port, 3000);
        assert!(config.api_key.is_none());
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
