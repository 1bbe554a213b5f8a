//! Agent configuration

use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use keel_core::retry::RetryConfig;

/// Agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Node ID this agent registers as
    pub node_id: String,

    /// Dispatch server HTTP base URL
    pub server_url: String,

    /// Dispatch server node stream address (host:port)
    pub stream_addr: String,

    pub node_type: String,

    pub labels: HashMap<String, String>,

    /// Interval between stream heartbeats
    pub heartbeat_period: Duration,

    /// Maximum number of pipelines run at once
    pub max_parallel: usize,

    /// Wait before redialing a broken stream
    pub reconnect_delay: Duration,

    /// How long shutdown waits for final status reports
    pub shutdown_grace: Duration,

    /// Backoff for RPCs and stream dialing
    pub retry: RetryConfig,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Required:
    /// - KEEL_NODE_ID
    ///
    /// Optional:
    /// - KEEL_SERVER_URL (default: http://localhost:8080)
    /// - KEEL_STREAM_ADDR (default: localhost:9090)
    /// - KEEL_NODE_TYPE (default: physical)
    /// - KEEL_LABELS (comma-separated k=v pairs)
    /// - KEEL_HEARTBEAT_PERIOD (seconds, default: 10)
    /// - KEEL_MAX_PARALLEL (default: 2)
    /// - KEEL_RECONNECT_DELAY (seconds, default: 5)
    /// - KEEL_SHUTDOWN_GRACE (seconds, default: 10)
    /// - KEEL_RETRY_MAX, KEEL_RETRY_INITIAL_MS, KEEL_RETRY_MAX_DELAY_MS
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let node_id = std::env::var("KEEL_NODE_ID")
            .map_err(|_| anyhow::anyhow!("KEEL_NODE_ID environment variable is required"))?;

        let labels = match std::env::var("KEEL_LABELS") {
            Ok(raw) => parse_labels(&raw)?,
            Err(_) => defaults.labels,
        };

        let retry = RetryConfig {
            max_retries: parse_env("KEEL_RETRY_MAX")?.unwrap_or(defaults.retry.max_retries),
            initial_delay: parse_env::<u64>("KEEL_RETRY_INITIAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.initial_delay),
            max_delay: parse_env::<u64>("KEEL_RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
            ..defaults.retry
        };

        Ok(Self {
            node_id,
            server_url: std::env::var("KEEL_SERVER_URL").unwrap_or(defaults.server_url),
            stream_addr: std::env::var("KEEL_STREAM_ADDR").unwrap_or(defaults.stream_addr),
            node_type: std::env::var("KEEL_NODE_TYPE").unwrap_or(defaults.node_type),
            labels,
            heartbeat_period: parse_env::<u64>("KEEL_HEARTBEAT_PERIOD")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_period),
            max_parallel: parse_env("KEEL_MAX_PARALLEL")?.unwrap_or(defaults.max_parallel),
            reconnect_delay: parse_env::<u64>("KEEL_RECONNECT_DELAY")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.reconnect_delay),
            shutdown_grace: parse_env::<u64>("KEEL_SHUTDOWN_GRACE")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
            retry,
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("node_id cannot be empty");
        }

        if self.node_type.trim().is_empty() {
            anyhow::bail!("node_type cannot be empty");
        }

        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            anyhow::bail!("server_url must start with http:// or https://");
        }

        if self.stream_addr.is_empty() {
            anyhow::bail!("stream_addr cannot be empty");
        }

        if self.heartbeat_period.is_zero() {
            anyhow::bail!("heartbeat_period must be greater than 0");
        }

        if self.max_parallel == 0 {
            anyhow::bail!("max_parallel must be greater than 0");
        }

        self.retry.validate().map_err(anyhow::Error::msg)?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: Uuid::new_v4().to_string(),
            server_url: "http://localhost:8080".to_string(),
            stream_addr: "localhost:9090".to_string(),
            node_type: "physical".to_string(),
            labels: HashMap::new(),
            heartbeat_period: Duration::from_secs(10),
            max_parallel: 2,
            reconnect_delay: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", key, raw)),
        Err(_) => Ok(None),
    }
}

/// Parses `k=v,k2=v2`; empty segments are skipped
fn parse_labels(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) if !k.trim().is_empty() => {
                Ok((k.trim().to_string(), v.trim().to_string()))
            }
            _ => Err(anyhow::anyhow!("invalid label {:?}, expected key=value", pair)),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(Uuid::parse_str(&config.node_id).is_ok());
        assert_eq!(config.heartbeat_period, Duration::from_secs(10));
        assert_eq!(config.max_parallel, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.server_url = "localhost:8080".to_string();
        assert!(config.validate().is_err());

        config.server_url = "https://dispatch.example".to_string();
        config.max_parallel = 0;
        assert!(config.validate().is_err());

        config.max_parallel = 1;
        config.retry.backoff_factor = 0.5;
        assert!(config.validate().is_err());

        config.retry.backoff_factor = 1.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("zone=eu-1, gpu = a100,,").unwrap();
        assert_eq!(labels.len(), 2);
        assert_eq!(labels["gpu"], "a100");

        assert!(parse_labels("broken").is_err());
        assert!(parse_labels("=x").is_err());
    }
}
