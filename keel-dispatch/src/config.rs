//! Dispatch server configuration

use std::time::Duration;

/// Dispatch server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address of the HTTP API
    pub http_addr: String,

    /// Bind address of the node stream listener
    pub stream_addr: String,

    /// Expected heartbeat period of nodes. A node silent for twice this long
    /// is marked offline and its session evicted.
    pub heartbeat_period: Duration,

    /// Pipelines a node may claim before further assignments are refused
    pub max_pipelines_per_node: usize,

    /// Log entries kept per execution
    pub log_retention: usize,

    /// Per-subscriber event queue capacity
    pub event_queue: usize,
}

impl Config {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - KEEL_HTTP_ADDR (default: 0.0.0.0:8080)
    /// - KEEL_STREAM_ADDR (default: 0.0.0.0:9090)
    /// - KEEL_HEARTBEAT_PERIOD (seconds, default: 10)
    /// - KEEL_MAX_PIPELINES_PER_NODE (default: 2)
    /// - KEEL_LOG_RETENTION (default: 1000)
    /// - KEEL_EVENT_QUEUE (default: 100)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            http_addr: std::env::var("KEEL_HTTP_ADDR").unwrap_or(defaults.http_addr),
            stream_addr: std::env::var("KEEL_STREAM_ADDR").unwrap_or(defaults.stream_addr),
            heartbeat_period: parse_env::<u64>("KEEL_HEARTBEAT_PERIOD")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_period),
            max_pipelines_per_node: parse_env("KEEL_MAX_PIPELINES_PER_NODE")?
                .unwrap_or(defaults.max_pipelines_per_node),
            log_retention: parse_env("KEEL_LOG_RETENTION")?.unwrap_or(defaults.log_retention),
            event_queue: parse_env("KEEL_EVENT_QUEUE")?.unwrap_or(defaults.event_queue),
        })
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.http_addr.is_empty() {
            anyhow::bail!("http_addr cannot be empty");
        }

        if self.stream_addr.is_empty() {
            anyhow::bail!("stream_addr cannot be empty");
        }

        if self.heartbeat_period.is_zero() {
            anyhow::bail!("heartbeat_period must be greater than 0");
        }

        if self.max_pipelines_per_node == 0 {
            anyhow::bail!("max_pipelines_per_node must be greater than 0");
        }

        if self.log_retention == 0 {
            anyhow::bail!("log_retention must be greater than 0");
        }

        if self.event_queue == 0 {
            anyhow::bail!("event_queue must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            stream_addr: "0.0.0.0:9090".to_string(),
            heartbeat_period: Duration::from_secs(10),
            max_pipelines_per_node: 2,
            log_retention: 1000,
            event_queue: 100,
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
