//! Configuration
//!
//! Explicit configuration values for the scrape agent, the streaming
//! gateway, the line sources and the counter store. Values come from an
//! optional YAML file and are overridden by command-line flags.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::{self, RetryPolicy};

/// Capacity of the channel between a producer and its single consumer.
///
/// One is the smallest bounded queue tokio offers: a producer blocks as soon
/// as one chunk is waiting for a slow consumer.
pub const DEFAULT_SINK_CAPACITY: usize = 1;

/// Longest accepted scrape or flush interval, in seconds (one day)
pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// [`MAX_INTERVAL_SECONDS`] as a duration
pub const MAX_INTERVAL: Duration = Duration::from_secs(MAX_INTERVAL_SECONDS);

// =============================================================================
// Scrape Targets
// =============================================================================

/// A remote address polled on a fixed interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeTargetConfig {
    /// Base address, e.g. `http://app:8080`
    pub host: String,

    /// Poll interval in seconds
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    2
}

impl ScrapeTargetConfig {
    pub fn new(host: impl Into<String>, interval_seconds: u64) -> Self {
        Self {
            host: host.into(),
            interval_seconds,
        }
    }

    /// Poll interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("scrape target host is empty".into()));
        }
        transport::parse_base_url(&self.host)
            .map_err(|e| Error::Config(format!("scrape target {}: {}", self.host, e)))?;
        if self.interval_seconds == 0 || self.interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(Error::Config(format!(
                "scrape target {} interval must be 1..={} seconds, got {}",
                self.host, MAX_INTERVAL_SECONDS, self.interval_seconds
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Settings for the per-request metrics event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Target scraped for every `/api/v1/metrics/events` subscriber
    pub target: ScrapeTargetConfig,

    /// Capacity of the per-session sink
    #[serde(default = "default_sink_capacity")]
    pub sink_capacity: usize,

    /// Retry policy of the per-session scraper
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_sink_capacity() -> usize {
    DEFAULT_SINK_CAPACITY
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            target: ScrapeTargetConfig::new("http://example_client:8080", 2),
            sink_capacity: DEFAULT_SINK_CAPACITY,
            retry: RetryPolicy::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        self.target.validate()?;
        if self.sink_capacity == 0 {
            return Err(Error::Config("sink capacity must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Line Sources
// =============================================================================

/// How lines of a source are treated before streaming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Plain text lines (log tail)
    #[default]
    Lines,
    /// One JSON stats document per line; malformed lines are skipped
    Stats,
}

/// A named file streamed line by line to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Name used in the route `/api/v1/sources/{name}/events`
    pub name: String,

    /// File to read
    pub path: PathBuf,

    #[serde(default)]
    pub kind: SourceKind,

    /// Keep waiting for appended lines after reaching end of file
    #[serde(default)]
    pub follow: bool,

    /// Poll interval while following, in milliseconds
    #[serde(default = "default_poll_millis")]
    pub poll_millis: u64,
}

fn default_poll_millis() -> u64 {
    500
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_millis.max(1))
    }
}

// =============================================================================
// Counter Store
// =============================================================================

/// Options for the durable counter store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Location of the sled database
    pub path: PathBuf,

    /// Seconds between background flushes
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
}

fn default_flush_interval_seconds() -> u64 {
    10
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/data"),
            flush_interval_seconds: default_flush_interval_seconds(),
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, flush_interval_seconds: u64) -> Self {
        Self {
            path: path.into(),
            flush_interval_seconds,
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_seconds == 0 || self.flush_interval_seconds > MAX_INTERVAL_SECONDS {
            return Err(Error::Config(format!(
                "flush interval must be 1..={} seconds, got {}",
                MAX_INTERVAL_SECONDS, self.flush_interval_seconds
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Agent File
// =============================================================================

/// Root of the agent's YAML configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFileConfig {
    /// Targets scraped continuously in the background
    #[serde(default)]
    pub targets: Vec<ScrapeTargetConfig>,

    #[serde(default)]
    pub gateway: Option<GatewayConfig>,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl AgentFileConfig {
    /// Load from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("invalid agent config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for target in &self.targets {
            target.validate()?;
        }
        if let Some(gateway) = &self.gateway {
            gateway.validate()?;
        }
        let mut names = std::collections::HashSet::new();
        for source in &self.sources {
            if !names.insert(source.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate source name: {}",
                    source.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_agent_file() {
        let raw = r#"
targets:
  - host: http://app:8080
    interval_seconds: 5
  - host: http://worker:9000
gateway:
  target:
    host: http://app:8080
    interval_seconds: 1
sources:
  - name: app-log
    path: /var/log/app.log
    follow: true
  - name: app-stats
    path: /var/run/app/stats.jsonl
    kind: stats
"#;
        let config = AgentFileConfig::from_yaml(raw).unwrap();
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].interval(), Duration::from_secs(5));
        assert_eq!(config.targets[1].interval_seconds, 2);

        let gateway = config.gateway.unwrap();
        assert_eq!(gateway.sink_capacity, DEFAULT_SINK_CAPACITY);
        assert_eq!(gateway.retry, RetryPolicy::default());

        assert_eq!(config.sources[0].kind, SourceKind::Lines);
        assert!(config.sources[0].follow);
        assert_eq!(config.sources[1].kind, SourceKind::Stats);
        assert_eq!(config.sources[1].poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let raw = r#"
targets:
  - host: http://app:8080
    interval_seconds: 0
"#;
        assert_matches!(AgentFileConfig::from_yaml(raw), Err(Error::Config(_)));
    }

    #[test]
    fn test_duplicate_source_rejected() {
        let raw = r#"
sources:
  - name: log
    path: /a
  - name: log
    path: /b
"#;
        assert_matches!(
            AgentFileConfig::from_yaml(raw),
            Err(Error::Config(msg)) if msg.contains("log")
        );
    }

    #[test]
    fn test_store_config() {
        let config = StoreConfig::default();
        assert_eq!(config.flush_interval(), Duration::from_secs(10));
        assert!(config.validate().is_ok());

        let config = StoreConfig::new("/tmp/x", 0);
        assert!(config.validate().is_err());

        let config = StoreConfig::new("/tmp/x", MAX_INTERVAL_SECONDS);
        assert!(config.validate().is_ok());
        let config = StoreConfig::new("/tmp/x", u64::MAX);
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_oversized_scrape_interval_rejected() {
        let config = ScrapeTargetConfig::new("http://app:8080", MAX_INTERVAL_SECONDS);
        assert!(config.validate().is_ok());

        let config = ScrapeTargetConfig::new("http://app:8080", u64::MAX);
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_target_without_scheme_rejected() {
        for host in ["example_client:8080", "localhost:8080", "app"] {
            let config = ScrapeTargetConfig::new(host, 2);
            assert_matches!(config.validate(), Err(Error::Config(_)), "{}", host);
        }
    }
}
