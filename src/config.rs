use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Feeds seeded into the database at startup
    #[serde(default)]
    pub feeds: Vec<FeedConfig>,
}

fn default_database_url() -> String {
    "sqlite:rss_aggregator.db?mode=rwc".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of feeds fetched per cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Budget for fetching and ingesting a single feed
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

fn default_batch_size() -> u32 {
    50
}

fn default_poll_interval_secs() -> u64 {
    3600
}

fn default_fetch_timeout_secs() -> u64 {
    5
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            poll_interval_secs: default_poll_interval_secs(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    /// Name of the user owning the feed, created on first sync
    pub owner: String,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.batch_size == 0 {
            anyhow::bail!("scheduler.batch_size must be greater than zero");
        }
        if self.scheduler.poll_interval_secs == 0 {
            anyhow::bail!("scheduler.poll_interval_secs must be greater than zero");
        }
        if self.scheduler.fetch_timeout_secs == 0 {
            anyhow::bail!("scheduler.fetch_timeout_secs must be greater than zero");
        }
        Ok(())
    }
}
