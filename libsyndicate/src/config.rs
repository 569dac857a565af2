//! Configuration management for Syndicate

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::queue::QueuePolicy;
use crate::rate_limiter::RateLimitConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Admission limits keyed by platform name; platforms without an
    /// entry are unlimited
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitConfig>,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database file backing the queue, locks, and leases
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between dispatcher ticks
    pub poll_interval_secs: u64,
    /// Maximum due posts examined per tick
    pub batch_size: usize,
    /// Per-post dispatch lock TTL in seconds
    pub lock_ttl_secs: u64,
    /// In-flight jobs older than this are returned to the ready queue;
    /// defaults to the dispatch lock TTL
    pub reclaim_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            batch_size: 100,
            lock_ttl_secs: 300,
            reclaim_after_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Job failures beyond this count dead-letter the job
    pub max_retries: u32,
    /// First retry delay in seconds; doubles per subsequent failure
    pub backoff_base_secs: u64,
    /// Days a job record lives while ready/in flight
    pub record_ttl_days: u64,
    /// Days dead-lettered records are kept for inspection
    pub dead_record_ttl_days: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_secs: 600,
            record_ttl_days: 7,
            dead_record_ttl_days: 30,
        }
    }
}

impl QueueConfig {
    pub fn policy(&self) -> QueuePolicy {
        QueuePolicy {
            max_retries: self.max_retries,
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            record_ttl: Duration::from_secs(self.record_ttl_days * 24 * 3600),
            dead_record_ttl: Duration::from_secs(self.dead_record_ttl_days * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Directory holding sealed credential files
    pub vault_path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            vault_path: "~/.config/syndicate/credentials".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        let mut rate_limits = HashMap::new();
        rate_limits.insert(
            "mastodon".to_string(),
            RateLimitConfig {
                posts_per_window: 300,
                window_secs: 900,
                burst: 10,
                daily_cap: None,
            },
        );

        Self {
            store: StoreConfig {
                path: "~/.local/share/syndicate/syndicate.db".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            queue: QueueConfig::default(),
            rate_limits,
            credentials: CredentialsConfig::default(),
        }
    }

    /// Store path with `~` expanded.
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store.path).to_string())
    }

    /// Credential vault path with `~` expanded.
    pub fn vault_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.credentials.vault_path).to_string())
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SYNDICATE_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("syndicate").join("config.toml"))
}
