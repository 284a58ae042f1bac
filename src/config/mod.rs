//! Configuration management for the hivefarm orchestrator
//!
//! This module handles loading and validating configuration from a TOML file
//! with environment-variable overrides for deployment-specific values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Farming loop configuration
    #[serde(default)]
    pub farm: FarmConfig,

    /// Device synthesis configuration
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Retry and proxy-rotation policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Worker-process dispatch configuration
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Task-service endpoint configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Persistence configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Farming loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmConfig {
    /// Maximum devices scheduled per tick
    pub max_devices_per_batch: usize,

    /// Global concurrency bound on in-flight device units
    pub max_concurrent_tasks: usize,

    /// Wall-clock timeout for one device unit, in seconds
    pub device_task_timeout_secs: u64,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            max_devices_per_batch: 200,
            max_concurrent_tasks: 200,
            device_task_timeout_secs: 60,
        }
    }
}

/// Device synthesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Minimum devices per account, drawn once at bootstrap
    pub per_account_min: u32,

    /// Maximum devices per account
    pub per_account_max: u32,

    /// Minimum initial schedule jitter in seconds
    pub initial_delay_min_secs: u32,

    /// Maximum initial schedule jitter in seconds
    pub initial_delay_max_secs: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            per_account_min: 1,
            per_account_max: 1,
            initial_delay_min_secs: 0,
            initial_delay_max_secs: 30,
        }
    }
}

/// Retry and proxy-rotation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per device operation before the cycle is abandoned
    pub max_farm_attempts: u32,

    /// Fixed delay between attempts, in seconds
    pub delay_seconds: u64,

    /// Rotate the proxy on transport-class failures
    pub proxy_rotation: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_farm_attempts: 3,
            delay_seconds: 5,
            proxy_rotation: true,
        }
    }
}

/// Worker-process dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum worker processes; 0 means derive from CPU count
    pub max_processes: usize,

    /// Terminate all workers when any single worker exits
    pub fail_fast: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_processes: 0,
            fail_fast: true,
        }
    }
}

/// Task-service endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the task-granting service
    pub base_url: String,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.tasks.example.com"),
            request_timeout_secs: 30,
        }
    }
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path, shared by all worker processes
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/farm.db"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment-variable overrides for deployment-specific values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("HIVEFARM_API_URL") {
            self.api.base_url = url;
        }
        if let Ok(path) = std::env::var("HIVEFARM_STORE_PATH") {
            self.store.path = path.into();
        }
        if let Ok(level) = std::env::var("HIVEFARM_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(n) = std::env::var("HIVEFARM_MAX_PROCESSES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
        {
            self.workers.max_processes = n;
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.farm.max_devices_per_batch == 0 {
            anyhow::bail!("farm.max_devices_per_batch must be greater than 0");
        }

        if self.farm.max_concurrent_tasks == 0 {
            anyhow::bail!("farm.max_concurrent_tasks must be greater than 0");
        }

        if self.farm.device_task_timeout_secs == 0 {
            anyhow::bail!("farm.device_task_timeout_secs must be greater than 0");
        }

        if self.devices.per_account_min == 0 {
            anyhow::bail!("devices.per_account_min must be greater than 0");
        }

        if self.devices.per_account_max < self.devices.per_account_min {
            anyhow::bail!("devices.per_account_max must be >= devices.per_account_min");
        }

        if self.devices.initial_delay_max_secs < self.devices.initial_delay_min_secs {
            anyhow::bail!(
                "devices.initial_delay_max_secs must be >= devices.initial_delay_min_secs"
            );
        }

        if self.retry.max_farm_attempts == 0 {
            anyhow::bail!("retry.max_farm_attempts must be greater than 0");
        }

        if self.api.base_url.is_empty() {
            anyhow::bail!("api.base_url must not be empty");
        }
        url::Url::parse(&self.api.base_url)
            .with_context(|| format!("api.base_url is not a valid URL: {}", self.api.base_url))?;

        Ok(())
    }

    /// Get device unit timeout as Duration
    #[must_use]
    pub fn device_task_timeout(&self) -> Duration {
        Duration::from_secs(self.farm.device_task_timeout_secs)
    }

    /// Get inter-attempt retry delay as Duration
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry.delay_seconds)
    }

    /// Get API request timeout as Duration
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            farm: FarmConfig::default(),
            devices: DeviceConfig::default(),
            retry: RetryConfig::default(),
            workers: WorkerConfig::default(),
            api: ApiConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
