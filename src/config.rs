//! Runtime configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_RUNTIME_`, using `__` to
//!    separate nested keys (e.g. `DAQ_RUNTIME_SESSION__MODE=simulation`)
//!
//! Every section has defaults, so a file containing only `[[devices]]`
//! entries is complete.
//!
//! # Example
//! ```no_run
//! use daq_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::load_validated("setup.toml")?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), anyhow::Error>(())
//! ```

use anyhow::{anyhow, Context};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::mode::ExecutionMode;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQ_RUNTIME_";

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Session-wide behavior
    #[serde(default)]
    pub session: SessionConfig,
    /// Cache key prefix and device lock timing
    #[serde(default)]
    pub cache: CacheConfig,
    /// Device setup entries, created on demand by the session
    #[serde(default)]
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Execution mode the session starts in
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Reject unknown device configuration keys instead of warning
    #[serde(default)]
    pub strict_config: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Key prefix on the cache wire, must end with '/'
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Device lock lifetime in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
    /// Delay between device lock attempts in milliseconds
    #[serde(default = "default_lock_retry")]
    pub lock_retry_ms: u64,
    /// Default time to wait for a device lock in milliseconds
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            lock_ttl_secs: default_lock_ttl(),
            lock_retry_ms: default_lock_retry(),
            lock_timeout_ms: default_lock_timeout(),
        }
    }
}

impl CacheConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Device definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name
    pub name: String,
    /// Registered device type (e.g. "VirtualMotor")
    pub r#type: String,
    /// Parameter and attachment values
    #[serde(default)]
    pub config: Map<String, Value>,
}

// Default value functions
fn default_name() -> String {
    "daq-runtime".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_prefix() -> String {
    "daq/".to_string()
}

fn default_lock_ttl() -> u64 {
    1800
}

fn default_lock_retry() -> u64 {
    300
}

fn default_lock_timeout() -> u64 {
    3000
}

impl RuntimeConfig {
    /// Load configuration from a specific file path, then apply `DAQ_RUNTIME_`
    /// environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
    }

    /// Load and validate in one step, with the file path as error context.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = Self::load_from(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        config
            .validate()
            .map_err(|e| anyhow!("invalid configuration in {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        if !self.cache.prefix.ends_with('/') {
            return Err(format!(
                "Invalid cache prefix '{}'. Must end with '/'",
                self.cache.prefix
            ));
        }
        if self.cache.lock_retry_ms == 0 {
            return Err("cache.lock_retry_ms must be greater than zero".to_string());
        }
        if self.cache.lock_timeout_ms == 0 {
            return Err("cache.lock_timeout_ms must be greater than zero".to_string());
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if !names.insert(device.name.to_lowercase()) {
                return Err(format!("Duplicate device name: {}", device.name));
            }
        }

        Ok(())
    }
}
