// Configuration loading and management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const PROD: &str = "prod";
#[allow(dead_code)]
pub const DEV: &str = "dev";
pub const TEST: &str = "test";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{section}.{field} must be greater than zero")]
    Zero {
        section: &'static str,
        field: &'static str,
    },
    #[error("{section}.{field} must be within (0, 1], got {value}")]
    Ratio {
        section: &'static str,
        field: &'static str,
        value: f64,
    },
    #[error("overflow is enabled but overflow.path is not set")]
    MissingOverflowPath,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(rename = "streamcore")]
    pub core: CoreBox,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreBox {
    pub env: String,
    pub logs: Option<Logs>,
    pub queue: Option<Queue>,
    pub overflow: Option<Overflow>,
    pub cache: Option<Cache>,
    pub remote: Option<Remote>,
    pub breaker: Option<Breaker>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Logs {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Queue {
    pub name: Option<String>,
    pub concurrency: Option<usize>,
    #[serde(rename = "max_retries")]
    pub max_retries: Option<u32>,
    #[serde(rename = "max_queue_size")]
    pub max_queue_size: Option<usize>,
    #[serde(rename = "retry_delay", default, with = "humantime_serde")]
    pub retry_delay: Option<Duration>,
    #[serde(rename = "backoff_factor")]
    pub backoff_factor: Option<f64>,
    #[serde(rename = "max_retry_delay", default, with = "humantime_serde")]
    pub max_retry_delay: Option<Duration>,
    #[serde(rename = "priority_decrement")]
    pub priority_decrement: Option<i32>,
    #[serde(rename = "job_timeout", default, with = "humantime_serde")]
    pub job_timeout: Option<Duration>,
    pub rate: Option<u32>,
    #[serde(rename = "stats_interval", default, with = "humantime_serde")]
    pub stats_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Overflow {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    #[serde(rename = "recover_interval", default, with = "humantime_serde")]
    pub recover_interval: Option<Duration>,
    #[serde(rename = "lock_stale_after", default, with = "humantime_serde")]
    pub lock_stale_after: Option<Duration>,
    #[serde(rename = "lock_attempts")]
    pub lock_attempts: Option<u32>,
    #[serde(rename = "lock_backoff", default, with = "humantime_serde")]
    pub lock_backoff: Option<Duration>,
    #[serde(rename = "lock_max_backoff", default, with = "humantime_serde")]
    pub lock_max_backoff: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Cache {
    #[serde(rename = "max_memory_mb")]
    pub max_memory_mb: Option<usize>,
    #[serde(rename = "max_entry_ratio")]
    pub max_entry_ratio: Option<f64>,
    #[serde(rename = "default_ttl", default, with = "humantime_serde")]
    pub default_ttl: Option<Duration>,
    #[serde(rename = "sweep_interval", default, with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
    #[serde(rename = "sweep_batch")]
    pub sweep_batch: Option<usize>,
    #[serde(rename = "pressure_ratio")]
    pub pressure_ratio: Option<f64>,
    #[serde(rename = "soft_limit")]
    pub soft_limit: Option<f64>,
    #[serde(rename = "stats_interval", default, with = "humantime_serde")]
    pub stats_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Remote {
    #[serde(rename = "lock_ttl", default, with = "humantime_serde")]
    pub lock_ttl: Option<Duration>,
    #[serde(rename = "wait_attempts")]
    pub wait_attempts: Option<u32>,
    #[serde(rename = "wait_interval", default, with = "humantime_serde")]
    pub wait_interval: Option<Duration>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Breaker {
    pub threshold: Option<u32>,
    #[serde(default, with = "humantime_serde")]
    pub cooldown: Option<Duration>,
}

// Config trait
pub trait ConfigTrait {
    fn logs(&self) -> Option<&Logs>;
    fn is_prod(&self) -> bool;
    #[allow(dead_code)]
    fn is_test(&self) -> bool;
    fn queue(&self) -> Option<&Queue>;
    fn overflow(&self) -> Option<&Overflow>;
    fn cache(&self) -> Option<&Cache>;
    fn remote(&self) -> Option<&Remote>;
    fn breaker(&self) -> Option<&Breaker>;
}

impl ConfigTrait for Config {
    fn logs(&self) -> Option<&Logs> {
        self.core.logs.as_ref()
    }

    fn is_prod(&self) -> bool {
        self.core.env == PROD
    }

    fn is_test(&self) -> bool {
        self.core.env == TEST
    }

    fn queue(&self) -> Option<&Queue> {
        self.core.queue.as_ref()
    }

    fn overflow(&self) -> Option<&Overflow> {
        self.core.overflow.as_ref()
    }

    fn cache(&self) -> Option<&Cache> {
        self.core.cache.as_ref()
    }

    fn remote(&self) -> Option<&Remote> {
        self.core.remote.as_ref()
    }

    fn breaker(&self) -> Option<&Breaker> {
        self.core.breaker.as_ref()
    }
}

impl Config {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let abs_path = path
            .canonicalize()
            .with_context(|| format!("failed to resolve absolute config filepath: {:?}", path))?;

        let data = std::fs::read_to_string(&abs_path)
            .with_context(|| format!("read config yaml file {:?}", abs_path))?;

        let cfg = Self::from_yaml(&data).with_context(|| format!("load config from {:?}", abs_path))?;
        Ok(cfg)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("unmarshal yaml")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(queue) = self.queue() {
            if queue.concurrency == Some(0) {
                return Err(ConfigError::Zero { section: "queue", field: "concurrency" });
            }
            if queue.max_queue_size == Some(0) {
                return Err(ConfigError::Zero { section: "queue", field: "max_queue_size" });
            }
            if queue.rate == Some(0) {
                return Err(ConfigError::Zero { section: "queue", field: "rate" });
            }
        }

        if let Some(overflow) = self.overflow() {
            if overflow.enabled && overflow.path.is_none() {
                return Err(ConfigError::MissingOverflowPath);
            }
        }

        if let Some(cache) = self.cache() {
            if cache.max_memory_mb == Some(0) {
                return Err(ConfigError::Zero { section: "cache", field: "max_memory_mb" });
            }
            for (field, value) in [
                ("max_entry_ratio", cache.max_entry_ratio),
                ("pressure_ratio", cache.pressure_ratio),
                ("soft_limit", cache.soft_limit),
            ] {
                if let Some(value) = value {
                    if !(value > 0.0 && value <= 1.0) {
                        return Err(ConfigError::Ratio { section: "cache", field, value });
                    }
                }
            }
        }

        if let Some(breaker) = self.breaker() {
            if breaker.threshold == Some(0) {
                return Err(ConfigError::Zero { section: "breaker", field: "threshold" });
            }
        }

        Ok(())
    }
}

mod test_config;
#[allow(dead_code)]
pub use test_config::new_test_config;

#[cfg(test)]
mod config_test;
