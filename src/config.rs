use serde::Deserialize;

use crate::error::BackfillError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub rpc: RpcConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    pub queue_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    pub rpc_endpoints: Vec<String>,
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: f64,
}

fn default_rate_per_second() -> f64 {
    2.0
}

fn default_burst() -> f64 {
    5.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScalingConfig {
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_min_workers() -> usize {
    1
}

fn default_max_workers() -> usize {
    8
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogConfig {
    #[serde(default = "default_stuck_timeout_secs")]
    pub stuck_timeout_secs: u64,
}

fn default_stuck_timeout_secs() -> u64 {
    15 * 60
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            stuck_timeout_secs: default_stuck_timeout_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdminConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal"];

impl Config {
    pub fn load(path: &str) -> Result<Self, BackfillError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| BackfillError::Config(format!("failed to read '{}': {}", path, e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| BackfillError::Config(format!("failed to parse '{}': {}", path, e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), BackfillError> {
        if self.rpc.rpc_endpoints.is_empty() {
            return Err(BackfillError::Config(
                "at least one rpc endpoint must be configured".to_string(),
            ));
        }
        if self.scaling.max_workers < self.scaling.min_workers {
            return Err(BackfillError::Config(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.scaling.max_workers, self.scaling.min_workers
            )));
        }
        if self.scaling.min_workers == 0 {
            return Err(BackfillError::Config(
                "min_workers must be >= 1".to_string(),
            ));
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(BackfillError::Config(format!(
                "invalid log_level '{}', must be one of {:?}",
                self.log_level, VALID_LOG_LEVELS
            )));
        }
        Ok(())
    }
}
