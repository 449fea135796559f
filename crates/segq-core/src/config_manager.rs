use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Upper bound on slots per segment. Larger segments only retain more memory
/// per partially drained link of the chain.
pub const MAX_SEGMENT_CAPACITY: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for segq
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SegqConfig {
    /// Queue tuning
    #[serde(default)]
    pub queue: QueueConfig,

    /// Batching consumer settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Queue tuning. The only knob is the number of slots per segment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Slots per segment. Larger values amortize chain growth over more
    /// operations but keep a partially drained segment alive longer and make
    /// counting/enumeration scan more slots.
    #[serde(default = "default_segment_capacity")]
    pub segment_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            segment_capacity: default_segment_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn with_segment_capacity(segment_capacity: usize) -> Self {
        Self { segment_capacity }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "segment_capacity must be at least 1".to_string(),
            ));
        }
        if self.segment_capacity > MAX_SEGMENT_CAPACITY {
            return Err(ConfigError::ValidationError(format!(
                "segment_capacity {} exceeds maximum of {}",
                self.segment_capacity, MAX_SEGMENT_CAPACITY
            )));
        }
        Ok(())
    }
}

/// Batching consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Maximum items handed to a batch handler at once
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush a partial batch after this many milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Number of concurrent processors spawned by `spawn_processors`
    #[serde(default = "default_consumers")]
    pub consumers: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            consumers: default_consumers(),
        }
    }
}

impl PipelineConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.consumers == 0 {
            return Err(ConfigError::ValidationError(
                "consumers must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_segment_capacity() -> usize {
    32
}
fn default_batch_size() -> usize {
    64
}
fn default_batch_timeout_ms() -> u64 {
    50
}
fn default_consumers() -> usize {
    1
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager
pub struct ConfigManager {
    config: SegqConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (`SEGQ_*`)
    /// 2. Config file (`./.segq.toml`, then `~/.segq/config.toml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!("Loaded segq configuration from {}", path.display()),
            None => info!("No segq config file found, using defaults"),
        }
        info!(
            segment_capacity = config.queue.segment_capacity,
            batch_size = config.pipeline.batch_size,
            consumers = config.pipeline.consumers,
            "segq configuration ready"
        );

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load a specific config file, still honouring env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::read_toml_file(path)?;
        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    /// Wrap an already-built configuration after validating it.
    pub fn from_config(config: SegqConfig) -> Result<Self, ConfigError> {
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: None,
        })
    }

    fn load_config_file() -> Result<(SegqConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".segq.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".segq").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((SegqConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<SegqConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `SEGQ_*` overrides. Unparseable numeric values are ignored with
    /// a warning.
    fn apply_env_overrides<F>(mut config: SegqConfig, lookup: F) -> SegqConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(capacity) = lookup("SEGQ_SEGMENT_CAPACITY") {
            match capacity.parse() {
                Ok(n) => config.queue.segment_capacity = n,
                Err(_) => warn!("Ignoring invalid SEGQ_SEGMENT_CAPACITY: {}", capacity),
            }
        }
        if let Some(batch) = lookup("SEGQ_BATCH_SIZE") {
            match batch.parse() {
                Ok(n) => config.pipeline.batch_size = n,
                Err(_) => warn!("Ignoring invalid SEGQ_BATCH_SIZE: {}", batch),
            }
        }
        if let Some(timeout) = lookup("SEGQ_BATCH_TIMEOUT_MS") {
            match timeout.parse() {
                Ok(ms) => config.pipeline.batch_timeout_ms = ms,
                Err(_) => warn!("Ignoring invalid SEGQ_BATCH_TIMEOUT_MS: {}", timeout),
            }
        }
        if let Some(consumers) = lookup("SEGQ_CONSUMERS") {
            match consumers.parse() {
                Ok(n) => config.pipeline.consumers = n,
                Err(_) => warn!("Ignoring invalid SEGQ_CONSUMERS: {}", consumers),
            }
        }
        if let Some(level) = lookup("SEGQ_LOG_LEVEL") {
            config.logging.level = level.to_lowercase();
        }
        if let Some(format) = lookup("SEGQ_LOG_FORMAT") {
            config.logging.format = format.to_lowercase();
        }

        config
    }

    /// Validate configuration
    pub fn validate_config(config: &SegqConfig) -> Result<(), ConfigError> {
        config.queue.validate()?;
        config.pipeline.validate()?;

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "compact" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, compact, json",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &SegqConfig {
        &self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = SegqConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
