//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::storage::{AllocatorKind, CodecKind, StorageConfig as EngineConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub gc: GcConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage layout configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    #[serde(default)]
    pub allocator: AllocatorKind,

    #[serde(default = "default_file_size")]
    pub file_size: u64,

    #[serde(default = "default_segment_size")]
    pub segment_size: usize,

    #[serde(default = "default_bucket_width")]
    pub bucket_width_ms: i64,

    /// 0 keeps data forever
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("chronicle").to_string_lossy().to_string())
        .unwrap_or_else(|| "./chronicle_data".to_string())
}

fn default_file_size() -> u64 {
    16 * 1024 * 1024 // 16 MB
}

fn default_segment_size() -> usize {
    4096
}

fn default_bucket_width() -> i64 {
    4_096_000 // ~68 minutes
}

fn default_retention_hours() -> u64 {
    24 * 28
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            allocator: AllocatorKind::default(),
            file_size: default_file_size(),
            segment_size: default_segment_size(),
            bucket_width_ms: default_bucket_width(),
            retention_hours: default_retention_hours(),
        }
    }
}

/// Compaction configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_compaction_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_compaction_ratio")]
    pub ratio: f64,

    #[serde(default = "default_write_codec")]
    pub write_codec: CodecKind,

    #[serde(default = "default_compaction_codec")]
    pub compaction_codec: CodecKind,

    #[serde(default)]
    pub on_start: bool,
}

fn default_true() -> bool {
    true
}

fn default_compaction_interval() -> u64 {
    60_000 // 1 minute
}

fn default_compaction_ratio() -> f64 {
    1.2
}

fn default_write_codec() -> CodecKind {
    CodecKind::DeltaXor
}

fn default_compaction_codec() -> CodecKind {
    CodecKind::Gorilla
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_compaction_interval(),
            ratio: default_compaction_ratio(),
            write_codec: default_write_codec(),
            compaction_codec: default_compaction_codec(),
            on_start: false,
        }
    }
}

/// Retention configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_gc_interval")]
    pub interval_ms: u64,
}

fn default_gc_interval() -> u64 {
    3_600_000 // 1 hour
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_gc_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("chronicle").join("config.toml")),
            Some(PathBuf::from("/etc/chronicle/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("CHRONICLE_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(width) = std::env::var("CHRONICLE_BUCKET_WIDTH_MS") {
            match width.parse() {
                Ok(w) => self.storage.bucket_width_ms = w,
                Err(_) => tracing::warn!("Ignoring CHRONICLE_BUCKET_WIDTH_MS={}", width),
            }
        }
        if let Ok(hours) = std::env::var("CHRONICLE_RETENTION_HOURS") {
            match hours.parse() {
                Ok(h) => self.storage.retention_hours = h,
                Err(_) => tracing::warn!("Ignoring CHRONICLE_RETENTION_HOURS={}", hours),
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("CHRONICLE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("CHRONICLE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Data directory with a leading `~` expanded
    pub fn data_dir(&self) -> PathBuf {
        match self.storage.data_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.storage.data_dir)),
            None => PathBuf::from(&self.storage.data_dir),
        }
    }

    /// Build the engine configuration, rejecting unusable settings
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let retention_ms = match self.storage.retention_hours {
            0 => None,
            hours => Some(
                i64::try_from(hours)
                    .ok()
                    .and_then(|h| h.checked_mul(3_600_000))
                    .ok_or_else(|| ConfigError::Invalid("retention_hours is too large".into()))?,
            ),
        };

        let config = EngineConfig {
            data_dir: self.data_dir(),
            allocator: self.storage.allocator,
            file_size: self.storage.file_size,
            segment_size: self.storage.segment_size,
            bucket_width_ms: self.storage.bucket_width_ms,
            retention_ms,
            write_codec: self.compaction.write_codec,
            compaction_codec: self.compaction.compaction_codec,
            compaction_ratio: self.compaction.ratio,
            compaction_enabled: self.compaction.enabled,
            compact_on_start: self.compaction.on_start,
            compaction_interval_ms: self.compaction.interval_ms,
            gc_enabled: self.gc.enabled,
            gc_interval_ms: self.gc.interval_ms,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Chronicle Engine Configuration
#
# Environment variables override these settings:
# - CHRONICLE_DATA_DIR
# - CHRONICLE_BUCKET_WIDTH_MS
# - CHRONICLE_RETENTION_HOURS
# - CHRONICLE_LOG_LEVEL
# - CHRONICLE_LOG_FORMAT

[storage]
# Directory for storing data files
data_dir = "~/.local/share/chronicle"

# Where segment buffers live: disk or memory
allocator = "disk"

# Size of each backing file (bytes)
file_size = 16777216

# Size of a new head segment (bytes); a field holds at most 254 segments
# per bucket before it must be compacted
segment_size = 4096

# Width of a time bucket (ms)
bucket_width_ms = 4096000

# Drop buckets older than this (hours, 0 keeps everything)
retention_hours = 672

[compaction]
enabled = true

# How often to compact (ms)
interval_ms = 60000

# Headroom for the merge buffer
ratio = 1.2

# Codecs: delta-xor or gorilla
write_codec = "delta-xor"
compaction_codec = "gorilla"

# Compact every field when the engine opens
on_start = false

[gc]
enabled = true

# How often to apply retention (ms)
interval_ms = 3600000

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips() {
        let config = Config::parse(&generate_default_config()).unwrap();
        assert_eq!(config.storage.allocator, AllocatorKind::Disk);
        assert_eq!(config.storage.segment_size, 4096);
        assert_eq!(config.compaction.write_codec, CodecKind::DeltaXor);
        assert_eq!(config.compaction.compaction_codec, CodecKind::Gorilla);
        assert_eq!(config.gc.interval_ms, 3_600_000);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse(
            r#"
            [storage]
            data_dir = "/tmp/chronicle"
            allocator = "memory"
            retention_hours = 0

            [compaction]
            write_codec = "gorilla"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.bucket_width_ms, 4_096_000);
        assert!(config.compaction.enabled);

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.allocator, AllocatorKind::Memory);
        assert_eq!(engine.write_codec, CodecKind::Gorilla);
        assert_eq!(engine.retention_ms, None);
        assert_eq!(engine.data_dir, PathBuf::from("/tmp/chronicle"));
    }

    #[test]
    fn test_retention_hours_convert() {
        let mut config = Config::default();
        config.storage.retention_hours = 2;
        assert_eq!(config.engine_config().unwrap().retention_ms, Some(7_200_000));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let mut config = Config::default();
        config.storage.segment_size = 16;
        assert!(matches!(config.engine_config(), Err(ConfigError::Invalid(_))));

        let err = Config::parse("[compaction]\nwrite_codec = \"lz4\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_tilde_expansion() {
        let mut config = Config::default();
        config.storage.data_dir = "~/chronicle".to_string();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(config.data_dir(), home.join("chronicle"));
        }
    }
}
