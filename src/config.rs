use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Value compression applied by the segment store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    Lz4,
    Zstd,
}

/// Segment store tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// A segment is rotated once an append would push it past this size.
    pub max_segment_size: u64,
    pub max_value_size: usize,
    pub compression: CompressionType,
    /// Verify CRC32 on every read and during replay.
    pub enable_checksums: bool,
    /// fsync after each dumped range instead of leaving it to the OS.
    pub sync_on_flush: bool,
    /// Dead bytes / total bytes above which compaction is worthwhile.
    pub compaction_threshold: f32,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 64 * 1024 * 1024,
            max_value_size: 16 * 1024 * 1024,
            compression: CompressionType::None,
            enable_checksums: true,
            sync_on_flush: true,
            compaction_threshold: 0.5,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segment_size == 0 {
            return Err(ConfigError::Invalid("max_segment_size must be > 0".to_string()));
        }
        if self.max_value_size == 0 || u32::try_from(self.max_value_size).is_err() {
            return Err(ConfigError::Invalid(
                "max_value_size must be within 1..=u32::MAX".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(ConfigError::Invalid(
                "compaction_threshold must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration of a memory-backed raw vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Each collection persists under `data_dir/<collection name>`.
    pub data_dir: PathBuf,
    /// Period of the background flusher.
    pub flush_interval_ms: u64,
    pub segment: SegmentConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            flush_interval_ms: 1000,
            segment: SegmentConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("flush_interval_ms must be > 0".to_string()));
        }
        self.segment.validate()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn collection_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }
}
