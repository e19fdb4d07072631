//! Configuration schema definitions.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How persisted jobs are spread over files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileLayout {
    /// One file holding every persisted job.
    #[default]
    Single,
    /// One file per owning user.
    PerUser,
}

/// Job store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the persisted job files.
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Canonical file name (the stem and extension are reused for
    /// per-user files).
    #[serde(default = "default_file_name")]
    pub file_name: String,

    /// File layout.
    #[serde(default)]
    pub layout: FileLayout,

    /// Delay between a persisted change and the background write.
    #[serde(default = "default_write_delay_ms")]
    pub write_delay_ms: u64,

    /// Write pending changes when the background flusher stops.
    #[serde(default = "default_flush_on_shutdown")]
    pub flush_on_shutdown: bool,

    /// Wall-clock readings before this instant (ms since epoch) are
    /// considered untrustworthy.
    #[serde(default = "default_wall_clock_floor_ms")]
    pub wall_clock_floor_ms: i64,
}

fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".jobstore"))
        .unwrap_or_else(|| PathBuf::from("/tmp/jobstore"))
}

fn default_file_name() -> String {
    "jobs.bin".to_string()
}

fn default_write_delay_ms() -> u64 {
    2000
}

fn default_flush_on_shutdown() -> bool {
    true
}

fn default_wall_clock_floor_ms() -> i64 {
    1_577_836_800_000 // 2020-01-01T00:00:00Z
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            file_name: default_file_name(),
            layout: FileLayout::default(),
            write_delay_ms: default_write_delay_ms(),
            flush_on_shutdown: default_flush_on_shutdown(),
            wall_clock_floor_ms: default_wall_clock_floor_ms(),
        }
    }
}

impl StoreConfig {
    /// Create a configuration rooted at `storage_dir` with default settings.
    pub fn with_storage_dir(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    /// Set the file layout.
    pub fn with_layout(mut self, layout: FileLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the background write delay.
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Background write delay as a duration.
    pub fn write_delay(&self) -> Duration {
        Duration::from_millis(self.write_delay_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
