//! Scheduler and pool configuration, with defaults mirroring the reference
//! engine's `DEFAULT_*` constants.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default results-channel buffer size.
pub const DEFAULT_RESULTS_CHANNEL_CAPACITY: usize = 1000;
/// Default cpu-pool worker count; `0` means "use available parallelism".
pub const DEFAULT_CPU_WORKERS: usize = 0;
/// Default sink batch size before a forced flush.
pub const DEFAULT_SINK_BATCH_SIZE: usize = 50;
/// Default sink flush interval, in milliseconds.
pub const DEFAULT_SINK_FLUSH_INTERVAL_MS: u64 = 2_000;
/// Default provider adapter retry ceiling.
pub const DEFAULT_MAX_RETRIES: u32 = 7;
/// Default OCR job-level retry budget, per page (§9 open question a).
pub const DEFAULT_MAX_PAGE_RETRIES: u32 = 10;

/// Per-pool rate and concurrency configuration, normally sourced from the
/// adapter itself but overridable per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool name; defaults to the adapter's own name if omitted.
    pub name: Option<String>,
    /// Worker concurrency; `0` defers to the adapter's `max_concurrency`.
    #[serde(default)]
    pub workers: usize,
    /// Token-bucket capacity (burst size). Conventionally `1 burst + 1`.
    pub capacity: f64,
    /// Token-bucket refill rate, in requests per second.
    pub rps: f64,
    /// Retry ceiling; `0` defers to the adapter's `max_retries`.
    #[serde(default)]
    pub max_retries: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { name: None, workers: 0, capacity: 2.0, rps: 1.0, max_retries: DEFAULT_MAX_RETRIES }
    }
}

/// Top-level scheduler configuration, loadable from
/// `XDG_CONFIG_HOME/bookforge/config.json` and overridable by CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Home directory for on-disk artifacts (originals, source images, audio).
    pub home_dir: std::path::PathBuf,
    /// Results channel buffer size.
    #[serde(default = "default_results_capacity")]
    pub results_channel_capacity: usize,
    /// CPU pool worker count (`0` = available parallelism).
    #[serde(default)]
    pub cpu_workers: usize,
    /// Sink batch size before a forced flush.
    #[serde(default = "default_sink_batch_size")]
    pub sink_batch_size: usize,
    /// Sink flush interval, in milliseconds.
    #[serde(default = "default_sink_flush_interval_ms")]
    pub sink_flush_interval_ms: u64,
    /// OCR job-level per-page retry budget.
    #[serde(default = "default_max_page_retries")]
    pub max_page_retries: u32,
}

fn default_results_capacity() -> usize {
    DEFAULT_RESULTS_CHANNEL_CAPACITY
}
fn default_sink_batch_size() -> usize {
    DEFAULT_SINK_BATCH_SIZE
}
fn default_sink_flush_interval_ms() -> u64 {
    DEFAULT_SINK_FLUSH_INTERVAL_MS
}
fn default_max_page_retries() -> u32 {
    DEFAULT_MAX_PAGE_RETRIES
}

impl SchedulerConfig {
    /// Build a config with every field at its documented default, rooted at `home_dir`.
    pub fn with_home_dir(home_dir: std::path::PathBuf) -> Self {
        Self {
            home_dir,
            results_channel_capacity: DEFAULT_RESULTS_CHANNEL_CAPACITY,
            cpu_workers: DEFAULT_CPU_WORKERS,
            sink_batch_size: DEFAULT_SINK_BATCH_SIZE,
            sink_flush_interval_ms: DEFAULT_SINK_FLUSH_INTERVAL_MS,
            max_page_retries: DEFAULT_MAX_PAGE_RETRIES,
        }
    }

    /// The sink flush interval as a [`std::time::Duration`].
    pub fn sink_flush_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sink_flush_interval_ms)
    }
}

/// Errors raised loading or saving a [`SchedulerConfig`] file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Neither `XDG_CONFIG_HOME` nor `HOME` is set, or one is set but empty.
    #[error("cannot determine config directory: {0}")]
    NoConfigHome(String),
    /// Filesystem I/O failure reading, writing, or renaming the config file.
    #[error("config file I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The config file's contents did not parse as a [`SchedulerConfig`].
    #[error("config file is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

fn xdg_config_home() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            return Err(ConfigError::NoConfigHome("XDG_CONFIG_HOME is set but empty".into()));
        }
        return Ok(dir);
    }
    let home = std::env::var_os("HOME")
        .ok_or_else(|| ConfigError::NoConfigHome("HOME is not set".into()))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        return Err(ConfigError::NoConfigHome("HOME is set but empty".into()));
    }
    Ok(home.join(".config"))
}

/// Path to the scheduler's config file: `XDG_CONFIG_HOME/bookforge/config.json`.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(xdg_config_home()?.join("bookforge").join("config.json"))
}

/// Load the config file, if it exists.
pub fn load_config() -> Result<Option<SchedulerConfig>, ConfigError> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Save the config file, creating its parent directory and writing
/// atomically via a temp-file rename.
pub fn save_config(config: &SchedulerConfig) -> Result<(), ConfigError> {
    let path = config_path()?;
    let dir = path.parent().expect("config_path always has a parent");
    std::fs::create_dir_all(dir)?;
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let config = SchedulerConfig::with_home_dir("/tmp/bookforge".into());
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sink_batch_size, DEFAULT_SINK_BATCH_SIZE);
    }

    #[test]
    fn missing_optional_fields_fall_back_to_defaults() {
        let json = r#"{"home_dir": "/tmp/bookforge"}"#;
        let parsed: SchedulerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.results_channel_capacity, DEFAULT_RESULTS_CHANNEL_CAPACITY);
        assert_eq!(parsed.max_page_retries, DEFAULT_MAX_PAGE_RETRIES);
    }
}
