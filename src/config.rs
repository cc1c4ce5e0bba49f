//! Configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::hosts;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub polling: PollingConfig,

    pub hardware: HardwareConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub supervisor: SupervisorSettings,
}

/// Poll cadence and series sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
    /// Seconds between fast polls; also the supervisor wake period. Default: 2.
    #[serde(default = "default_fast_poll_interval")]
    pub fast_poll_interval: f64,

    /// Medium tier runs every N fast cycles. Default: 15.
    #[serde(default = "default_medium_poll_multiple")]
    pub medium_poll_multiple: u32,

    /// Slow tier runs every N fast cycles. Default: 60.
    #[serde(default = "default_slow_poll_multiple")]
    pub slow_poll_multiple: u32,

    /// Samples kept per series; 300 is 10 minutes at 2s. 0 keeps every
    /// sample. Default: 300.
    #[serde(default = "default_series_capacity")]
    pub series_capacity: usize,

    /// Window, in seconds, for the rates pushed every fast cycle. Default: 60.
    #[serde(default = "default_average_span")]
    pub average_span: f64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_poll_interval: default_fast_poll_interval(),
            medium_poll_multiple: default_medium_poll_multiple(),
            slow_poll_multiple: default_slow_poll_multiple(),
            series_capacity: default_series_capacity(),
            average_span: default_average_span(),
        }
    }
}

impl PollingConfig {
    pub fn fast_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.fast_poll_interval).unwrap_or(Duration::MAX)
    }

    pub fn average_span(&self) -> Duration {
        Duration::try_from_secs_f64(self.average_span).unwrap_or(Duration::MAX)
    }

    /// Bound on every series, `None` when unbounded.
    pub fn series_capacity(&self) -> Option<usize> {
        (self.series_capacity > 0).then_some(self.series_capacity)
    }
}

/// Hardware backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Simulated,
    Diskstats,
}

/// Controllers to poll and how to reach them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HardwareConfig {
    /// Comma-separated host list with bracket expansion, e.g. `sfa[1-4][a,b]`.
    pub hosts: String,

    #[serde(default = "default_backend")]
    pub backend: Backend,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Oldest firmware with the counters we need. Default: "2.3.0".
    #[serde(default = "default_minimum_firmware")]
    pub minimum_firmware: String,

    /// Also track per-drive statistics. Slow on large enclosures. Default: false.
    #[serde(default)]
    pub track_disk_drives: bool,

    /// Statistics file for the diskstats backend. `{host}` is replaced by
    /// the host name. Default: "/proc/diskstats".
    #[serde(default = "default_diskstats_path")]
    pub diskstats_path: String,

    #[serde(default)]
    pub simulated: SimulatedConfig,
}

/// Shape of the simulated controllers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulatedConfig {
    #[serde(default = "default_sim_luns")]
    pub luns: u32,

    #[serde(default = "default_sim_drives")]
    pub drives: u32,

    #[serde(default = "default_sim_firmware")]
    pub firmware: String,

    /// Hosts that refuse connections.
    #[serde(default)]
    pub unreachable: Vec<String>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            luns: default_sim_luns(),
            drives: default_sim_drives(),
            firmware: default_sim_firmware(),
            unreachable: Vec::new(),
        }
    }
}

/// Output format of the storage sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFormat {
    /// One JSON object per point.
    Jsonl,
    /// Human-readable aligned columns.
    Text,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    #[serde(default = "default_storage_format")]
    pub format: StorageFormat,

    /// Directory holding one file per host. Default: "data".
    #[serde(default = "default_storage_directory")]
    pub directory: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            format: default_storage_format(),
            directory: default_storage_directory(),
        }
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorSettings {
    /// Seconds a cycle may wait on a live worker before it is reported
    /// stalled. 0 disables the check. Default: 30.
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout: f64,

    /// Kill stalled workers so the next liveness check restarts them. Default: true.
    #[serde(default = "default_true")]
    pub kill_stalled: bool,

    /// Seconds to wait for workers to exit at shutdown before killing them. Default: 10.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: f64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            stall_timeout: default_stall_timeout(),
            kill_stalled: true,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl SupervisorSettings {
    pub fn stall_timeout(&self) -> Option<Duration> {
        (self.stall_timeout > 0.0)
            .then(|| Duration::try_from_secs_f64(self.stall_timeout).unwrap_or(Duration::MAX))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.shutdown_timeout).unwrap_or(Duration::MAX)
    }
}

impl Config {
    /// Read and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Parse and validate configuration text.
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Expanded list of controller hosts.
    pub fn hosts(&self) -> Result<Vec<String>> {
        hosts::parse_host_list(&self.hardware.hosts)
    }

    fn validate(&self) -> Result<()> {
        let p = &self.polling;
        if seconds("fast_poll_interval", p.fast_poll_interval)?.is_zero() {
            return Err(Error::Config("fast_poll_interval must be positive".into()));
        }
        if p.medium_poll_multiple == 0 || p.slow_poll_multiple == 0 {
            return Err(Error::Config("poll multiples must be at least 1".into()));
        }
        seconds("average_span", p.average_span)?;
        let s = &self.supervisor;
        seconds("stall_timeout", s.stall_timeout)?;
        seconds("shutdown_timeout", s.shutdown_timeout)?;
        if self.hosts()?.is_empty() {
            return Err(Error::Config("no controller hosts configured".into()));
        }
        Ok(())
    }
}

/// A non-negative number of seconds that fits in a `Duration`.
fn seconds(key: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::Config(format!("{key} = {value} is not a usable duration: {e}")))
}

fn default_fast_poll_interval() -> f64 {
    2.0
}

fn default_medium_poll_multiple() -> u32 {
    15
}

fn default_slow_poll_multiple() -> u32 {
    60
}

fn default_series_capacity() -> usize {
    300
}

fn default_average_span() -> f64 {
    60.0
}

fn default_backend() -> Backend {
    Backend::Simulated
}

fn default_minimum_firmware() -> String {
    "2.3.0".to_string()
}

fn default_diskstats_path() -> String {
    "/proc/diskstats".to_string()
}

fn default_sim_luns() -> u32 {
    4
}

fn default_sim_drives() -> u32 {
    8
}

fn default_sim_firmware() -> String {
    "3.1.0.0".to_string()
}

fn default_storage_format() -> StorageFormat {
    StorageFormat::Jsonl
}

fn default_storage_directory() -> PathBuf {
    PathBuf::from("data")
}

fn default_stall_timeout() -> f64 {
    30.0
}

fn default_shutdown_timeout() -> f64 {
    10.0
}

fn default_true() -> bool {
    true
}
