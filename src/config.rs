//! Configuration management for the backup daemon.
//!
//! Loads a TOML file describing the storage API endpoint, the global
//! schedule and retention policy, and the dataset/destination list. The
//! reconciliation loop re-reads the file periodically; a file that fails to
//! parse or validate leaves the previous configuration in force.

use crate::retention::RetentionPolicy;
use crate::schedule::Schedule;
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub remote_sync: RemoteSyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Storage API endpoint (JSON-RPC over HTTP)
    #[serde(default = "default_api_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Minimum seconds between two `frequent` snapshots
    #[serde(default = "default_backup_interval")]
    pub backup_interval: u64,

    /// Seconds between reconciliation ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,

    /// Seconds between configuration re-reads
    #[serde(default = "default_reload_interval")]
    pub config_reload_interval: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(flatten)]
    pub window: Schedule,

    /// Create one snapshot per due granularity instead of only the
    /// coarsest one
    #[serde(default)]
    pub independent_granularities: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSyncConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Minimum seconds between two syncs to the same destination
    #[serde(default = "default_sync_interval")]
    pub interval: u64,

    /// Seconds between replication job status polls
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    #[serde(flatten)]
    pub window: Schedule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Port for the /health and /version endpoints
    #[serde(default = "default_health_port")]
    pub port: u16,

    /// Consecutive failing ticks before /health reports unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// One local dataset and where it replicates to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Dataset path, e.g. `tank/data`
    pub dataset: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `active` datasets get snapshots and syncs; `passive` ones only get
    /// retention pruning and hold cleanup
    #[serde(default)]
    pub mode: DatasetMode,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetMode {
    #[default]
    Active,
    Passive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Remote host identifier; also the hostname encoded into sync holds
    pub remote_host: String,

    /// Target dataset on the remote; defaults to the local dataset path
    #[serde(default)]
    pub remote_dataset: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-destination override of `remote_sync.interval`, in seconds
    #[serde(default)]
    pub sync_interval: Option<u64>,
}

// Default values
fn default_api_url() -> String {
    "http://localhost:8545".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_backup_interval() -> u64 {
    600
}

fn default_tick_interval() -> u64 {
    600
}

fn default_reload_interval() -> u64 {
    300
}

fn default_sync_interval() -> u64 {
    86400
}

fn default_poll_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_port() -> u16 {
    9980
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            timeout: default_api_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            backup_interval: default_backup_interval(),
            tick_interval: default_tick_interval(),
            config_reload_interval: default_reload_interval(),
        }
    }
}

impl Default for RemoteSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: default_sync_interval(),
            poll_interval: default_poll_interval(),
            window: Schedule::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

impl DestinationConfig {
    /// Target dataset on the remote, falling back to the local path.
    pub fn target_dataset<'a>(&'a self, local_dataset: &'a str) -> &'a str {
        self.remote_dataset.as_deref().unwrap_or(local_dataset)
    }
}

impl DatasetConfig {
    pub fn enabled_destinations(&self) -> impl Iterator<Item = &DestinationConfig> {
        self.destinations.iter().filter(|d| d.enabled)
    }
}

impl Config {
    /// Load and validate a configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| BackupError::Config(e.to_string()))?;
        config.validate().map_err(BackupError::Config)?;
        Ok(config)
    }

    /// Structural validation beyond what serde enforces
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.server.backup_interval == 0 {
            return Err("server.backup_interval must be positive".to_string());
        }
        if self.server.tick_interval == 0 {
            return Err("server.tick_interval must be positive".to_string());
        }
        if self.server.config_reload_interval == 0 {
            return Err("server.config_reload_interval must be positive".to_string());
        }
        self.schedule.window.validate().map_err(|e| format!("schedule: {e}"))?;
        self.remote_sync
            .window
            .validate()
            .map_err(|e| format!("remote_sync: {e}"))?;
        if self.remote_sync.interval == 0 {
            return Err("remote_sync.interval must be positive".to_string());
        }
        if self.remote_sync.poll_interval == 0 {
            return Err("remote_sync.poll_interval must be positive".to_string());
        }

        let mut seen_datasets = std::collections::HashSet::new();
        for ds in &self.datasets {
            if ds.dataset.is_empty() {
                return Err("dataset path must not be empty".to_string());
            }
            if !seen_datasets.insert(&ds.dataset) {
                return Err(format!("duplicate dataset {:?}", ds.dataset));
            }
            let mut seen_hosts = std::collections::HashSet::new();
            for dest in &ds.destinations {
                if dest.remote_host.is_empty() {
                    return Err(format!(
                        "dataset {:?}: destination remote_host must not be empty",
                        ds.dataset
                    ));
                }
                if !seen_hosts.insert(&dest.remote_host) {
                    return Err(format!(
                        "dataset {:?}: duplicate destination {:?}",
                        ds.dataset, dest.remote_host
                    ));
                }
                if dest.sync_interval == Some(0) {
                    return Err(format!(
                        "dataset {:?}: sync_interval override must be positive",
                        ds.dataset
                    ));
                }
            }
        }
        Ok(())
    }

    /// Effective sync interval for one destination, in seconds.
    pub fn sync_interval_for(&self, dest: &DestinationConfig) -> u64 {
        dest.sync_interval.unwrap_or(self.remote_sync.interval)
    }

    /// Human-readable summary, printed by `--check-config` and logged at
    /// startup.
    pub fn summary(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "api url:           {}", self.api.url);
        let _ = writeln!(out, "backup interval:   {}s", self.server.backup_interval);
        let _ = writeln!(out, "tick interval:     {}s", self.server.tick_interval);
        let _ = writeln!(out, "schedule days:     {}", self.schedule.window.days);
        let _ = writeln!(out, "schedule hours:    {}", self.schedule.window.hours);
        let _ = writeln!(
            out,
            "retention:         frequent={} hourly={} daily={} weekly={} monthly={} yearly={}",
            self.retention.frequent,
            self.retention.hourly,
            self.retention.daily,
            self.retention.weekly,
            self.retention.monthly,
            self.retention.yearly
        );
        let _ = writeln!(
            out,
            "remote sync:       enabled={} interval={}s",
            self.remote_sync.enabled, self.remote_sync.interval
        );
        let _ = writeln!(out, "datasets:          {}", self.datasets.len());
        for ds in &self.datasets {
            let status = match (ds.enabled, ds.mode) {
                (false, _) => "disabled",
                (true, DatasetMode::Active) => "active",
                (true, DatasetMode::Passive) => "passive",
            };
            let _ = writeln!(out, "  {} [{}]", ds.dataset, status);
            for dest in &ds.destinations {
                let _ = writeln!(
                    out,
                    "    -> {}:{}{}",
                    dest.remote_host,
                    dest.target_dataset(&ds.dataset),
                    if dest.enabled { "" } else { " [disabled]" }
                );
            }
        }
        out
    }
}
