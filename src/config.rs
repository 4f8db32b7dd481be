use serde::{Deserialize, Serialize};
use std::time::Duration;

/// CAS and checkpoint tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CasConfig {
    pub compression_level: i32,
}

impl Default for CasConfig {
    fn default() -> Self {
        Self {
            compression_level: 3,
        }
    }
}

/// Registry/tracker/validator/monitor/cleaner tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub tracker_sample_interval_secs: u64,
    pub stale_threshold_secs: u64,
    pub cpu_threshold_percent: f64,
    pub memory_threshold_mb: f64,
    pub zombie_threshold_secs: u64,
    pub open_files_threshold: u64,
    pub connections_threshold: u64,
    pub threads_threshold: u64,
    pub monitor_sample_interval_secs: u64,
    pub monitor_history_size: usize,
    pub cleaner_interval_secs: u64,
    pub stale_process_hours: i64,
    pub history_retention_days: i64,
    pub message_retention_hours: i64,
    pub zombie_grace_minutes: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tracker_sample_interval_secs: 30,
            stale_threshold_secs: 300,
            cpu_threshold_percent: 90.0,
            memory_threshold_mb: 4096.0,
            zombie_threshold_secs: 600,
            open_files_threshold: 1000,
            connections_threshold: 100,
            threads_threshold: 100,
            monitor_sample_interval_secs: 5,
            monitor_history_size: 180,
            cleaner_interval_secs: 3600,
            stale_process_hours: 24,
            history_retention_days: 30,
            message_retention_hours: 24,
            zombie_grace_minutes: 10,
        }
    }
}

impl RegistryConfig {
    pub fn tracker_sample_interval(&self) -> Duration {
        Duration::from_secs(self.tracker_sample_interval_secs)
    }

    pub fn monitor_sample_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_sample_interval_secs)
    }

    pub fn cleaner_interval(&self) -> Duration {
        Duration::from_secs(self.cleaner_interval_secs)
    }
}

/// Hook engine/sandbox tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub max_concurrent_executions: usize,
    pub execution_history_size: usize,
    pub default_retry_count: u32,
    pub default_retry_delay_secs: u64,
    pub reload_poll_interval_secs: u64,
    pub sandbox_max_memory_bytes: u64,
    pub sandbox_max_cpu_time_secs: u64,
    pub sandbox_max_file_size_bytes: u64,
    pub sandbox_max_processes: u64,
    pub sandbox_max_open_files: u64,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: 10,
            execution_history_size: 1000,
            default_retry_count: 0,
            default_retry_delay_secs: 1,
            reload_poll_interval_secs: 5,
            sandbox_max_memory_bytes: 512 * 1024 * 1024,
            sandbox_max_cpu_time_secs: 60,
            sandbox_max_file_size_bytes: 100 * 1024 * 1024,
            sandbox_max_processes: 10,
            sandbox_max_open_files: 100,
        }
    }
}

/// Top-level configuration for a `ShannonCore` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cas: CasConfig,
    pub registry: RegistryConfig,
    pub hooks: HookConfig,
    /// Seconds to wait for background loops to stop cleanly before aborting them.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_shutdown_grace() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cas: CasConfig::default(),
            registry: RegistryConfig::default(),
            hooks: HookConfig::default(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        Ok(cfg)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
