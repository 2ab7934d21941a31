use crate::error::{PrismError, PrismResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration, usually read from `prism.toml`.
///
/// Every section and field has a default, so an empty or partial file is
/// accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrismConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub status: StatusConfig,
}

impl PrismConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(raw: &str) -> PrismResult<Self> {
        let config: PrismConfig =
            toml::from_str(raw).map_err(|e| PrismError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the configuration at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> PrismResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PrismError::Config(format!("Failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> PrismResult<()> {
        if self.scheduler.max_concurrency == 0 {
            return Err(PrismError::Config(
                "scheduler.max_concurrency must be at least 1".into(),
            ));
        }
        if self.server.max_port_attempts == 0 {
            return Err(PrismError::Config(
                "server.max_port_attempts must be at least 1".into(),
            ));
        }
        if self.server.rate_limit_max == 0 || self.server.rate_limit_window_ms == 0 {
            return Err(PrismError::Config(
                "server.rate_limit_max and server.rate_limit_window_ms must be positive".into(),
            ));
        }
        if let Some(cpu) = self.scheduler.cpu_budget {
            if cpu <= 0.0 {
                return Err(PrismError::Config(
                    "scheduler.cpu_budget must be positive".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Broadcast layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Consecutive ports tried when the configured one is taken.
    #[serde(default = "default_max_port_attempts")]
    pub max_port_attempts: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,
    /// Envelopes replayed to a newly connected client.
    #[serde(default = "default_replay_on_connect")]
    pub replay_on_connect: usize,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Inbound client messages allowed per window.
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,
    #[serde(default = "default_rate_limit_window_ms")]
    pub rate_limit_window_ms: u64,
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_port_attempts: default_max_port_attempts(),
            max_connections: default_max_connections(),
            replay_capacity: default_replay_capacity(),
            replay_on_connect: default_replay_on_connect(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_ms: default_rate_limit_window_ms(),
        }
    }
}

/// Scheduler budget and task defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Concurrency slots in the resource pool.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Memory units available to running tasks. Unlimited when absent.
    #[serde(default)]
    pub memory_budget: Option<u64>,
    /// CPU fraction available to running tasks (e.g. `2.0` = two cores).
    #[serde(default)]
    pub cpu_budget: Option<f64>,
    /// Number of network-bound tasks allowed at once.
    #[serde(default)]
    pub network_budget: Option<usize>,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    /// Queue time after which a waiting task is reported as stalled.
    #[serde(default = "default_stall_warning_ms")]
    pub stall_warning_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl SchedulerConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stall_warning(&self) -> Duration {
        Duration::from_millis(self.stall_warning_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            memory_budget: None,
            cpu_budget: None,
            network_budget: None,
            default_timeout_ms: default_timeout_ms(),
            default_retries: default_retries(),
            stall_warning_ms: default_stall_warning_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Status aggregator and persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_persist_enabled")]
    pub persist_enabled: bool,
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
    /// Entries kept in the in-memory operation history.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Most recent history entries written with each snapshot.
    #[serde(default = "default_history_persisted")]
    pub history_persisted: usize,
}

impl StatusConfig {
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    /// Location of the persisted snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("status.json")
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            persist_enabled: default_persist_enabled(),
            persist_interval_ms: default_persist_interval_ms(),
            history_capacity: default_history_capacity(),
            history_persisted: default_history_persisted(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3001
}
fn default_max_port_attempts() -> u16 {
    5
}
fn default_max_connections() -> usize {
    100
}
fn default_replay_capacity() -> usize {
    100
}
fn default_replay_on_connect() -> usize {
    10
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_rate_limit_max() -> usize {
    50
}
fn default_rate_limit_window_ms() -> u64 {
    1_000
}
fn default_max_concurrency() -> usize {
    4
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_retries() -> u32 {
    1
}
fn default_stall_warning_ms() -> u64 {
    60_000
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./.prism")
}
fn default_persist_enabled() -> bool {
    true
}
fn default_persist_interval_ms() -> u64 {
    30_000
}
fn default_history_capacity() -> usize {
    100
}
fn default_history_persisted() -> usize {
    20
}
