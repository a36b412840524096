use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}
fn default_resync_interval_secs() -> u64 {
    300
}
fn default_restart_threshold() -> usize {
    3
}
fn default_restart_window_secs() -> u64 {
    300
}
fn default_sink_retry_max() -> u32 {
    5
}
fn default_removed_grace_period_secs() -> u64 {
    600
}
fn default_startup_retry_max() -> u32 {
    5
}
fn default_queue_capacity() -> usize {
    256
}
fn default_shutdown_flush_timeout_secs() -> u64 {
    10
}
fn default_stats_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    #[serde(default = "default_restart_threshold")]
    pub restart_threshold: usize,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    #[serde(default = "default_sink_retry_max")]
    pub sink_retry_max: u32,
    #[serde(default = "default_removed_grace_period_secs")]
    pub removed_grace_period_secs: u64,
    #[serde(default = "default_startup_retry_max")]
    pub startup_retry_max: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_shutdown_flush_timeout_secs")]
    pub shutdown_flush_timeout_secs: u64,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Enables the JSON file sink when set; otherwise verdicts go through
    /// the process logger.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl MonitorConfig {
    pub fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    /// Load the config file named on the command line. A missing file means
    /// defaults; the CLI output directory wins over the file's.
    pub fn try_init() -> Result<Self, ConfigError> {
        let args = crate::cli::get_cli_args();
        let mut config = match std::fs::read_to_string(&args.config) {
            Ok(raw) => Self::try_init_from_string(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {:?}, using defaults", args.config);
                Self::try_init_from_string("")?
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(output_dir) = &args.output_dir {
            config.output_dir = Some(output_dir.clone());
        }
        Ok(config)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
    pub fn removed_grace_period(&self) -> Duration {
        Duration::from_secs(self.removed_grace_period_secs)
    }
    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_flush_timeout_secs)
    }
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
