//! Core robot configuration, read once at startup from a YAML
//! document. Per-task configuration documents live next to it under
//! `plugins/` and `jobs/` and are handled by the registry loader.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::tasks::ScheduledTask;

/// Declaration of an externally-implemented task: name, kind, and the
/// executable to invoke. Relative paths are resolved against the
/// install path first, then the config path.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalTask {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub task_type: String,
    #[serde(rename = "Path", default)]
    pub path: String,
    #[serde(rename = "NameSpace", default)]
    pub namespace: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct BrainConfig {
    /// "sqlite" or "memory".
    #[serde(rename = "Provider", default)]
    pub provider: String,
    #[serde(rename = "File", default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    #[serde(rename = "Name", default = "default_name")]
    pub name: String,
    /// Single-character shorthand for addressing the robot.
    #[serde(rename = "Alias", default)]
    pub alias: String,
    #[serde(rename = "AdminUsers", default)]
    pub admin_users: Vec<String>,
    /// Users never listened to, like other robots.
    #[serde(rename = "IgnoreUsers", default)]
    pub ignore_users: Vec<String>,
    #[serde(rename = "JoinChannels", default)]
    pub join_channels: Vec<String>,
    /// Channels where plugins are active when they configure none.
    #[serde(rename = "DefaultChannels", default)]
    pub default_channels: Vec<String>,
    #[serde(rename = "DefaultAllowDirect", default = "default_true")]
    pub default_allow_direct: bool,
    #[serde(rename = "TimeZone", default)]
    pub time_zone: String,
    #[serde(rename = "Brain", default)]
    pub brain: BrainConfig,
    /// Localhost port for the plugin RPC bridge.
    #[serde(rename = "LocalPort", default = "default_port")]
    pub local_port: u16,
    #[serde(rename = "InstallPath", default)]
    pub install_path: PathBuf,
    #[serde(rename = "ConfigPath", default)]
    pub config_path: PathBuf,
    #[serde(rename = "ExternalTasks", default)]
    pub external_tasks: Vec<ExternalTask>,
    #[serde(rename = "ScheduledJobs", default)]
    pub scheduled_jobs: Vec<ScheduledTask>,
}

fn default_name() -> String {
    "cogbot".to_string()
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    8880
}

impl Default for BotConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty config must deserialize")
    }
}

impl BotConfig {
    /// Load and parse the core configuration. A malformed core
    /// document is fatal: the process must not start in an
    /// inconsistent state.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading core configuration {:?}", path.as_ref()))?;
        let cfg: BotConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing core configuration {:?}", path.as_ref()))?;
        Ok(cfg)
    }

    pub fn alias_char(&self) -> Option<char> {
        self.alias.chars().next()
    }

    /// The IANA time zone for cron scheduling: the configured
    /// `TimeZone` when it parses, the host's zone otherwise. `None`
    /// (UTC) only when even the host zone can't be determined.
    pub fn timezone(&self) -> Option<chrono_tz::Tz> {
        if !self.time_zone.is_empty() {
            match self.time_zone.parse::<chrono_tz::Tz>() {
                Ok(tz) => return Some(tz),
                Err(_) => warn!(
                    "unrecognized TimeZone '{}', using the host's zone",
                    self.time_zone
                ),
            }
        }
        match iana_time_zone::get_timezone()
            .ok()
            .and_then(|name| name.parse::<chrono_tz::Tz>().ok())
        {
            Some(tz) => Some(tz),
            None => {
                warn!("couldn't determine the host time zone, scheduling in UTC");
                None
            }
        }
    }
}
