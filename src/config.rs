use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u64 {
    60
}

fn default_max_sessions() -> u32 {
    8
}

fn default_channels_per_session() -> u32 {
    8
}

fn default_tasks_per_host() -> u32 {
    8
}

fn default_grace_millis() -> u64 {
    30_000
}

fn default_expiry_poll_millis() -> u64 {
    200
}

fn default_completion_poll_millis() -> u64 {
    500
}

fn default_admission_retry_millis() -> u64 {
    500
}

fn default_probe_command() -> Option<String> {
    Some("true".to_string())
}

fn default_open_retry_limit() -> u32 {
    3
}

fn default_resubmit_limit() -> u32 {
    3
}

/// Tunables for the session pool, the execution tasks and the per-host
/// queue. Loadable from a TOML file; every field falls back to its
/// default when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Bound on session establishment, the only blocking wait in the pool
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// SSH keepalive interval; 0 disables keepalives
    #[serde(default = "default_keepalive")]
    pub keepalive_interval_secs: u64,

    /// Hard cap on live sessions across all hosts
    #[serde(default = "default_max_sessions")]
    pub max_sessions: u32,

    /// Cap on concurrent channels multiplexed over one cached session.
    /// Should not exceed the MaxSessions limit of the remote sshd.
    #[serde(default = "default_channels_per_session")]
    pub channels_per_session: u32,

    /// Cap on concurrently running tasks per session key
    #[serde(default = "default_tasks_per_host")]
    pub tasks_per_host: u32,

    /// How long an idle session is kept warm after its last user released it
    #[serde(default = "default_grace_millis")]
    pub grace_period_millis: u64,

    /// Interval between expiry checks on an idle cached session
    #[serde(default = "default_expiry_poll_millis")]
    pub expiry_poll_millis: u64,

    /// Interval between completion checks on a running command
    #[serde(default = "default_completion_poll_millis")]
    pub completion_poll_millis: u64,

    /// Interval before re-checking admission when a host is at its task cap
    #[serde(default = "default_admission_retry_millis")]
    pub admission_retry_millis: u64,

    /// Cheap command run to validate a cached session before reuse;
    /// `None` skips the probe
    #[serde(default = "default_probe_command")]
    pub probe_command: Option<String>,

    /// Retries when a channel cannot be opened on a freshly accepted session
    #[serde(default = "default_open_retry_limit")]
    pub open_retry_limit: u32,

    /// Resubmissions when the cached session for a key is out of channels
    #[serde(default = "default_resubmit_limit")]
    pub resubmit_limit: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive(),
            max_sessions: default_max_sessions(),
            channels_per_session: default_channels_per_session(),
            tasks_per_host: default_tasks_per_host(),
            grace_period_millis: default_grace_millis(),
            expiry_poll_millis: default_expiry_poll_millis(),
            completion_poll_millis: default_completion_poll_millis(),
            admission_retry_millis: default_admission_retry_millis(),
            probe_command: default_probe_command(),
            open_retry_limit: default_open_retry_limit(),
            resubmit_limit: default_resubmit_limit(),
        }
    }
}

impl PoolSettings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save settings to a TOML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content).map_err(|e| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_millis)
    }

    pub fn expiry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_poll_millis)
    }

    pub fn completion_poll_interval(&self) -> Duration {
        Duration::from_millis(self.completion_poll_millis)
    }

    pub fn admission_retry_interval(&self) -> Duration {
        Duration::from_millis(self.admission_retry_millis)
    }
}
