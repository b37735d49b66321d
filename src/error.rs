use std::path::PathBuf;
use thiserror::Error;

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read settings file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write settings file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors surfaced by the session pool and execution layers
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Connection failed to {host}:{port}: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("Timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("Session pool capacity exceeded")]
    CapacityExceeded,

    #[error("Session pool is shut down")]
    PoolShutDown,

    #[error("Maximum number of channels per session exceeded")]
    ChannelLimitExceeded,

    #[error("Channel could not be opened on an established session")]
    ChannelOpenRace,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Task was cancelled")]
    Cancelled,
}

impl From<russh::Error> for PoolError {
    fn from(err: russh::Error) -> Self {
        match err {
            // The server accepted the connection but refused to open another
            // channel; its session budget is momentarily exhausted and a
            // retry against the same session is expected to succeed.
            russh::Error::ChannelOpenFailure(russh::ChannelOpenFailure::ResourceShortage) => {
                PoolError::ChannelOpenRace
            }
            other => PoolError::Channel(other.to_string()),
        }
    }
}
