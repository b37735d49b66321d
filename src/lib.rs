//! Ferry - pooled SSH command execution
//!
//! Runs commands on remote hosts over a shared pool of authenticated SSH
//! sessions, with per-host admission control and bounded retries for the
//! transient failures that show up when many tasks hit one target.

pub mod config;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod ssh;

pub use config::PoolSettings;
pub use error::{ConfigError, PoolError};
pub use ssh::{
    CachingSessionPool, ExecTask, QueueExecutor, RusshAuthenticator, SessionKey, TaskOutcome,
};
