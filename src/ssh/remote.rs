//! Collaborator traits between the pool and the underlying SSH client.
//!
//! The pool layers never touch wire details; they see sessions and
//! channels only through these traits. The production implementation
//! lives in [`super::client`]; tests plug in in-memory fakes.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::PoolError;

use super::key::SessionKey;

/// Byte sink shared between a running channel and the task observing it.
pub type SharedBuffer = Arc<Mutex<Vec<u8>>>;

pub fn shared_buffer() -> SharedBuffer {
    Arc::new(Mutex::new(Vec::new()))
}

/// Establishes authenticated sessions for a [`SessionKey`].
///
/// Performs credential or key based authentication and host fingerprint
/// verification; the pool only sees the finished session or the failure.
pub trait Authenticator: Send + Sync + 'static {
    type Session: RemoteSession;

    fn create_session(
        &self,
        key: &SessionKey,
    ) -> impl Future<Output = Result<Self::Session, PoolError>> + Send;
}

/// A live, authenticated connection able to open execution channels.
pub trait RemoteSession: Send + Sync + 'static {
    type Channel: CommandChannel;

    fn is_connected(&self) -> bool;

    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel, PoolError>> + Send;

    /// Tear the connection down. Callers treat this as best-effort and
    /// never propagate its errors; see [`best_effort`].
    fn disconnect(&self) -> impl Future<Output = Result<(), PoolError>> + Send;
}

/// One remote command execution on a session.
pub trait CommandChannel: Send + 'static {
    /// Bind the byte streams and start the command.
    fn start(
        &mut self,
        command: &str,
        input: Vec<u8>,
        output: SharedBuffer,
        error: SharedBuffer,
    ) -> impl Future<Output = Result<(), PoolError>> + Send;

    /// Non-blocking completion predicate, observed on a polling schedule.
    fn is_closed(&self) -> bool;

    /// The command's exit status, available once the channel has closed.
    fn exit_status(&self) -> Option<u32>;

    /// Best-effort teardown; see [`best_effort`].
    fn disconnect(&mut self) -> impl Future<Output = Result<(), PoolError>> + Send;
}

/// Run a cleanup future, logging a failure instead of propagating it.
/// Disconnects run on cleanup paths where an error has nowhere to go.
pub(crate) async fn best_effort<F>(context: &str, fut: F)
where
    F: Future<Output = Result<(), PoolError>>,
{
    if let Err(e) = fut.await {
        tracing::debug!("{context}: {e}");
    }
}
