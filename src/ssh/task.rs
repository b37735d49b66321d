//! A single remote command execution bound to a pooled session.
//!
//! The task acquires a session, opens an execution channel, then observes
//! the channel with scheduled completion checks instead of blocking a
//! worker. Whatever way the task ends - success, failure or cancellation -
//! the session is released exactly once and the completion handler fires
//! exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::PoolError;
use crate::scheduler::{self, ScheduledAction};

use super::cache::CachingSessionPool;
use super::key::SessionKey;
use super::pool::PooledSession;
use super::remote::{
    Authenticator, CommandChannel, RemoteSession, SharedBuffer, best_effort, shared_buffer,
};

/// What a finished task looked like, delivered to the completion handler.
#[derive(Debug)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    /// Exit status of the remote command; `None` when the command never
    /// ran to completion (failure or cancellation).
    pub exit_status: Option<u32>,
    pub failure: Option<PoolError>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub type CompletionHandler = Box<dyn FnOnce(TaskOutcome) + Send + 'static>;

type SessionOf<A> = <A as Authenticator>::Session;
type ChannelOf<A> = <SessionOf<A> as RemoteSession>::Channel;

pub struct ExecTask<A: Authenticator> {
    id: Uuid,
    command: String,
    input: Mutex<Option<Vec<u8>>>,
    output: SharedBuffer,
    error: SharedBuffer,
    completion: Mutex<Option<CompletionHandler>>,
    channel: Mutex<Option<ChannelOf<A>>>,
    session: Mutex<Option<PooledSession<SessionOf<A>>>>,
    sessions: Mutex<Option<Arc<CachingSessionPool<A>>>>,
    pending_poll: Mutex<Option<ScheduledAction>>,
    cancelled: AtomicBool,
    finalized: AtomicBool,
    failures: AtomicU32,
    exit_status: Mutex<Option<u32>>,
    poll_interval: Duration,
    open_retry_limit: u32,
}

impl<A: Authenticator> ExecTask<A> {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            input: Mutex::new(None),
            output: shared_buffer(),
            error: shared_buffer(),
            completion: Mutex::new(None),
            channel: Mutex::new(None),
            session: Mutex::new(None),
            sessions: Mutex::new(None),
            pending_poll: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            failures: AtomicU32::new(0),
            exit_status: Mutex::new(None),
            poll_interval: Duration::from_millis(500),
            open_retry_limit: 3,
        }
    }

    /// Bytes to feed the remote command on stdin.
    pub fn with_input(self, input: Vec<u8>) -> Self {
        *self.input.lock() = Some(input);
        self
    }

    pub fn with_completion(self, handler: CompletionHandler) -> Self {
        *self.completion.lock() = Some(handler);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_open_retry_limit(mut self, limit: u32) -> Self {
        self.open_retry_limit = limit;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Exit status of the remote command, valid only after completion.
    pub fn exit_status(&self) -> Option<u32> {
        *self.exit_status.lock()
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub(crate) fn take_completion(&self) -> Option<CompletionHandler> {
        self.completion.lock().take()
    }

    pub(crate) fn set_completion(&self, handler: CompletionHandler) {
        *self.completion.lock() = Some(handler);
    }

    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Finalize with a failure delivered through the completion handler.
    pub(crate) async fn fail(&self, failure: PoolError) {
        self.finalize(Some(failure)).await;
    }

    /// Deliver a cancellation outcome through whatever handler is
    /// installed, for a task whose finalization raced past it.
    pub(crate) fn deliver_cancelled(&self) {
        self.fire_completion(Some(PoolError::Cancelled));
    }

    /// Acquire a session for `key`, open an execution channel on it and
    /// start completion polling.
    ///
    /// Returns `Err` only for [`PoolError::ChannelLimitExceeded`], before
    /// any callback or stream binding, so the submitter can retry the task
    /// against a different admission slot. Every other failure is
    /// delivered through the completion handler.
    pub async fn run(
        self: Arc<Self>,
        key: &SessionKey,
        sessions: &Arc<CachingSessionPool<A>>,
    ) -> Result<(), PoolError> {
        if self.cancelled.load(Ordering::SeqCst) || self.finalized.load(Ordering::SeqCst) {
            // Finalized before dispatch (cancelled while queued). Fire
            // whatever handler is installed now so the submitter's
            // bookkeeping still runs.
            self.fire_completion(Some(PoolError::Cancelled));
            return Ok(());
        }

        {
            let mut input = self.input.lock();
            if input.is_none() {
                *input = Some(Vec::new());
            }
        }
        *self.sessions.lock() = Some(sessions.clone());

        loop {
            let pooled = match sessions.acquire(key).await {
                Ok(session) => session,
                Err(PoolError::ChannelLimitExceeded) => {
                    return Err(PoolError::ChannelLimitExceeded);
                }
                Err(e) => {
                    self.finalize(Some(e)).await;
                    return Ok(());
                }
            };
            *self.session.lock() = Some(pooled.clone());

            match self.start_channel(&pooled).await {
                Ok(()) => {
                    self.clone().schedule_poll();
                    return Ok(());
                }
                Err(PoolError::ChannelOpenRace) => {
                    // The session accepted us but could not open a channel
                    // yet; let it go and take it from the top.
                    *self.session.lock() = None;
                    sessions.release(&pooled).await;

                    let failures = self.record_failure();
                    if failures > self.open_retry_limit {
                        tracing::warn!("task {}: channel open retries exhausted", self.id);
                        self.finalize(Some(PoolError::ChannelOpenRace)).await;
                        return Ok(());
                    }
                    tracing::debug!(
                        "task {}: channel not ready yet, retrying ({}/{})",
                        self.id,
                        failures,
                        self.open_retry_limit
                    );
                }
                Err(e) => {
                    self.finalize(Some(e)).await;
                    return Ok(());
                }
            }
        }
    }

    /// Best-effort cancellation. A completion check already in flight may
    /// still finish normally; both paths converge on one finalization.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(poll) = self.pending_poll.lock().take() {
            poll.cancel();
        }
        self.finalize(Some(PoolError::Cancelled)).await;
    }

    async fn start_channel(
        &self,
        pooled: &PooledSession<SessionOf<A>>,
    ) -> Result<(), PoolError> {
        let mut channel = pooled.session().open_channel().await?;
        let input = self.input.lock().take().unwrap_or_default();
        channel
            .start(&self.command, input, self.output.clone(), self.error.clone())
            .await?;
        *self.channel.lock() = Some(channel);
        Ok(())
    }

    fn schedule_poll(self: Arc<Self>) {
        let task = self.clone();
        let handle = scheduler::schedule(self.poll_interval, async move {
            task.poll_completion().await;
        });
        *self.pending_poll.lock() = Some(handle);
    }

    async fn poll_completion(self: Arc<Self>) {
        if self.cancelled.load(Ordering::SeqCst) {
            // Cancellation already finalized; stop silently.
            return;
        }
        let closed = self
            .channel
            .lock()
            .as_ref()
            .map_or(true, |channel| channel.is_closed());
        if closed {
            self.finalize(None).await;
        } else {
            self.clone().schedule_poll();
        }
    }

    /// Tear the task down: record the exit status, disconnect the channel,
    /// release the session and deliver the outcome. Guarded so that racing
    /// callers (a poll tick and `cancel`, say) finalize at most once.
    async fn finalize(&self, failure: Option<PoolError>) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(poll) = self.pending_poll.lock().take() {
            poll.cancel();
        }

        let channel = self.channel.lock().take();
        if let Some(mut channel) = channel {
            if failure.is_none() {
                *self.exit_status.lock() = channel.exit_status();
            }
            best_effort("channel disconnect", channel.disconnect()).await;
        }

        let session = self.session.lock().take();
        let sessions = self.sessions.lock().take();
        if let (Some(session), Some(sessions)) = (session, sessions) {
            sessions.release(&session).await;
        }

        self.fire_completion(failure);
    }

    fn fire_completion(&self, failure: Option<PoolError>) {
        let Some(handler) = self.completion.lock().take() else {
            return;
        };
        let outcome = TaskOutcome {
            task_id: self.id,
            exit_status: *self.exit_status.lock(),
            failure,
            stdout: self.output.lock().clone(),
            stderr: self.error.lock().clone(),
        };
        handler(outcome);
    }
}

impl<A: Authenticator> std::fmt::Debug for ExecTask<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecTask")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("finalized", &self.finalized.load(Ordering::SeqCst))
            .field("failures", &self.failures.load(Ordering::SeqCst))
            .finish()
    }
}
