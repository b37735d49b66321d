//! In-memory SSH collaborators for exercising the pool without a network.
//!
//! The mock stack counts everything the real stack would do (sessions
//! created, channels opened, peak concurrency) and lets tests inject the
//! failures the pool is built to absorb: authentication failures, dead
//! connections and channel-open races.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use ferry::config::PoolSettings;
use ferry::error::PoolError;
use ferry::ssh::cache::CachingSessionPool;
use ferry::ssh::key::SessionKey;
use ferry::ssh::queue::QueueExecutor;
use ferry::ssh::remote::{Authenticator, CommandChannel, RemoteSession, SharedBuffer};
use ferry::ssh::task::{CompletionHandler, TaskOutcome};

/// Counters observed by assertions.
#[derive(Default)]
pub struct MockStats {
    pub sessions_created: AtomicUsize,
    pub sessions_disconnected: AtomicUsize,
    pub channels_opened: AtomicUsize,
    pub commands_started: AtomicUsize,
    pub running_channels: AtomicI32,
    pub max_running_channels: AtomicI32,
}

/// Failure injection knobs, consumed first-come-first-served.
#[derive(Default)]
pub struct MockBehavior {
    /// Fail this many session creations with an authentication error
    pub connect_failures: AtomicUsize,
    /// Fail this many channel opens with the transient open race
    pub open_races: AtomicUsize,
    /// Channels stay open for this many completion checks
    pub channel_hold_polls: AtomicUsize,
    /// Exit status reported by finished channels
    pub exit_status: AtomicU32,
}

/// Per-session connection flag, kept by the authenticator so tests can
/// kill live connections.
pub struct SessionState {
    pub serial: usize,
    pub connected: AtomicBool,
}

pub struct MockAuthenticator {
    pub stats: Arc<MockStats>,
    pub behavior: Arc<MockBehavior>,
    pub sessions: Mutex<Vec<Arc<SessionState>>>,
}

impl MockAuthenticator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            stats: Arc::new(MockStats::default()),
            behavior: Arc::new(MockBehavior::default()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    /// Mark every live session as dead, as if the server dropped us.
    pub fn drop_all_connections(&self) {
        for session in self.sessions.lock().iter() {
            session.connected.store(false, Ordering::SeqCst);
        }
    }
}

/// Decrement `counter` if positive; true when a unit was consumed.
fn consume(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
            if v > 0 { Some(v - 1) } else { None }
        })
        .is_ok()
}

impl Authenticator for MockAuthenticator {
    type Session = MockSession;

    async fn create_session(&self, _key: &SessionKey) -> Result<MockSession, PoolError> {
        if consume(&self.behavior.connect_failures) {
            return Err(PoolError::AuthenticationFailed(
                "injected failure".to_string(),
            ));
        }
        let serial = self.stats.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        let state = Arc::new(SessionState {
            serial,
            connected: AtomicBool::new(true),
        });
        self.sessions.lock().push(state.clone());
        Ok(MockSession {
            state,
            stats: self.stats.clone(),
            behavior: self.behavior.clone(),
        })
    }
}

pub struct MockSession {
    pub state: Arc<SessionState>,
    stats: Arc<MockStats>,
    behavior: Arc<MockBehavior>,
}

impl RemoteSession for MockSession {
    type Channel = MockChannel;

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<MockChannel, PoolError> {
        if !self.is_connected() {
            return Err(PoolError::Channel("session not connected".to_string()));
        }
        if consume(&self.behavior.open_races) {
            return Err(PoolError::ChannelOpenRace);
        }
        self.stats.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MockChannel {
            remaining_polls: AtomicUsize::new(self.behavior.channel_hold_polls.load(Ordering::SeqCst)),
            exit_status: self.behavior.exit_status.load(Ordering::SeqCst),
            started: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: self.stats.clone(),
        })
    }

    async fn disconnect(&self) -> Result<(), PoolError> {
        self.state.connected.store(false, Ordering::SeqCst);
        self.stats.sessions_disconnected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    remaining_polls: AtomicUsize,
    exit_status: u32,
    started: AtomicBool,
    running: AtomicBool,
    stats: Arc<MockStats>,
}

impl CommandChannel for MockChannel {
    async fn start(
        &mut self,
        command: &str,
        input: Vec<u8>,
        output: SharedBuffer,
        error: SharedBuffer,
    ) -> Result<(), PoolError> {
        self.started.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        self.stats.commands_started.fetch_add(1, Ordering::SeqCst);
        let running = self.stats.running_channels.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats
            .max_running_channels
            .fetch_max(running, Ordering::SeqCst);

        // Echo the command on stdout and the input on stderr so tests can
        // assert the stream plumbing end to end.
        output.lock().extend_from_slice(command.as_bytes());
        error.lock().extend_from_slice(&input);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            return false;
        }
        // Each completion check burns one hold unit.
        !consume(&self.remaining_polls)
    }

    fn exit_status(&self) -> Option<u32> {
        if self.started.load(Ordering::SeqCst) && self.remaining_polls.load(Ordering::SeqCst) == 0 {
            Some(self.exit_status)
        } else {
            None
        }
    }

    async fn disconnect(&mut self) -> Result<(), PoolError> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stats.running_channels.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Settings with short timers so grace periods and polls resolve quickly.
pub fn test_settings() -> PoolSettings {
    let mut settings = PoolSettings::default();
    settings.grace_period_millis = 40;
    settings.expiry_poll_millis = 10;
    settings.completion_poll_millis = 10;
    settings.admission_retry_millis = 10;
    settings.probe_command = None;
    settings
}

pub fn mock_pool(
    settings: &PoolSettings,
) -> (Arc<MockAuthenticator>, Arc<CachingSessionPool<MockAuthenticator>>) {
    let authenticator = MockAuthenticator::new();
    let pool = CachingSessionPool::new(authenticator.clone(), settings);
    (authenticator, pool)
}

pub fn mock_executor(
    settings: &PoolSettings,
) -> (
    Arc<MockAuthenticator>,
    Arc<CachingSessionPool<MockAuthenticator>>,
    Arc<QueueExecutor<MockAuthenticator>>,
) {
    let (authenticator, pool) = mock_pool(settings);
    let executor = QueueExecutor::new(pool.clone(), settings);
    (authenticator, pool, executor)
}

pub fn test_key() -> SessionKey {
    SessionKey::new("h1", 22, "u")
}

/// Completion handler that collects outcomes for later assertions.
pub fn capture_outcomes() -> (CompletionHandler, Arc<Mutex<Vec<TaskOutcome>>>) {
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    (
        Box::new(move |outcome| {
            sink.lock().push(outcome);
        }),
        outcomes,
    )
}

/// Poll `predicate` until it holds or `deadline_ms` elapses.
pub async fn wait_until(deadline_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
