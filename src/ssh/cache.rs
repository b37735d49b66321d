//! Caching layer over the raw session pool.
//!
//! Keeps at most one live session per [`SessionKey`] and shares it across
//! concurrent tasks through a reference count. A released session stays
//! warm for a grace period in case another task needs the same target,
//! then is handed back to the raw pool for destruction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::PoolSettings;
use crate::error::PoolError;
use crate::scheduler::{self, ScheduledAction};

use super::key::SessionKey;
use super::pool::{PooledSession, RawSessionPool};
use super::remote::{Authenticator, CommandChannel, RemoteSession, shared_buffer};

/// Atomically increment `count`, but only while it stays below `limit`.
/// Returns false without modifying the counter when the limit is reached.
fn increment_if_less_than(count: &AtomicI32, limit: i32) -> bool {
    let mut current = count.load(Ordering::SeqCst);
    loop {
        if current >= limit {
            return false;
        }
        match count.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return true,
            Err(actual) => current = actual,
        }
    }
}

struct SessionRecord<S> {
    session: PooledSession<S>,
    /// Tasks currently using the session, plus one reservation for a
    /// pending delayed-close check (see the release accounting below).
    ref_count: AtomicI32,
    last_used: Instant,
    /// Pending delayed-close action, held so it can be cancelled when the
    /// grace period needs to be extended.
    closer: Option<ScheduledAction>,
}

/// The key→session and session→record maps are always updated together;
/// they live in one aggregate behind one lock so their cross-references
/// cannot drift apart.
struct SessionMaps<S> {
    by_key: HashMap<SessionKey, u64>,
    records: HashMap<u64, SessionRecord<S>>,
}

pub struct CachingSessionPool<A: Authenticator> {
    self_ref: Weak<Self>,
    raw: RawSessionPool<A>,
    maps: Mutex<SessionMaps<A::Session>>,
    channels_per_session: i32,
    grace_period: Duration,
    expiry_poll_interval: Duration,
    probe_command: Option<String>,
}

impl<A: Authenticator> CachingSessionPool<A> {
    pub fn new(authenticator: Arc<A>, settings: &PoolSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            raw: RawSessionPool::new(
                authenticator,
                settings.max_sessions,
                settings.connect_timeout(),
            ),
            maps: Mutex::new(SessionMaps {
                by_key: HashMap::new(),
                records: HashMap::new(),
            }),
            channels_per_session: settings.channels_per_session as i32,
            grace_period: settings.grace_period(),
            expiry_poll_interval: settings.expiry_poll_interval(),
            probe_command: settings.probe_command.clone(),
        })
    }

    /// Return the cached session for `key`, or create a new one.
    ///
    /// A cached session is only handed out while its channel budget has
    /// room; past that the caller gets [`PoolError::ChannelLimitExceeded`]
    /// and is expected to retry rather than overload one session.
    pub async fn acquire(&self, key: &SessionKey) -> Result<PooledSession<A::Session>, PoolError> {
        let mut maps = self.maps.lock().await;
        tracing::trace!("cached sessions: {}", maps.by_key.len());

        if let Some(id) = maps.by_key.get(key).copied() {
            if self.validate_cached(&mut maps, id).await {
                if let Some(record) = maps.records.get_mut(&id) {
                    if !increment_if_less_than(&record.ref_count, self.channels_per_session) {
                        tracing::warn!(
                            "maximum number of channels per session exceeded for {}@{}:{}",
                            key.user(),
                            key.host(),
                            key.port()
                        );
                        return Err(PoolError::ChannelLimitExceeded);
                    }
                    record.last_used = Instant::now();
                    tracing::debug!(
                        "reusing cached session {} (refcount={})",
                        id,
                        record.ref_count.load(Ordering::SeqCst)
                    );
                    return Ok(record.session.clone());
                }
            }
        }

        // No valid cached session - create a new one.
        let pooled = self.raw.acquire(key).await?;
        maps.records.insert(
            pooled.id(),
            SessionRecord {
                session: pooled.clone(),
                ref_count: AtomicI32::new(1),
                last_used: Instant::now(),
                closer: None,
            },
        );
        maps.by_key.insert(key.clone(), pooled.id());
        Ok(pooled)
    }

    /// Hand a session back after a task is done with it.
    ///
    /// The session is not torn down right away; a delayed-close check
    /// keeps it warm for the grace period. Each release's ref-count
    /// decrement is carried by the close check it schedules: cancelling a
    /// pending check performs that deferred decrement immediately, and a
    /// check that fires and decides to close performs its own.
    pub async fn release(&self, session: &PooledSession<A::Session>) {
        let mut maps = self.maps.lock().await;

        let Some(record) = maps.records.get_mut(&session.id()) else {
            // Not ours anymore (evicted or shut down); just destroy it.
            self.raw.release(session.clone()).await;
            return;
        };
        record.last_used = Instant::now();

        if let Some(closer) = record.closer.take() {
            if closer.cancel() {
                let current = record.ref_count.fetch_sub(1, Ordering::SeqCst) - 1;
                tracing::trace!(
                    "cancelled pending closer for session {} (refcount={})",
                    session.id(),
                    current
                );
            }
        }

        if !session.session().is_connected() {
            // Already dead, no point keeping it warm.
            tracing::debug!("released session {} already disconnected", session.id());
            record.ref_count.fetch_sub(1, Ordering::SeqCst);
            self.close_record(&mut maps, session.id()).await;
        } else {
            self.schedule_close_check(&mut maps, session.id());
        }
    }

    /// Cancel every pending close check, shut the raw pool down and drop
    /// all cache state.
    pub async fn shutdown(&self) {
        let mut maps = self.maps.lock().await;
        for record in maps.records.values_mut() {
            if let Some(closer) = record.closer.take() {
                closer.cancel();
            }
        }
        self.raw.shutdown().await;
        maps.records.clear();
        maps.by_key.clear();
    }

    /// Channels currently claimed on the cached session for `key`.
    pub async fn active_channels(&self, key: &SessionKey) -> i32 {
        let maps = self.maps.lock().await;
        maps.by_key
            .get(key)
            .and_then(|id| maps.records.get(id))
            .map(|record| record.ref_count.load(Ordering::SeqCst).max(0))
            .unwrap_or(0)
    }

    /// Live sessions in the underlying raw pool.
    pub fn live_sessions(&self) -> i64 {
        self.raw.active_sessions()
    }

    /// Check that a cached session is still usable: it must report
    /// connected and survive a cheap probe command. An invalid session is
    /// purged so a fresh one can take its place.
    async fn validate_cached(&self, maps: &mut SessionMaps<A::Session>, id: u64) -> bool {
        let Some(record) = maps.records.get(&id) else {
            return false;
        };
        let session = record.session.clone();

        if session.session().is_connected() {
            match self.run_probe(session.session()).await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::info!("validation probe failed on session {}: {}", id, e);
                }
            }
        } else {
            tracing::debug!("cached session {} is no longer connected", id);
        }

        // The dead entry must stop shadowing the key even while old tasks
        // still hold references to it.
        if maps.by_key.get(session.key()) == Some(&id) {
            maps.by_key.remove(session.key());
        }
        self.close_record(maps, id).await;
        false
    }

    async fn run_probe(&self, session: &A::Session) -> Result<(), PoolError> {
        let Some(command) = &self.probe_command else {
            return Ok(());
        };
        tracing::trace!("running session probe: {command}");
        let mut channel = session.open_channel().await?;
        let started = channel
            .start(command, Vec::new(), shared_buffer(), shared_buffer())
            .await;
        let closed = channel.disconnect().await;
        started.and(closed)
    }

    fn schedule_close_check(&self, maps: &mut SessionMaps<A::Session>, id: u64) {
        let Some(record) = maps.records.get_mut(&id) else {
            return;
        };
        let Some(pool) = self.self_ref.upgrade() else {
            return;
        };
        record.closer = Some(scheduler::schedule(self.expiry_poll_interval, async move {
            pool.close_if_expired(id).await;
        }));
    }

    /// Delayed-close check: close a session that died or sat idle past
    /// the grace period, otherwise look again after the poll interval.
    async fn close_if_expired(self: Arc<Self>, id: u64) {
        let mut maps = self.maps.lock().await;
        let Some(record) = maps.records.get_mut(&id) else {
            return;
        };

        let expired = record.last_used.elapsed() >= self.grace_period;
        if expired || !record.session.session().is_connected() {
            // This check carries the deferred decrement of the release
            // that scheduled it.
            record.ref_count.fetch_sub(1, Ordering::SeqCst);
            self.close_record(&mut maps, id).await;
        } else {
            self.schedule_close_check(&mut maps, id);
        }
    }

    /// Remove the record from both maps and destroy its session, unless
    /// it is still in use.
    async fn close_record(&self, maps: &mut SessionMaps<A::Session>, id: u64) {
        let Some(record) = maps.records.get(&id) else {
            return;
        };
        let current = record.ref_count.load(Ordering::SeqCst);
        if current > 0 {
            tracing::trace!(
                "session {} still in use (refcount={}), not closing",
                id,
                current
            );
            return;
        }

        if let Some(record) = maps.records.remove(&id) {
            if let Some(closer) = record.closer {
                closer.cancel();
            }
            if maps.by_key.get(record.session.key()) == Some(&id) {
                maps.by_key.remove(record.session.key());
            }
            self.raw.release(record.session).await;
        }
    }
}
