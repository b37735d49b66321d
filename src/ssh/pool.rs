//! Bounded, non-reusing session pool.
//!
//! Creates a fresh session per acquire and destroys it on release; the
//! only policy here is the hard cap on live sessions. Reuse is layered on
//! top by [`super::cache::CachingSessionPool`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::PoolError;

use super::key::SessionKey;
use super::remote::{Authenticator, RemoteSession, best_effort};

/// Sentinel stored in the active count once the pool has shut down;
/// every subsequent acquire fails fast.
const POISONED: i64 = i64::MIN;

/// A session handed out by the pool, tagged with a pool-assigned id.
///
/// The id is the session's identity for all bookkeeping maps; the inner
/// session is shared so clones stay cheap.
pub struct PooledSession<S> {
    id: u64,
    key: SessionKey,
    inner: Arc<S>,
}

impl<S> Clone for PooledSession<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            key: self.key.clone(),
            inner: self.inner.clone(),
        }
    }
}

impl<S> PooledSession<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn session(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for PooledSession<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("id", &self.id)
            .field("host", &self.key.host())
            .field("port", &self.key.port())
            .finish()
    }
}

pub struct RawSessionPool<A: Authenticator> {
    authenticator: Arc<A>,
    max_sessions: i64,
    connect_timeout: Duration,
    active_count: AtomicI64,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, PooledSession<A::Session>>>,
}

impl<A: Authenticator> RawSessionPool<A> {
    pub fn new(authenticator: Arc<A>, max_sessions: u32, connect_timeout: Duration) -> Self {
        Self {
            authenticator,
            max_sessions: i64::from(max_sessions),
            connect_timeout,
            active_count: AtomicI64::new(0),
            next_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Create a new authenticated session, or fail with
    /// [`PoolError::CapacityExceeded`] when the pool is full.
    pub async fn acquire(
        &self,
        key: &SessionKey,
    ) -> Result<PooledSession<A::Session>, PoolError> {
        self.try_reserve()?;

        let created = tokio::time::timeout(
            self.connect_timeout,
            self.authenticator.create_session(key),
        )
        .await;

        let session = match created {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.release_reservation();
                return Err(e);
            }
            Err(_) => {
                self.release_reservation();
                return Err(PoolError::ConnectTimeout(format!(
                    "{}:{}",
                    key.host(),
                    key.port()
                )));
            }
        };

        let pooled = PooledSession {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            key: key.clone(),
            inner: Arc::new(session),
        };

        // Shutdown may have raced in while we were connecting.
        if self.active_count.load(Ordering::SeqCst) == POISONED {
            best_effort(
                "disconnecting session created during shutdown",
                pooled.session().disconnect(),
            )
            .await;
            return Err(PoolError::PoolShutDown);
        }

        self.active.lock().await.insert(pooled.id, pooled.clone());
        tracing::debug!(
            "created session {} for {}@{}:{}",
            pooled.id,
            key.user(),
            key.host(),
            key.port()
        );
        Ok(pooled)
    }

    /// Destroy a session. Disconnect failures are logged, never raised.
    pub async fn release(&self, session: PooledSession<A::Session>) {
        let tracked = self.active.lock().await.remove(&session.id()).is_some();
        best_effort("session disconnect", session.session().disconnect()).await;
        if tracked {
            self.release_reservation();
        }
        tracing::debug!("destroyed session {}", session.id());
    }

    /// Poison the pool and disconnect every live session.
    pub async fn shutdown(&self) {
        let previous = self.active_count.swap(POISONED, Ordering::SeqCst);
        if previous == POISONED {
            return;
        }

        let drained: Vec<_> = self
            .active
            .lock()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();
        tracing::debug!("shutting down session pool ({} live)", drained.len());
        for session in drained {
            best_effort("shutdown disconnect", session.session().disconnect()).await;
        }
    }

    /// Number of live sessions; 0 after shutdown.
    pub fn active_sessions(&self) -> i64 {
        self.active_count.load(Ordering::SeqCst).max(0)
    }

    fn try_reserve(&self) -> Result<(), PoolError> {
        let mut current = self.active_count.load(Ordering::SeqCst);
        loop {
            if current == POISONED {
                return Err(PoolError::PoolShutDown);
            }
            if current >= self.max_sessions {
                return Err(PoolError::CapacityExceeded);
            }
            match self.active_count.compare_exchange(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn release_reservation(&self) {
        // Leave the poison sentinel in place once shutdown has happened.
        let _ = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v == POISONED { None } else { Some(v - 1) }
            });
    }
}
