//! Delayed actions on the tokio runtime with cancelable handles.
//!
//! All polling in this crate (session expiry checks, command completion
//! checks, admission backoff) is driven by rescheduling a future after a
//! delay rather than blocking a worker.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Handle to an action scheduled with [`schedule`].
///
/// Dropping the handle does not cancel the action; it keeps running
/// detached, like a fired-and-forgotten timer.
pub struct ScheduledAction {
    claimed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ScheduledAction {
    /// Try to prevent the action from running.
    ///
    /// Returns `true` only if the action had not started yet and is now
    /// guaranteed never to run. Returns `false` if it already ran or is
    /// running right now.
    pub fn cancel(&self) -> bool {
        let prevented = !self.claimed.swap(true, Ordering::SeqCst);
        if prevented {
            self.handle.abort();
        }
        prevented
    }
}

/// Run `action` after `delay`, unless cancelled first.
pub fn schedule<F>(delay: Duration, action: F) -> ScheduledAction
where
    F: Future<Output = ()> + Send + 'static,
{
    let claimed = Arc::new(AtomicBool::new(false));
    let flag = claimed.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        // Exactly one of the runner and a canceller wins the flag.
        if !flag.swap(true, Ordering::SeqCst) {
            action.await;
        }
    });
    ScheduledAction { claimed, handle }
}
