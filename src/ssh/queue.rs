//! Per-host admission control for execution tasks.
//!
//! Tasks are submitted fire-and-forget per [`SessionKey`]; the executor
//! caps how many run concurrently against any one target and absorbs
//! transient channel exhaustion on the cached session by resubmitting the
//! task a bounded number of times instead of failing it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::PoolSettings;
use crate::error::PoolError;
use crate::scheduler;

use super::cache::CachingSessionPool;
use super::key::SessionKey;
use super::remote::Authenticator;
use super::task::{CompletionHandler, ExecTask};

struct HostQueueState<A: Authenticator> {
    active: i32,
    queue: VecDeque<Arc<ExecTask<A>>>,
    poll_scheduled: bool,
}

impl<A: Authenticator> Default for HostQueueState<A> {
    fn default() -> Self {
        Self {
            active: 0,
            queue: VecDeque::new(),
            poll_scheduled: false,
        }
    }
}

pub struct QueueExecutor<A: Authenticator> {
    self_ref: Weak<Self>,
    sessions: Arc<CachingSessionPool<A>>,
    states: Mutex<HashMap<SessionKey, HostQueueState<A>>>,
    tasks_per_host: i32,
    admission_retry_interval: Duration,
    completion_poll_interval: Duration,
    open_retry_limit: u32,
    resubmit_limit: u32,
}

impl<A: Authenticator> QueueExecutor<A> {
    pub fn new(sessions: Arc<CachingSessionPool<A>>, settings: &PoolSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            sessions,
            states: Mutex::new(HashMap::new()),
            tasks_per_host: settings.tasks_per_host as i32,
            admission_retry_interval: settings.admission_retry_interval(),
            completion_poll_interval: settings.completion_poll_interval(),
            open_retry_limit: settings.open_retry_limit,
            resubmit_limit: settings.resubmit_limit,
        })
    }

    pub fn session_pool(&self) -> &Arc<CachingSessionPool<A>> {
        &self.sessions
    }

    /// Enqueue a task for `key` and kick admission. Fire-and-forget: the
    /// outcome arrives through the task's completion handler.
    pub fn submit(&self, task: Arc<ExecTask<A>>, key: SessionKey) {
        let trigger = {
            let mut states = self.states.lock();
            let state = states.entry(key.clone()).or_default();
            state.queue.push_back(task);
            !state.poll_scheduled
        };
        if trigger {
            if let Some(executor) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    executor.poll(key).await;
                });
            }
        }
    }

    /// Build and submit a task for a plain command string.
    pub fn submit_command(
        &self,
        command: impl Into<String>,
        key: SessionKey,
        on_complete: CompletionHandler,
    ) -> Arc<ExecTask<A>> {
        let task = Arc::new(
            ExecTask::new(command)
                .with_poll_interval(self.completion_poll_interval)
                .with_open_retry_limit(self.open_retry_limit)
                .with_completion(on_complete),
        );
        self.submit(task.clone(), key);
        task
    }

    /// Tasks queued or running for `key`; for introspection and tests.
    pub fn outstanding(&self, key: &SessionKey) -> usize {
        let states = self.states.lock();
        states
            .get(key)
            .map(|state| state.queue.len() + state.active.max(0) as usize)
            .unwrap_or(0)
    }

    /// Drop all queued work and shut the session layers down. Tasks
    /// already running finish on their own.
    pub async fn shutdown(&self) {
        self.states.lock().clear();
        self.sessions.shutdown().await;
    }

    /// Drain admissible tasks for `key`. One pass dispatches as many
    /// queued tasks as the per-host cap allows; when the cap is reached a
    /// single delayed re-check is scheduled instead.
    async fn poll(self: Arc<Self>, key: SessionKey) {
        loop {
            let task = {
                let mut states = self.states.lock();
                let Some(state) = states.get_mut(&key) else {
                    return;
                };

                if state.active >= self.tasks_per_host {
                    if !state.poll_scheduled {
                        state.poll_scheduled = true;
                        let executor = self.clone();
                        let key = key.clone();
                        // The handle is dropped on purpose: the backoff
                        // check must always run.
                        scheduler::schedule(self.admission_retry_interval, async move {
                            {
                                let mut states = executor.states.lock();
                                if let Some(state) = states.get_mut(&key) {
                                    state.poll_scheduled = false;
                                }
                            }
                            executor.clone().poll(key).await;
                        });
                    }
                    return;
                }

                match state.queue.pop_front() {
                    Some(task) => {
                        state.active += 1;
                        task
                    }
                    None => {
                        if state.active <= 0 && !state.poll_scheduled {
                            tracing::trace!(
                                "collected idle queue state for {}@{}:{}",
                                key.user(),
                                key.host(),
                                key.port()
                            );
                            states.remove(&key);
                        }
                        return;
                    }
                }
            };

            if task.is_finalized() {
                // Cancelled while it sat in the queue; give the slot back.
                let mut states = self.states.lock();
                if let Some(state) = states.get_mut(&key) {
                    state.active -= 1;
                }
                continue;
            }

            self.clone().dispatch(task, &key).await;
        }
    }

    /// Run one admitted task, wrapping its completion handler so the
    /// active count comes back down and the queue is polled again when the
    /// task finishes.
    async fn dispatch(self: Arc<Self>, task: Arc<ExecTask<A>>, key: &SessionKey) {
        // The original handler is parked in a shared slot so it can be put
        // back if the session layer turns the task away before running it.
        let original = Arc::new(Mutex::new(task.take_completion()));
        {
            let executor = self.clone();
            let key = key.clone();
            let slot = original.clone();
            task.set_completion(Box::new(move |outcome| {
                if let Some(handler) = slot.lock().take() {
                    handler(outcome);
                }
                tokio::spawn(async move {
                    {
                        let mut states = executor.states.lock();
                        if let Some(state) = states.get_mut(&key) {
                            state.active -= 1;
                        }
                    }
                    executor.clone().poll(key).await;
                });
            }));
        }

        match task.clone().run(key, &self.sessions).await {
            Ok(()) => {}
            Err(PoolError::ChannelLimitExceeded) => {
                // Put the original handler back before deciding what to do
                // with the task. An empty slot means a racing cancel fired
                // the wrapper and settled the bookkeeping already.
                let Some(handler) = original.lock().take() else {
                    return;
                };
                task.set_completion(handler);
                if task.is_finalized() {
                    // A cancel slipped in after run(); its wrapper settled
                    // the active count but the outcome missed the handler.
                    task.deliver_cancelled();
                    return;
                }
                {
                    let mut states = self.states.lock();
                    if let Some(state) = states.get_mut(key) {
                        state.active -= 1;
                    }
                }

                let failures = task.record_failure();
                if failures > self.resubmit_limit {
                    tracing::warn!(
                        "task {}: session for {}@{}:{} out of channels, retries exhausted",
                        task.id(),
                        key.user(),
                        key.host(),
                        key.port()
                    );
                    task.fail(PoolError::ChannelLimitExceeded).await;
                } else {
                    tracing::debug!(
                        "task {}: session out of channels, resubmitting ({}/{})",
                        task.id(),
                        failures,
                        self.resubmit_limit
                    );
                    self.submit(task, key.clone());
                }
            }
            Err(e) => {
                // run() delivers every other failure through the
                // completion handler itself; this arm is defensive.
                tracing::error!("task {} failed to start: {}", task.id(), e);
                task.fail(e).await;
            }
        }
    }
}
