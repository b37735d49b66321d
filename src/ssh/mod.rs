//! SSH session pooling and pooled command execution.
//!
//! Layered bottom-up: a bounded raw pool creates and destroys sessions, a
//! caching layer shares them per target with ref-counted reuse and lazy
//! expiry, execution tasks poll their channels to completion, and a queue
//! executor bounds how many tasks run against any one host.

pub mod cache;
pub mod client;
pub mod key;
pub mod pool;
pub mod queue;
pub mod remote;
pub mod task;

pub use cache::CachingSessionPool;
pub use client::RusshAuthenticator;
pub use key::SessionKey;
pub use pool::{PooledSession, RawSessionPool};
pub use queue::QueueExecutor;
pub use task::{CompletionHandler, ExecTask, TaskOutcome};
