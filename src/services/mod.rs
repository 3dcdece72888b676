//! Collaborator contracts: work queue, shared store, lock service.
//!
//! The runner consumes these through narrow traits. Production transports
//! live outside this crate; [`memory`] provides in-process implementations
//! for tests and the demo binary.

pub mod memory;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::model::{Dispatch, Job, Schedule};

/// Accepts units of work and reports their completion.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Submit a call for asynchronous execution. Returns the job handle.
    async fn enqueue(&self, dispatch: Dispatch, schedule: Schedule) -> Result<Job>;

    /// Whether the job has finished executing.
    async fn job_complete(&self, job: &Job) -> Result<bool>;

    fn default_priority(&self) -> i32;

    fn default_time_to_run(&self) -> Duration;
}

/// Key-value store backing a run's persisted state.
#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String) -> Result<()>;
}

/// Distributed mutual exclusion.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Acquire the named lock, waiting at most `timeout`.
    ///
    /// Fails with [`Error::Locked`](crate::Error::Locked) when the lock is
    /// not acquired in time. The lock is held until the guard is dropped.
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard>;
}

/// Releases the lock it was acquired for when dropped.
pub struct LockGuard {
    _release: Option<Box<dyn Send + Sync>>,
}

impl LockGuard {
    /// Wrap whatever value releases the lock on drop.
    pub fn new(release: impl Send + Sync + 'static) -> Self {
        Self {
            _release: Some(Box::new(release)),
        }
    }

    /// A guard holding nothing, for lock services that never contend.
    pub fn noop() -> Self {
        Self { _release: None }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self._release.is_some())
            .finish()
    }
}

/// The three collaborators a runner needs, shared across runners and workers.
#[derive(Clone)]
pub struct Services {
    pub queue: Arc<dyn WorkQueue>,
    pub store: Arc<dyn SharedStore>,
    pub locks: Arc<dyn LockService>,
}

impl Services {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn SharedStore>,
        locks: Arc<dyn LockService>,
    ) -> Self {
        Self {
            queue,
            store,
            locks,
        }
    }
}
