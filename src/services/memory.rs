//! In-process collaborators for tests and the demo binary.
//!
//! `MemoryQueue` follows beanstalk conventions: lower priority numbers are
//! served first, delayed jobs become ready after their delay, a reservation
//! that outlives its time-to-run is handed out again, and a job the queue no
//! longer knows about counts as complete.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{LockGuard, LockService, SharedStore, WorkQueue};
use crate::codec;
use crate::error::{Error, Result};
use crate::model::{Dispatch, Job, Schedule};

pub const DEFAULT_PRIORITY: i32 = 1024;
pub const DEFAULT_TIME_TO_RUN: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Lifecycle state of a job inside a [`MemoryQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Delayed,
    Ready,
    Reserved,
    Buried,
}

/// A job handed to a worker by [`MemoryQueue::reserve`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job: Job,
    pub payload: String,
    /// Times this job was released back to the queue before this delivery.
    pub releases: u32,
}

/// Snapshot of one job's queue entry.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub state: JobState,
    pub priority: i32,
    pub time_to_run: Duration,
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    pub releases: u32,
}

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    payload: String,
    priority: i32,
    time_to_run: Duration,
    ready_at: Instant,
    enqueued_at: DateTime<Utc>,
    releases: u32,
}

#[derive(Default)]
struct QueueState {
    next_id: u64,
    waiting: HashMap<u64, Entry>,
    reserved: HashMap<u64, (Entry, Instant)>,
    buried: HashMap<u64, Entry>,
}

impl QueueState {
    /// Hand expired reservations back to the waiting set.
    fn expire_reservations(&mut self, now: Instant) {
        let expired: Vec<u64> = self
            .reserved
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some((entry, _)) = self.reserved.remove(&id) {
                debug!(job = %entry.job, "reservation expired, redelivering");
                self.waiting.insert(id, Entry {
                    ready_at: now,
                    ..entry
                });
            }
        }
    }
}

/// Priority- and delay-aware in-memory work queue.
pub struct MemoryQueue {
    server: String,
    default_priority: i32,
    default_time_to_run: Duration,
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new(server: impl Into<String>) -> Self {
        Self::with_defaults(server, DEFAULT_PRIORITY, DEFAULT_TIME_TO_RUN)
    }

    pub fn with_defaults(
        server: impl Into<String>,
        default_priority: i32,
        default_time_to_run: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            default_priority,
            default_time_to_run,
            state: Mutex::new(QueueState {
                next_id: 1,
                ..QueueState::default()
            }),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reserve the most urgent ready job, if any.
    pub fn reserve(&self) -> Option<Delivery> {
        let now = Instant::now();
        let mut state = self.lock();
        state.expire_reservations(now);

        let id = state
            .waiting
            .values()
            .filter(|e| e.ready_at <= now)
            .min_by_key(|e| (e.priority, e.job.id))
            .map(|e| e.job.id)?;
        let entry = state.waiting.remove(&id)?;
        let delivery = Delivery {
            job: entry.job.clone(),
            payload: entry.payload.clone(),
            releases: entry.releases,
        };
        let deadline = now + entry.time_to_run;
        state.reserved.insert(id, (entry, deadline));
        Some(delivery)
    }

    /// Finish a job. The queue forgets it, which is what makes it complete.
    /// Returns false if the job was not known to the queue.
    pub fn delete(&self, job: &Job) -> bool {
        let mut state = self.lock();
        state.reserved.remove(&job.id).is_some()
            || state.waiting.remove(&job.id).is_some()
            || state.buried.remove(&job.id).is_some()
    }

    /// Put a reserved job back for another attempt after `delay`.
    pub fn release(&self, job: &Job, delay: Duration) -> bool {
        let mut state = self.lock();
        match state.reserved.remove(&job.id) {
            Some((entry, _)) => {
                let releases = entry.releases + 1;
                state.waiting.insert(job.id, Entry {
                    ready_at: Instant::now() + delay,
                    releases,
                    ..entry
                });
                true
            }
            None => false,
        }
    }

    /// Park a reserved job; it is neither retried nor complete.
    pub fn bury(&self, job: &Job) -> bool {
        let mut state = self.lock();
        match state.reserved.remove(&job.id) {
            Some((entry, _)) => {
                state.buried.insert(job.id, entry);
                true
            }
            None => false,
        }
    }

    /// Current state, or `None` once the job is deleted or if the queue
    /// never saw it.
    pub fn state(&self, job: &Job) -> Option<JobState> {
        self.inspect(job).map(|info| info.state)
    }

    pub fn inspect(&self, job: &Job) -> Option<JobInfo> {
        let now = Instant::now();
        let state = self.lock();
        let info = |entry: &Entry, s: JobState| JobInfo {
            state: s,
            priority: entry.priority,
            time_to_run: entry.time_to_run,
            payload: entry.payload.clone(),
            enqueued_at: entry.enqueued_at,
            releases: entry.releases,
        };

        if let Some(entry) = state.waiting.get(&job.id) {
            let s = if entry.ready_at <= now {
                JobState::Ready
            } else {
                JobState::Delayed
            };
            return Some(info(entry, s));
        }
        if let Some((entry, _)) = state.reserved.get(&job.id) {
            return Some(info(entry, JobState::Reserved));
        }
        if let Some(entry) = state.buried.get(&job.id) {
            return Some(info(entry, JobState::Buried));
        }
        None
    }

    /// Decode the payload of a job still held by the queue.
    pub fn dispatch_of(&self, job: &Job) -> Option<Dispatch> {
        self.inspect(job)
            .and_then(|info| codec::decode_dispatch(&info.payload).ok())
    }

    /// Jobs waiting or reserved.
    pub fn outstanding(&self) -> usize {
        let state = self.lock();
        state.waiting.len() + state.reserved.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Wait until nothing is waiting or reserved, or `timeout` elapses.
    /// Returns whether the queue went idle.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, dispatch: Dispatch, schedule: Schedule) -> Result<Job> {
        let payload = codec::encode_dispatch(&dispatch)?;
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;

        let job = Job::new(id, self.server.clone());
        state.waiting.insert(id, Entry {
            job: job.clone(),
            payload,
            priority: schedule.priority,
            time_to_run: schedule.time_to_run,
            ready_at: Instant::now() + schedule.delay,
            enqueued_at: Utc::now(),
            releases: 0,
        });
        Ok(job)
    }

    async fn job_complete(&self, job: &Job) -> Result<bool> {
        if job.server != self.server {
            return Err(Error::Queue(format!(
                "job {job} does not belong to queue {}",
                self.server
            )));
        }
        Ok(self.state(job).is_none())
    }

    fn default_priority(&self) -> i32 {
        self.default_priority
    }

    fn default_time_to_run(&self) -> Duration {
        self.default_time_to_run
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Hash-map backed shared store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|p| p.into_inner());
        entries.insert(key.to_string(), value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// Per-key async mutexes with acquisition timeout.
#[derive(Default)]
pub struct MemoryLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn named(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn acquire(&self, name: &str, timeout: Duration) -> Result<LockGuard> {
        let mutex = self.named(name);
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockGuard::new(guard)),
            Err(_) => Err(Error::Locked(name.to_string())),
        }
    }
}

/// Lock service that always succeeds immediately.
///
/// Only safe when a single process mutates the run's state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLocks;

#[async_trait]
impl LockService for NullLocks {
    async fn acquire(&self, _name: &str, _timeout: Duration) -> Result<LockGuard> {
        Ok(LockGuard::noop())
    }
}
