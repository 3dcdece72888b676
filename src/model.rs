//! Core data model.
//!
//! A job is one dispatched unit of work. A runner is the namespace a run's
//! jobs, return values and counters live under. Everything here is plain data
//! that crosses process boundaries through the work queue payload.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::codec::Value;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Opaque handle for one dispatched unit of work.
///
/// Only a [`WorkQueue`](crate::services::WorkQueue) creates jobs. The pair
/// `(id, server)` is the job's identity within the queue's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Job {
    pub id: u64,
    pub server: String,
}

impl Job {
    pub fn new(id: u64, server: impl Into<String>) -> Self {
        Self {
            id,
            server: server.into(),
        }
    }

    /// Identity string used as the return-value table key.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.server, self.id)
    }
}

/// Completion as reported by the work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Outstanding,
}

/// "The value that will eventually be produced by this job."
///
/// Stored as a job's return value when it deferred instead of finishing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobReference {
    pub job: Job,
}

impl JobReference {
    pub fn new(job: Job) -> Self {
        Self { job }
    }

    pub fn dereference(&self) -> &Job {
        &self.job
    }
}

// ---------------------------------------------------------------------------
// Runner spec
// ---------------------------------------------------------------------------

/// Serializable identity and configuration of a runner.
///
/// Travels with every queued call so a worker in any process can rebuild the
/// runner that enqueued it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSpec {
    /// Workload kind, e.g. "fibonacci". First half of the namespace.
    pub kind: String,
    /// Run name. Should be unique for the lifetime of the run's state.
    pub name: String,
    pub priority: i32,
    pub time_to_run: Duration,
    pub record_return_values: bool,
    pub push_progress_updates: bool,
}

impl RunnerSpec {
    /// Namespace prefix for all of this run's shared state.
    pub fn namespace(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// Calls and scheduling
// ---------------------------------------------------------------------------

/// Options controlling a deferred result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralOptions {
    /// Minimum delay before a continuation runs, and the publisher's poll
    /// interval.
    pub sleep_time: Duration,
    /// Fail the whole resolution when any dependency lost its value.
    pub halt_on_data_loss: bool,
}

impl Default for DeferralOptions {
    fn default() -> Self {
        Self {
            sleep_time: Duration::from_secs(1),
            halt_on_data_loss: true,
        }
    }
}

impl DeferralOptions {
    pub fn sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time = sleep_time;
        self
    }

    pub fn halt_on_data_loss(mut self, halt: bool) -> Self {
        self.halt_on_data_loss = halt;
        self
    }
}

/// What a queued unit of work does when a worker picks it up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum Call {
    /// Run a registered method and record its value.
    Process { method: String, args: Vec<Value> },
    /// Retry a deferred result whose dependencies were pending.
    Deferred {
        method: String,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    },
    /// Recompute and cache the run's progress.
    UpdateProgress,
}

impl Call {
    pub fn name(&self) -> &str {
        match self {
            Call::Process { method, .. } | Call::Deferred { method, .. } => method,
            Call::UpdateProgress => "update_progress",
        }
    }
}

/// The payload handed to the work queue: who receives the call, and the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    pub receiver: RunnerSpec,
    pub call: Call,
}

/// Queue placement for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub priority: i32,
    pub time_to_run: Duration,
    pub delay: Duration,
}
