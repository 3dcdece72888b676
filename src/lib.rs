//! # deferq
//!
//! Fan a run out over an external work queue and let any job wait on the
//! results of other jobs without blocking a worker: an unresolved dependency
//! requeues the waiting call as a continuation and leaves a job reference
//! behind as the job's result.
//!
//! Run state (job list, return values, counters, progress) lives in a shared
//! store under the runner's namespace and is mutated under named locks.

pub mod codec;
pub mod config;
pub mod demo;
pub mod error;
pub mod model;
pub mod progress;
pub mod resolve;
pub mod runner;
pub mod services;
pub mod sync;
pub mod telemetry;
pub mod worker;

pub use codec::Value;
pub use error::{Error, Result};
pub use model::{DeferralOptions, Job, JobReference, JobStatus, RunnerSpec};
pub use progress::Progress;
pub use runner::{JobContext, Runner, Workload, WorkloadRegistry};
pub use services::Services;
