//! Transitive lookup of job results.
//!
//! A job's stored value may itself be a [`JobReference`](crate::JobReference)
//! left behind when the job deferred. Resolution follows those references to
//! the terminal value and tells "not done yet" apart from "done, value lost".

use async_trait::async_trait;
use tracing::debug;

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::model::Job;
use crate::runner::state::ReturnValueTable;
use crate::services::WorkQueue;

/// Outcome of looking up a single job.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The terminal value, after following any references.
    Value(Value),
    /// The job finished but left no value. Carries the job whose entry was
    /// absent, which differs from the requested job when a chain broke.
    Missing(Job),
}

/// Values for a batch of jobs, in request order.
///
/// Missing entries already hold the placeholder symbol; `missing` names the
/// requested jobs they belong to.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    pub values: Vec<Value>,
    pub missing: Vec<Job>,
}

impl Resolution {
    /// Apply the data-loss policy: fail naming every missing job, or keep the
    /// placeholders.
    pub fn into_values(self, halt_on_data_loss: bool) -> Result<Vec<Value>> {
        if halt_on_data_loss && !self.missing.is_empty() {
            return Err(Error::Missing(self.missing));
        }
        Ok(self.values)
    }
}

/// Where the resolver reads a run's return-value table from.
#[async_trait]
pub trait ReturnValueSource: Send + Sync {
    async fn return_values(&self) -> Result<ReturnValueTable>;
}

/// Resolves jobs against a snapshot of a run's return-value table.
///
/// The snapshot is re-read from its source before an absent entry is declared
/// missing, since a job may store its value and finish after the snapshot.
pub struct ReturnValueResolver<'a> {
    queue: &'a dyn WorkQueue,
    source: &'a dyn ReturnValueSource,
    table: ReturnValueTable,
}

impl<'a> ReturnValueResolver<'a> {
    pub fn new(
        queue: &'a dyn WorkQueue,
        source: &'a dyn ReturnValueSource,
        table: ReturnValueTable,
    ) -> Self {
        Self {
            queue,
            source,
            table,
        }
    }

    /// Take a snapshot of `source` and resolve against it.
    pub async fn load(
        queue: &'a dyn WorkQueue,
        source: &'a dyn ReturnValueSource,
    ) -> Result<Self> {
        let table = source.return_values().await?;
        Ok(Self::new(queue, source, table))
    }

    /// Look up one job, following references iteratively.
    ///
    /// Fails with `Pending` when some job along the chain has no value and the
    /// queue reports it still running.
    pub async fn lookup(&self, job: &Job) -> Result<Lookup> {
        let mut current = job.clone();
        let mut fresh: Option<ReturnValueTable> = None;
        loop {
            let table = fresh.as_ref().unwrap_or(&self.table);
            let entry = match table.get(&current)? {
                Some(value) => Some(value),
                None if self.queue.job_complete(&current).await? => {
                    // Completion is checked after the snapshot; read again.
                    let reread = self.source.return_values().await?;
                    let entry = reread.get(&current)?;
                    fresh = Some(reread);
                    entry
                }
                None => return Err(Error::Pending(current)),
            };
            match entry {
                Some(Value::Ref(reference)) => {
                    debug!(from = %current, to = %reference.job, "following job reference");
                    current = reference.job;
                }
                Some(value) => return Ok(Lookup::Value(value)),
                None => return Ok(Lookup::Missing(current)),
            }
        }
    }

    /// Look up every job. The first pending job fails the whole batch.
    pub async fn resolve_all(&self, jobs: &[Job]) -> Result<Resolution> {
        let mut resolution = Resolution::default();
        for job in jobs {
            match self.lookup(job).await? {
                Lookup::Value(value) => resolution.values.push(value),
                Lookup::Missing(_) => {
                    resolution.values.push(Value::missing());
                    resolution.missing.push(job.clone());
                }
            }
        }
        Ok(resolution)
    }
}
