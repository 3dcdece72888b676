//! The run coordinator.
//!
//! A [`Runner`] holds no state of its own. Its job list, return values,
//! counters and cached progress all live in the shared store under the
//! runner's namespace, so any process that rebuilds the runner from its
//! [`RunnerSpec`] sees the same run.

pub mod context;
pub mod state;
pub mod workload;

pub use context::JobContext;
pub use workload::{
    ErrorHandler, FnMethod, WorkMethod, Workload, WorkloadBuilder, WorkloadRegistry,
};

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::codec::Value;
use crate::error::{Error, Result};
use crate::model::{Call, DeferralOptions, Dispatch, Job, JobStatus, RunnerSpec, Schedule};
use crate::progress::Progress;
use crate::resolve::{Lookup, ReturnValueResolver};
use crate::services::Services;
use crate::sync::LOCK_TIMEOUT;
use crate::telemetry::metrics;
use state::RunState;

/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<Inner>,
}

struct Inner {
    spec: RunnerSpec,
    workload: Arc<Workload>,
    services: Services,
    state: RunState,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner").field("spec", &self.inner.spec).finish()
    }
}

pub struct RunnerBuilder {
    name: String,
    workload: Arc<Workload>,
    services: Services,
    priority: Option<i32>,
    time_to_run: Option<Duration>,
    record_return_values: Option<bool>,
    push_progress_updates: bool,
    lock_timeout: Duration,
}

impl RunnerBuilder {
    /// Queue priority for this run's jobs. Lower numbers run first.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn time_to_run(mut self, time_to_run: Duration) -> Self {
        self.time_to_run = Some(time_to_run);
        self
    }

    /// Overrides the workload's default.
    pub fn record_return_values(mut self, record: bool) -> Self {
        self.record_return_values = Some(record);
        self
    }

    pub fn push_progress_updates(mut self, push: bool) -> Self {
        self.push_progress_updates = push;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn build(self) -> Runner {
        let spec = RunnerSpec {
            kind: self.workload.kind().to_string(),
            name: self.name,
            priority: self
                .priority
                .unwrap_or_else(|| self.services.queue.default_priority()),
            time_to_run: self
                .time_to_run
                .unwrap_or_else(|| self.services.queue.default_time_to_run()),
            record_return_values: self
                .record_return_values
                .unwrap_or_else(|| self.workload.record_return_values()),
            push_progress_updates: self.push_progress_updates,
        };
        Runner::assemble(spec, self.workload, self.services, self.lock_timeout)
    }
}

impl Runner {
    pub fn builder(
        name: impl Into<String>,
        workload: Arc<Workload>,
        services: Services,
    ) -> RunnerBuilder {
        RunnerBuilder {
            name: name.into(),
            workload,
            services,
            priority: None,
            time_to_run: None,
            record_return_values: None,
            push_progress_updates: false,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    /// Rebuild the runner a queued call was addressed to.
    pub fn from_spec(
        spec: RunnerSpec,
        workload: Arc<Workload>,
        services: Services,
        lock_timeout: Duration,
    ) -> Result<Self> {
        if spec.kind != workload.kind() {
            return Err(Error::UnknownRunner(format!(
                "{} (workload is {})",
                spec.kind,
                workload.kind()
            )));
        }
        Ok(Self::assemble(spec, workload, services, lock_timeout))
    }

    fn assemble(
        spec: RunnerSpec,
        workload: Arc<Workload>,
        services: Services,
        lock_timeout: Duration,
    ) -> Self {
        let state = RunState::new(services.clone(), &spec.namespace(), lock_timeout);
        Self {
            inner: Arc::new(Inner {
                spec,
                workload,
                services,
                state,
            }),
        }
    }

    pub fn spec(&self) -> &RunnerSpec {
        &self.inner.spec
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn namespace(&self) -> String {
        self.inner.spec.namespace()
    }

    pub fn workload(&self) -> &Workload {
        &self.inner.workload
    }

    pub(crate) fn state(&self) -> &RunState {
        &self.inner.state
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    /// Enqueue `method(args)` from outside any job.
    pub async fn enqueue(&self, method: &str, args: Vec<Value>) -> Result<Job> {
        JobContext::publisher(self.clone()).enqueue(method, args).await
    }

    /// Enqueue `method(item, args...)` for every item, recording the whole
    /// batch in one job list mutation.
    pub async fn enqueue_each(
        &self,
        method: &str,
        items: Vec<Value>,
        args: Vec<Value>,
    ) -> Result<Vec<Job>> {
        JobContext::publisher(self.clone())
            .enqueue_each(method, items, args)
            .await
    }

    /// Submit one `process` call per argument list and record the jobs.
    pub(crate) async fn submit(
        &self,
        source: &'static str,
        method: &str,
        calls: Vec<Vec<Value>>,
    ) -> Result<Vec<Job>> {
        if !self.workload().has_method(method) {
            return Err(Error::UnknownMethod(format!("{}::{method}", self.workload().kind())));
        }
        let spec = self.spec();
        let schedule = Schedule {
            priority: spec.priority,
            time_to_run: spec.time_to_run,
            delay: Duration::ZERO,
        };

        let mut jobs = Vec::with_capacity(calls.len());
        for args in calls {
            let dispatch = Dispatch {
                receiver: spec.clone(),
                call: Call::Process {
                    method: method.to_string(),
                    args,
                },
            };
            let job = self.inner.services.queue.enqueue(dispatch, schedule).await?;
            info!(runner = %self.namespace(), job = %job, method, source, "enqueued job");
            jobs.push(job);
        }
        self.add_jobs(&jobs, source).await?;
        Ok(jobs)
    }

    /// Requeue a deferred call behind the run's own jobs.
    pub(crate) async fn enqueue_continuation(
        &self,
        method: &str,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    ) -> Result<Job> {
        let spec = self.spec();
        let schedule = Schedule {
            priority: spec.priority.saturating_add(1),
            time_to_run: spec.time_to_run,
            delay: options.sleep_time,
        };
        let dispatch = Dispatch {
            receiver: spec.clone(),
            call: Call::Deferred {
                method: method.to_string(),
                jobs,
                options,
                args,
            },
        };
        let job = self.inner.services.queue.enqueue(dispatch, schedule).await?;
        self.add_jobs(std::slice::from_ref(&job), "continuation").await?;
        Ok(job)
    }

    async fn add_jobs(&self, jobs: &[Job], source: &'static str) -> Result<()> {
        info!(runner = %self.namespace(), count = jobs.len(), source, "adding jobs");
        self.state().add_jobs(jobs).await?;
        metrics::jobs_enqueued().add(
            jobs.len() as u64,
            &[
                KeyValue::new("runner", self.namespace()),
                KeyValue::new("source", source),
            ],
        );
        if self.spec().push_progress_updates {
            self.update_progress().await?;
        }
        Ok(())
    }

    /// Ask a worker to refresh the cached progress soon, ahead of the run's
    /// own jobs.
    async fn schedule_progress_update(&self) -> Result<Job> {
        let spec = self.spec();
        let dispatch = Dispatch {
            receiver: spec.clone(),
            call: Call::UpdateProgress,
        };
        let schedule = Schedule {
            priority: spec.priority.saturating_sub(10),
            time_to_run: spec.time_to_run,
            delay: Duration::ZERO,
        };
        self.inner.services.queue.enqueue(dispatch, schedule).await
    }

    /// Trailing step of every worker-side call.
    pub(crate) async fn finish(&self, result: Result<Value>) -> Result<Value> {
        if !self.spec().push_progress_updates {
            return result;
        }
        match (self.schedule_progress_update().await, result) {
            (Ok(_), result) => result,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(original)) => {
                warn!(runner = %self.namespace(), error = %e, "progress update not scheduled");
                Err(original)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Run `method(args)` in this process, outside any job.
    ///
    /// A `deferred_result` reached from here blocks, polling until every
    /// dependency has a value.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        JobContext::publisher(self.clone()).invoke(method, args).await
    }

    /// Publisher-side `deferred_result` with the workload's options.
    pub async fn deferred_result(
        &self,
        method: &str,
        jobs: Vec<Job>,
        args: Vec<Value>,
    ) -> Result<Value> {
        JobContext::publisher(self.clone())
            .deferred_result(method, jobs, args)
            .await
    }

    /// Execute a queued `process` call as `job`.
    ///
    /// The trailing progress update is scheduled whatever the outcome, even
    /// when `method` is not part of the workload.
    pub async fn process(&self, job: Job, method: &str, args: Vec<Value>) -> Result<Value> {
        let result = match self.workload().method(method) {
            Ok(work) => self.run_method(job, work.as_ref(), args).await,
            Err(e) => Err(e),
        };
        self.finish(result).await
    }

    async fn run_method(&self, job: Job, work: &dyn WorkMethod, args: Vec<Value>) -> Result<Value> {
        let cx = JobContext::worker(self.clone(), job.clone());
        let outcome = match work.call(&cx, args).await {
            Ok(value) if self.spec().record_return_values && !cx.was_deferred() => self
                .state()
                .set_return_value(&job, &value)
                .await
                .map(|()| value),
            Ok(value) => Ok(value),
            Err(e) => Err(Error::from_work(e)),
        };
        match outcome {
            Ok(value) => Ok(value),
            Err(e) => self.recover(&job, e).await,
        }
    }

    /// Execute a queued continuation of a deferred result as `job`.
    pub async fn continue_deferred(
        &self,
        job: Job,
        method: &str,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        JobContext::worker(self.clone(), job)
            .deferred_result_with(method, jobs, options, args)
            .await
    }

    /// Route a failure through the workload's error handler, if it has one.
    ///
    /// A handled failure is counted and its substitute value is recorded when
    /// the run records return values. Without a handler the error is returned.
    pub(crate) async fn recover(&self, job: &Job, err: Error) -> Result<Value> {
        let runner_label = KeyValue::new("runner", self.namespace());
        let Some(handler) = self.workload().error_handler() else {
            metrics::work_errors().add(1, &[runner_label, KeyValue::new("handled", "false")]);
            return Err(err);
        };
        metrics::work_errors().add(1, &[runner_label, KeyValue::new("handled", "true")]);

        let err = match err {
            Error::Work(inner) => inner,
            other => anyhow::Error::new(other),
        };
        error!(
            runner = %self.namespace(),
            job = %job,
            error = %format!("{err:#}"),
            "work failed, calling error handler"
        );
        self.state().increment(&self.state().keys().error_count, 1).await?;
        let value = handler(&err);
        if self.spec().record_return_values {
            self.state().set_return_value(job, &value).await?;
        }
        Ok(value)
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    /// Values of `jobs`, in order, following job references.
    ///
    /// Fails with `Pending` naming the first unfinished job. Jobs that
    /// finished without a value fail the call with `Missing` when
    /// `halt_on_data_loss` is set; otherwise they are counted and replaced by
    /// the `__missing` placeholder.
    pub async fn resolve(&self, jobs: &[Job], options: &DeferralOptions) -> Result<Vec<Value>> {
        let resolver =
            ReturnValueResolver::load(self.inner.services.queue.as_ref(), self.state()).await?;
        let resolution = resolver.resolve_all(jobs).await?;

        if !resolution.missing.is_empty() && !options.halt_on_data_loss {
            let lost = resolution.missing.len() as i64;
            warn!(runner = %self.namespace(), lost, "substituting missing results");
            self.state()
                .increment(&self.state().keys().missing_result_count, lost)
                .await?;
        }
        resolution.into_values(options.halt_on_data_loss)
    }

    /// Value of a single job. A lost value comes back as the `__missing`
    /// placeholder.
    pub async fn return_value(&self, job: &Job) -> Result<Value> {
        let resolver =
            ReturnValueResolver::load(self.inner.services.queue.as_ref(), self.state()).await?;
        Ok(match resolver.lookup(job).await? {
            Lookup::Value(value) => value,
            Lookup::Missing(_) => Value::missing(),
        })
    }

    /// Value of the run's first job, usually its primary task.
    pub async fn result(&self) -> Result<Option<Value>> {
        match self.first_job().await? {
            Some(job) => self.return_value(&job).await.map(Some),
            None => Ok(None),
        }
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.state().jobs().await
    }

    pub async fn first_job(&self) -> Result<Option<Job>> {
        Ok(self.jobs().await?.into_iter().next())
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    pub async fn job_states(&self) -> Result<Vec<JobStatus>> {
        let queue = self.inner.services.queue.as_ref();
        let mut states = Vec::new();
        for job in self.jobs().await? {
            states.push(if queue.job_complete(&job).await? {
                JobStatus::Completed
            } else {
                JobStatus::Outstanding
            });
        }
        Ok(states)
    }

    /// Recompute progress from the job list and cache it.
    pub async fn update_progress(&self) -> Result<Progress> {
        let states = self.job_states().await?;
        let completed = states.iter().filter(|s| **s == JobStatus::Completed).count();
        let progress = Progress::new(completed, states.len());
        self.state().set_progress(progress.to_string()).await?;
        Ok(progress)
    }

    /// Progress cached by the last `update_progress`, `"0 / 0"` before any.
    pub async fn current_progress(&self) -> Result<String> {
        Ok(self
            .state()
            .progress()
            .await?
            .unwrap_or_else(|| "0 / 0".to_string()))
    }

    /// True when every job in the run has completed.
    pub async fn complete(&self) -> Result<bool> {
        Ok(self
            .job_states()
            .await?
            .iter()
            .all(|s| *s == JobStatus::Completed))
    }

    pub async fn error_count(&self) -> Result<i64> {
        self.state().counter(&self.state().keys().error_count).await
    }

    pub async fn missing_result_count(&self) -> Result<i64> {
        self.state()
            .counter(&self.state().keys().missing_result_count)
            .await
    }
}
