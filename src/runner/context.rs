//! Execution context handed to work methods, and the deferral protocol.
//!
//! A context bound to a job is a worker context: `deferred_result` never
//! blocks there. When a dependency is still pending the call is requeued as a
//! continuation job and this job's result becomes a reference to it. An
//! unbound context belongs to a publisher, which simply polls.

use opentelemetry::KeyValue;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info};

use super::Runner;
use crate::codec::Value;
use crate::error::{Error, Result};
use crate::model::{DeferralOptions, Job, JobReference};
use crate::telemetry::metrics;

pub struct JobContext {
    runner: Runner,
    job: Option<Job>,
    deferred: AtomicBool,
}

impl JobContext {
    pub(crate) fn worker(runner: Runner, job: Job) -> Self {
        Self {
            runner,
            job: Some(job),
            deferred: AtomicBool::new(false),
        }
    }

    pub(crate) fn publisher(runner: Runner) -> Self {
        Self {
            runner,
            job: None,
            deferred: AtomicBool::new(false),
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// The job being executed, or `None` in a publisher.
    pub fn job(&self) -> Option<&Job> {
        self.job.as_ref()
    }

    /// The job being executed.
    pub fn current_job(&self) -> Result<&Job> {
        self.job.as_ref().ok_or(Error::NotInWorker)
    }

    pub fn in_worker(&self) -> bool {
        self.job.is_some()
    }

    /// Whether a deferral took over recording this job's result.
    pub(crate) fn was_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    fn source(&self) -> &'static str {
        if self.in_worker() { "worker" } else { "producer" }
    }

    /// Enqueue `method(args)` in this run.
    pub async fn enqueue(&self, method: &str, args: Vec<Value>) -> Result<Job> {
        let mut jobs = self.runner.submit(self.source(), method, vec![args]).await?;
        jobs.pop()
            .ok_or_else(|| Error::Queue("enqueue returned no job".to_string()))
    }

    /// Enqueue `method(item, args...)` once per item.
    pub async fn enqueue_each(
        &self,
        method: &str,
        items: Vec<Value>,
        args: Vec<Value>,
    ) -> Result<Vec<Job>> {
        let calls = items
            .into_iter()
            .map(|item| std::iter::once(item).chain(args.iter().cloned()).collect())
            .collect();
        self.runner.submit(self.source(), method, calls).await
    }

    /// Call `method([values of jobs], args...)` once every job has a value,
    /// using the workload's deferral options.
    pub async fn deferred_result(
        &self,
        method: &str,
        jobs: Vec<Job>,
        args: Vec<Value>,
    ) -> Result<Value> {
        let options = self.runner.workload().deferral_options().clone();
        self.deferred_result_with(method, jobs, options, args).await
    }

    pub async fn deferred_result_with(
        &self,
        method: &str,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        match &self.job {
            Some(job) => {
                let job = job.clone();
                let result = self.defer_as_worker(&job, method, jobs, options, args).await;
                self.runner.finish(result).await
            }
            None => self.defer_as_publisher(method, jobs, options, args).await,
        }
    }

    /// Look up and run a method of this workload in this context.
    pub(crate) async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let work = self.runner.workload().method(method)?;
        work.call(self, args).await.map_err(Error::from_work)
    }

    async fn combine(
        &self,
        method: &str,
        jobs: &[Job],
        options: &DeferralOptions,
        args: &[Value],
    ) -> Result<Value> {
        let values = self.runner.resolve(jobs, options).await?;
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(Value::List(values));
        call_args.extend_from_slice(args);
        self.invoke(method, call_args).await
    }

    async fn defer_as_worker(
        &self,
        job: &Job,
        method: &str,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.deferred.store(true, Ordering::SeqCst);
        let runner_label = KeyValue::new("runner", self.runner.namespace());
        debug!(job = %job, method, dependencies = jobs.len(), "deferral processing");

        let attempt = async {
            let value = self.combine(method, &jobs, &options, &args).await?;
            self.runner.state().set_return_value(job, &value).await?;
            Ok::<_, Error>(value)
        };
        let outcome = attempt.await;

        match outcome {
            Ok(value) => {
                debug!(job = %job, value = %value, "deferral resolved");
                metrics::deferrals().add(1, &[runner_label, KeyValue::new("outcome", "resolved")]);
                Ok(value)
            }
            Err(Error::Pending(pending)) => {
                info!(job = %job, pending = %pending, "some results are pending, requeueing");
                let delay = options.sleep_time;
                let continuation = self
                    .runner
                    .enqueue_continuation(method, jobs, options, args)
                    .await?;
                let reference = Value::Ref(JobReference::new(continuation.clone()));
                self.runner.state().set_return_value(job, &reference).await?;
                debug!(job = %job, continuation = %continuation, ?delay, "continuation scheduled");
                metrics::deferrals().add(1, &[runner_label, KeyValue::new("outcome", "requeued")]);
                Ok(reference)
            }
            Err(e) => {
                if e.is_missing() {
                    let labels = [runner_label, KeyValue::new("outcome", "missing")];
                    metrics::deferrals().add(1, &labels);
                    if self.runner.workload().error_handler().is_none() {
                        error!(
                            job = %job,
                            error = %e,
                            "a result went missing and there is no error handler"
                        );
                        return Ok(Value::Nil);
                    }
                }
                self.runner.recover(job, e).await
            }
        }
    }

    async fn defer_as_publisher(
        &self,
        method: &str,
        jobs: Vec<Job>,
        options: DeferralOptions,
        args: Vec<Value>,
    ) -> Result<Value> {
        loop {
            match self.combine(method, &jobs, &options, &args).await {
                Err(Error::Pending(pending)) => {
                    debug!(pending = %pending, sleep = ?options.sleep_time, "waiting for results");
                    tokio::time::sleep(options.sleep_time).await;
                }
                other => return other,
            }
        }
    }
}
