//! Executes queued calls and drives in-process worker loops.

use opentelemetry::KeyValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{Instrument, error, info, warn};

use crate::codec;
use crate::error::Result;
use crate::model::{Call, Job};
use crate::runner::{Runner, WorkloadRegistry};
use crate::services::Services;
use crate::services::memory::{Delivery, MemoryQueue};
use crate::sync::LOCK_TIMEOUT;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_outcome, start_job_span};

/// Turns a delivered payload back into a runner call and executes it.
#[derive(Clone)]
pub struct Worker {
    registry: Arc<WorkloadRegistry>,
    services: Services,
    lock_timeout: Duration,
}

impl Worker {
    pub fn new(registry: Arc<WorkloadRegistry>, services: Services) -> Self {
        Self {
            registry,
            services,
            lock_timeout: LOCK_TIMEOUT,
        }
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Execute one job's payload.
    pub async fn execute(&self, job: &Job, payload: &str) -> Result<()> {
        let dispatch = codec::decode_dispatch(payload)?;
        let workload = self.registry.get(&dispatch.receiver.kind)?;
        let span = start_job_span(&dispatch.receiver, job, &dispatch.call);
        let call_name = dispatch.call.name().to_string();
        let runner = Runner::from_spec(
            dispatch.receiver,
            workload,
            self.services.clone(),
            self.lock_timeout,
        )?;

        let started = Instant::now();
        let result = run_call(&runner, job, dispatch.call)
            .instrument(span.clone())
            .await;

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::job_duration_ms().record(
            duration_ms,
            &[
                KeyValue::new("runner", runner.namespace()),
                KeyValue::new("call", call_name),
            ],
        );
        record_outcome(&span, if result.is_ok() { "ok" } else { "error" });
        result
    }
}

async fn run_call(runner: &Runner, job: &Job, call: Call) -> Result<()> {
    match call {
        Call::Process { method, args } => {
            runner.process(job.clone(), &method, args).await.map(drop)
        }
        Call::Deferred {
            method,
            jobs,
            options,
            args,
        } => runner
            .continue_deferred(job.clone(), &method, jobs, options, args)
            .await
            .map(drop),
        Call::UpdateProgress => runner.update_progress().await.map(drop),
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Deliveries per job before it is buried.
    pub max_attempts: u32,
    /// Delay before a failed job is handed out again.
    pub retry_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(10),
            max_attempts: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// N worker loops reserving from a [`MemoryQueue`].
pub struct WorkerPool {
    queue: Arc<MemoryQueue>,
    worker: Worker,
    config: PoolConfig,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(queue: Arc<MemoryQueue>, worker: Worker, config: PoolConfig) -> Self {
        Self {
            queue,
            worker,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn the worker loops.
    pub fn start(&mut self) {
        let workers = self.config.workers.max(1);
        info!(workers, "worker pool started");
        for index in 0..workers {
            let lane = Lane {
                index,
                queue: Arc::clone(&self.queue),
                worker: self.worker.clone(),
                config: self.config.clone(),
                shutdown: Arc::clone(&self.shutdown),
                wake: Arc::clone(&self.wake),
            };
            self.tasks.spawn(lane.run());
        }
    }

    /// Stop the loops after their current job and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("worker task failed: {e}");
            }
        }
        info!("worker pool stopped");
    }
}

/// One worker loop.
struct Lane {
    index: usize,
    queue: Arc<MemoryQueue>,
    worker: Worker,
    config: PoolConfig,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Lane {
    async fn run(self) {
        while !self.shutdown.load(Ordering::SeqCst) {
            match self.queue.reserve() {
                Some(delivery) => self.handle(delivery).await,
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let job = delivery.job;
        match self.worker.execute(&job, &delivery.payload).await {
            Ok(()) => {
                self.queue.delete(&job);
            }
            Err(e) if delivery.releases + 1 >= self.config.max_attempts => {
                error!(lane = self.index, job = %job, error = %e, "job failed, burying");
                self.queue.bury(&job);
            }
            Err(e) => {
                warn!(
                    lane = self.index,
                    job = %job,
                    error = %e,
                    attempt = delivery.releases + 1,
                    "job failed, releasing"
                );
                self.queue.release(&job, self.config.retry_delay);
            }
        }
    }
}
