//! Integration tests for runner submission, recording and progress.

use deferq::model::Call;
use deferq::services::memory::{JobState, MemoryLocks, MemoryQueue, MemoryStore};
use deferq::{Error, Job, JobStatus, Runner, Services, Value, Workload};
use std::sync::Arc;

fn setup(workload: Workload) -> (Arc<MemoryQueue>, Runner) {
    let queue = Arc::new(MemoryQueue::new("mem"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );
    let runner = Runner::builder("run1", Arc::new(workload), services)
        .priority(100)
        .build();
    (queue, runner)
}

fn basic() -> Workload {
    Workload::builder("basic")
        .function("echo", |args| Ok(args.into_iter().next().unwrap_or(Value::Nil)))
        .function("fail", |_| Err(anyhow::anyhow!("boom")))
        .record_return_values(true)
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Submission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_enqueues_all_land_in_job_list() {
    let (_queue, runner) = setup(basic());
    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50i64 {
        let runner = runner.clone();
        tasks.spawn(async move { runner.enqueue("echo", vec![Value::Int(i)]).await });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let jobs = runner.jobs().await.unwrap();
    assert_eq!(jobs.len(), 50);
    let mut ids: Vec<u64> = jobs.iter().map(|j| j.id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 50);
}

#[tokio::test]
async fn enqueue_uses_runner_schedule_and_spec() {
    let (queue, runner) = setup(basic());
    let job = runner.enqueue("echo", vec![Value::from("hi")]).await.unwrap();

    let info = queue.inspect(&job).unwrap();
    assert_eq!(info.priority, 100);
    assert_eq!(info.state, JobState::Ready);

    let dispatch = queue.dispatch_of(&job).unwrap();
    assert_eq!(dispatch.receiver, *runner.spec());
    assert_eq!(
        dispatch.call,
        Call::Process {
            method: "echo".to_string(),
            args: vec![Value::from("hi")],
        }
    );
    assert_eq!(runner.first_job().await.unwrap(), Some(job));
}

#[tokio::test]
async fn enqueue_each_prepends_item_to_args() {
    let (queue, runner) = setup(basic());
    let jobs = runner
        .enqueue_each("echo", vec![Value::Int(1), Value::Int(2)], vec![Value::from("x")])
        .await
        .unwrap();

    assert_eq!(jobs.len(), 2);
    assert_eq!(runner.jobs().await.unwrap(), jobs);
    match queue.dispatch_of(&jobs[1]).unwrap().call {
        Call::Process { args, .. } => assert_eq!(args, vec![Value::Int(2), Value::from("x")]),
        other => panic!("expected process call, got {other:?}"),
    }
}

#[tokio::test]
async fn unknown_method_is_rejected_before_submission() {
    let (queue, runner) = setup(basic());
    let err = runner.enqueue("nope", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::UnknownMethod(_)));
    assert!(queue.is_idle());
    assert!(runner.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn unportable_argument_fails_at_enqueue() {
    let (_queue, runner) = setup(basic());
    let err = runner
        .enqueue("echo", vec![Value::Float(f64::NAN)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoRemoteRepresentation(_)));
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn process_records_return_value() {
    let (_queue, runner) = setup(basic());
    let job = runner.enqueue("echo", vec![Value::Int(9)]).await.unwrap();

    let value = runner.process(job.clone(), "echo", vec![Value::Int(9)]).await.unwrap();
    assert_eq!(value, Value::Int(9));
    assert_eq!(runner.return_value(&job).await.unwrap(), Value::Int(9));
    assert_eq!(runner.result().await.unwrap(), Some(Value::Int(9)));
}

#[tokio::test]
async fn process_without_recording_leaves_value_missing() {
    let queue = Arc::new(MemoryQueue::new("mem"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );
    let runner = Runner::builder("quiet", Arc::new(basic()), services)
        .record_return_values(false)
        .build();
    let job = runner.enqueue("echo", vec![Value::Int(1)]).await.unwrap();

    runner.process(job.clone(), "echo", vec![Value::Int(1)]).await.unwrap();
    assert!(matches!(runner.return_value(&job).await, Err(Error::Pending(_))));

    queue.delete(&job);
    assert!(runner.return_value(&job).await.unwrap().is_missing());
}

#[tokio::test]
async fn failure_without_handler_propagates() {
    let (_queue, runner) = setup(basic());
    let job = runner.enqueue("fail", vec![]).await.unwrap();

    let err = runner.process(job, "fail", vec![]).await.unwrap_err();
    assert!(matches!(err, Error::Work(_)));
    assert_eq!(runner.error_count().await.unwrap(), 0);
}

#[tokio::test]
async fn failure_with_handler_counts_and_records_substitute() {
    let workload = Workload::builder("handled")
        .function("fail", |_| Err(anyhow::anyhow!("boom")))
        .error_handler(|e| Value::from(format!("handled: {e}")))
        .record_return_values(true)
        .build()
        .unwrap();
    let (_queue, runner) = setup(workload);
    let job = runner.enqueue("fail", vec![]).await.unwrap();

    let value = runner.process(job.clone(), "fail", vec![]).await.unwrap();
    assert_eq!(value, Value::from("handled: boom"));
    assert_eq!(runner.error_count().await.unwrap(), 1);
    assert_eq!(runner.return_value(&job).await.unwrap(), value);
}

#[tokio::test]
async fn process_pushes_progress_update_ahead_of_run() {
    let queue = Arc::new(MemoryQueue::new("mem"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );
    let runner = Runner::builder("pushy", Arc::new(basic()), services)
        .priority(100)
        .push_progress_updates(true)
        .build();

    let job = runner.enqueue("echo", vec![]).await.unwrap();
    assert_eq!(runner.current_progress().await.unwrap(), "0.0 / 1.0");

    runner.process(job.clone(), "echo", vec![]).await.unwrap();
    let update = Job::new(job.id + 1, "mem");
    assert_eq!(queue.dispatch_of(&update).unwrap().call, Call::UpdateProgress);
    assert_eq!(queue.inspect(&update).unwrap().priority, 90);
    assert_eq!(runner.jobs().await.unwrap(), vec![job]);
}

#[tokio::test]
async fn unknown_method_at_execution_still_pushes_progress() {
    let queue = Arc::new(MemoryQueue::new("mem"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );
    let runner = Runner::builder("pushy", Arc::new(basic()), services)
        .priority(100)
        .push_progress_updates(true)
        .build();

    let err = runner
        .process(Job::new(41, "mem"), "nope", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownMethod(_)));

    // Nothing else was queued, so the update is the first job.
    let update = Job::new(1, "mem");
    assert_eq!(queue.dispatch_of(&update).unwrap().call, Call::UpdateProgress);
    assert_eq!(queue.inspect(&update).unwrap().priority, 90);
    assert_eq!(runner.error_count().await.unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_progress_counts_completed_jobs() {
    let (queue, runner) = setup(basic());
    assert_eq!(runner.current_progress().await.unwrap(), "0 / 0");

    for i in 0..10i64 {
        runner.enqueue("echo", vec![Value::Int(i)]).await.unwrap();
    }
    for _ in 0..4 {
        let delivery = queue.reserve().unwrap();
        assert!(queue.delete(&delivery.job));
    }

    let progress = runner.update_progress().await.unwrap();
    assert_eq!(progress.completed, 4);
    assert_eq!(runner.current_progress().await.unwrap(), "4.0 / 10.0");
    assert_eq!(
        deferq::progress::pretty_progress(&runner).await.unwrap(),
        "40% Complete - 6 Jobs Remaining of 10 Jobs"
    );
}

#[tokio::test]
async fn complete_only_when_every_job_is_done() {
    let (queue, runner) = setup(basic());
    let a = runner.enqueue("echo", vec![]).await.unwrap();
    let b = runner.enqueue("echo", vec![]).await.unwrap();

    queue.delete(&a);
    assert_eq!(
        runner.job_states().await.unwrap(),
        vec![JobStatus::Completed, JobStatus::Outstanding]
    );
    assert!(!runner.complete().await.unwrap());

    queue.delete(&b);
    assert!(runner.complete().await.unwrap());
}
