//! End-to-end runs of the demo workloads through a worker pool.

use deferq::demo;
use deferq::services::memory::{MemoryLocks, MemoryQueue, MemoryStore};
use deferq::worker::{PoolConfig, Worker, WorkerPool};
use deferq::{Runner, Services, Value, Workload, WorkloadRegistry};
use std::sync::Arc;
use std::time::Duration;

const SLEEP: Duration = Duration::from_millis(10);

struct Harness {
    queue: Arc<MemoryQueue>,
    services: Services,
    pool: WorkerPool,
    workload: Arc<Workload>,
}

fn harness(workload: Workload) -> Harness {
    let queue = Arc::new(MemoryQueue::new("mem"));
    let services = Services::new(
        queue.clone(),
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryLocks::new()),
    );
    let mut registry = WorkloadRegistry::new();
    let workload = registry.register(workload).unwrap();
    let worker = Worker::new(Arc::new(registry), services.clone());
    let mut pool = WorkerPool::new(queue.clone(), worker, PoolConfig::default());
    pool.start();
    Harness {
        queue,
        services,
        pool,
        workload,
    }
}

impl Harness {
    fn runner(&self, name: &str) -> Runner {
        Runner::builder(name, Arc::clone(&self.workload), self.services.clone()).build()
    }
}

async fn wait_complete(runner: &Runner) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !runner.complete().await.unwrap() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("run did not complete");
}

#[tokio::test]
async fn base_cases_return_directly() {
    let h = harness(demo::fibonacci(SLEEP).unwrap());
    let runner = h.runner("base");

    for (n, expected) in [(0, 0), (1, 1), (2, 3)] {
        let value = runner.call("fibonacci", vec![Value::Int(n)]).await.unwrap();
        assert_eq!(value, Value::Int(expected), "fib({n})");
    }
    assert!(runner.jobs().await.unwrap().is_empty());
    h.pool.shutdown().await;
}

#[tokio::test]
async fn queued_fibonacci_converges_through_continuations() {
    let h = harness(demo::fibonacci(SLEEP).unwrap());
    let runner = h.runner("fib4");

    runner.enqueue("fibonacci", vec![Value::Int(4)]).await.unwrap();
    wait_complete(&runner).await;

    assert_eq!(runner.result().await.unwrap(), Some(Value::Int(7)));
    assert_eq!(runner.error_count().await.unwrap(), 0);
    // fib(4) fans out to fib(3), fib(2), fib(1), fib(2) plus continuations.
    assert!(runner.jobs().await.unwrap().len() >= 5);
    assert!(h.queue.wait_idle(Duration::from_secs(1)).await);
    assert_eq!(runner.update_progress().await.unwrap().remaining(), 0);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn publisher_call_blocks_until_result() {
    let h = harness(demo::fibonacci(SLEEP).unwrap());
    let runner = h.runner("fib5");

    let value = tokio::time::timeout(
        Duration::from_secs(10),
        runner.call("fibonacci", vec![Value::Int(5)]),
    )
    .await
    .expect("publisher did not finish")
    .unwrap();

    // fib(5) = fib(4) + fib(3) = 7 + 4
    assert_eq!(value, Value::Int(11));
    h.pool.shutdown().await;
}

#[tokio::test]
async fn sleepy_run_sums_naps() {
    let h = harness(demo::sleepy(SLEEP).unwrap());
    let runner = h.runner("naps");

    runner
        .enqueue("run", vec![Value::Int(4), Value::Int(10)])
        .await
        .unwrap();
    wait_complete(&runner).await;

    assert_eq!(runner.result().await.unwrap(), Some(Value::Int(20)));
    h.pool.shutdown().await;
}
