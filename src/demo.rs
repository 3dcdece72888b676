//! Demo workloads.
//!
//! `fibonacci` fans out recursively and joins through deferred results.
//! `sleepy` fans out naps and sums the time slept.

use async_trait::async_trait;
use std::time::Duration;

use crate::codec::Value;
use crate::error::Result;
use crate::model::DeferralOptions;
use crate::runner::{JobContext, WorkMethod, Workload};

pub const FIBONACCI: &str = "fibonacci";
pub const SLEEPY: &str = "sleepy";

fn int_arg(args: &[Value], index: usize, method: &str) -> anyhow::Result<i64> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("{method}: argument {index} must be an integer"))
}

fn sum(values: &[Value]) -> anyhow::Result<i64> {
    values.iter().try_fold(0i64, |total, value| {
        value
            .as_i64()
            .map(|n| total + n)
            .ok_or_else(|| anyhow::anyhow!("cannot add {value}"))
    })
}

/// Seeded so that fib(2) = 3; each n > 2 sums its two predecessors.
struct Fibonacci;

#[async_trait]
impl WorkMethod for Fibonacci {
    async fn call(&self, cx: &JobContext, args: Vec<Value>) -> anyhow::Result<Value> {
        let n = int_arg(&args, 0, "fibonacci")?;
        match n {
            ..=0 => Ok(Value::Int(0)),
            1 => Ok(Value::Int(1)),
            2 => Ok(Value::Int(3)),
            _ => {
                let j1 = cx.enqueue("fibonacci", vec![Value::Int(n - 1)]).await?;
                let j2 = cx.enqueue("fibonacci", vec![Value::Int(n - 2)]).await?;
                Ok(cx.deferred_result("add_together", vec![j1, j2], vec![]).await?)
            }
        }
    }
}

fn add_together(args: Vec<Value>) -> anyhow::Result<Value> {
    let values = args
        .first()
        .and_then(Value::as_list)
        .ok_or_else(|| anyhow::anyhow!("add_together expects a list of values"))?;
    Ok(Value::Int(sum(values)?))
}

pub fn fibonacci(sleep_time: Duration) -> Result<Workload> {
    Workload::builder(FIBONACCI)
        .method("fibonacci", Fibonacci)
        .function("add_together", add_together)
        .deferral_options(DeferralOptions::default().sleep_time(sleep_time))
        .record_return_values(true)
        .build()
}

/// `run(naps, nap_ms)`: enqueue naps alternating 0 and `nap_ms`, then defer
/// to `wakeup`.
struct Run;

#[async_trait]
impl WorkMethod for Run {
    async fn call(&self, cx: &JobContext, args: Vec<Value>) -> anyhow::Result<Value> {
        let naps = int_arg(&args, 0, "run")?;
        let nap_ms = int_arg(&args, 1, "run")?;
        let durations = (0..naps).map(|i| Value::Int((i % 2) * nap_ms)).collect();
        let jobs = cx.enqueue_each("snooze", durations, vec![]).await?;
        Ok(cx.deferred_result("wakeup", jobs, vec![]).await?)
    }
}

struct Snooze;

#[async_trait]
impl WorkMethod for Snooze {
    async fn call(&self, _cx: &JobContext, args: Vec<Value>) -> anyhow::Result<Value> {
        let ms = int_arg(&args, 0, "snooze")?;
        tokio::time::sleep(Duration::from_millis(ms.max(0).unsigned_abs())).await;
        Ok(Value::Int(ms))
    }
}

fn wakeup(args: Vec<Value>) -> anyhow::Result<Value> {
    let durations = args
        .first()
        .and_then(Value::as_list)
        .ok_or_else(|| anyhow::anyhow!("wakeup expects a list of durations"))?;
    Ok(Value::Int(sum(durations)?))
}

pub fn sleepy(sleep_time: Duration) -> Result<Workload> {
    Workload::builder(SLEEPY)
        .method("run", Run)
        .method("snooze", Snooze)
        .function("wakeup", wakeup)
        .deferral_options(DeferralOptions::default().sleep_time(sleep_time))
        .record_return_values(true)
        .build()
}
