//! A run's durable state in the shared store.
//!
//! Every key lives under the runner's `<kind>:<name>` namespace. Mutations are
//! read-modify-write cycles wrapped in [`synchronized`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

use crate::codec::{self, Value};
use crate::error::{Error, Result};
use crate::model::Job;
use crate::resolve::ReturnValueSource;
use crate::services::Services;
use crate::sync::synchronized;

/// Store keys for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    pub progress: String,
    pub return_values: String,
    pub jobs: String,
    pub error_count: String,
    pub missing_result_count: String,
}

impl Keys {
    pub fn new(namespace: &str) -> Self {
        Self {
            progress: format!("{namespace}:progress"),
            return_values: format!("{namespace}:return_values"),
            jobs: format!("{namespace}:jobs"),
            error_count: format!("{namespace}:error_count"),
            missing_result_count: format!("{namespace}:missing_result_count"),
        }
    }
}

/// Job identity to encoded return value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnValueTable(BTreeMap<String, String>);

impl ReturnValueTable {
    pub fn parse(text: Option<&str>) -> Result<Self> {
        match text {
            Some(text) => Ok(serde_json::from_str(text)?),
            None => Ok(Self::default()),
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn get(&self, job: &Job) -> Result<Option<Value>> {
        self.0.get(&job.key()).map(|text| codec::decode(text)).transpose()
    }

    pub fn insert(&mut self, job: &Job, value: &Value) -> Result<()> {
        self.0.insert(job.key(), codec::encode(value)?);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Typed access to one run's keys.
#[derive(Clone)]
pub struct RunState {
    services: Services,
    keys: Keys,
    lock_timeout: Duration,
}

impl RunState {
    pub fn new(services: Services, namespace: &str, lock_timeout: Duration) -> Self {
        Self {
            services,
            keys: Keys::new(namespace),
            lock_timeout,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn read(&self, key: &str) -> Result<Option<Value>> {
        match self.services.store.get(key).await? {
            Some(text) => Ok(Some(codec::decode(&text)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, key: &str, value: &Value) -> Result<()> {
        self.services.store.set(key, codec::encode(value)?).await
    }

    // --- job list ---

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        let Some(value) = self.read(&self.keys.jobs).await? else {
            return Ok(Vec::new());
        };
        let items = value
            .as_list()
            .ok_or_else(|| Error::Store(format!("{} is not a list", self.keys.jobs)))?;
        items
            .iter()
            .map(|item| {
                item.as_job().cloned().ok_or_else(|| {
                    Error::Store(format!("{} holds a non-job entry", self.keys.jobs))
                })
            })
            .collect()
    }

    /// Append jobs to the job list in one locked mutation.
    pub async fn add_jobs(&self, jobs: &[Job]) -> Result<()> {
        synchronized(self.services.locks.as_ref(), &self.keys.jobs, self.lock_timeout, || async {
            let mut all = self.jobs().await?;
            all.extend_from_slice(jobs);
            let list = Value::List(all.into_iter().map(Value::Job).collect());
            self.write(&self.keys.jobs, &list).await
        })
        .await
    }

    // --- return values ---

    pub async fn return_values(&self) -> Result<ReturnValueTable> {
        let text = self.services.store.get(&self.keys.return_values).await?;
        ReturnValueTable::parse(text.as_deref())
    }

    /// Record `value` as the result of `job`.
    ///
    /// Fails with `NoRemoteRepresentation` before taking the lock when the
    /// value cannot be encoded.
    pub async fn set_return_value(&self, job: &Job, value: &Value) -> Result<()> {
        value.validate()?;
        debug!(job = %job, value = %value, "setting return value");
        let key = &self.keys.return_values;
        synchronized(self.services.locks.as_ref(), key, self.lock_timeout, || async {
            let mut table = self.return_values().await?;
            table.insert(job, value)?;
            self.services.store.set(key, table.to_text()?).await
        })
        .await
    }

    // --- counters ---

    pub async fn counter(&self, key: &str) -> Result<i64> {
        match self.read(key).await? {
            Some(value) => value
                .as_i64()
                .ok_or_else(|| Error::Store(format!("{key} is not an integer"))),
            None => Ok(0),
        }
    }

    pub async fn increment(&self, key: &str, by: i64) -> Result<i64> {
        synchronized(self.services.locks.as_ref(), key, self.lock_timeout, || async {
            let next = self.counter(key).await? + by;
            self.write(key, &Value::Int(next)).await?;
            Ok(next)
        })
        .await
    }

    // --- progress ---

    pub async fn progress(&self) -> Result<Option<String>> {
        self.services.store.get(&self.keys.progress).await
    }

    pub async fn set_progress(&self, text: String) -> Result<()> {
        self.services.store.set(&self.keys.progress, text).await
    }
}

#[async_trait]
impl ReturnValueSource for RunState {
    async fn return_values(&self) -> Result<ReturnValueTable> {
        RunState::return_values(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::{MemoryLocks, MemoryQueue, MemoryStore};
    use crate::sync::LOCK_TIMEOUT;
    use std::sync::Arc;

    fn state() -> RunState {
        let services = Services::new(
            Arc::new(MemoryQueue::new("mem")),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryLocks::new()),
        );
        RunState::new(services, "test:run", LOCK_TIMEOUT)
    }

    #[test]
    fn keys_follow_namespace_layout() {
        let keys = Keys::new("fibonacci:fib1");
        assert_eq!(keys.jobs, "fibonacci:fib1:jobs");
        assert_eq!(keys.return_values, "fibonacci:fib1:return_values");
        assert_eq!(keys.missing_result_count, "fibonacci:fib1:missing_result_count");
    }

    #[tokio::test]
    async fn job_list_appends_in_order() {
        let state = state();
        assert!(state.jobs().await.unwrap().is_empty());

        state.add_jobs(&[Job::new(1, "mem")]).await.unwrap();
        state.add_jobs(&[Job::new(2, "mem"), Job::new(3, "mem")]).await.unwrap();

        let ids: Vec<u64> = state.jobs().await.unwrap().iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn counters_start_at_zero() {
        let state = state();
        let key = state.keys().error_count.clone();
        assert_eq!(state.counter(&key).await.unwrap(), 0);
        assert_eq!(state.increment(&key, 3).await.unwrap(), 3);
        assert_eq!(state.increment(&key, 1).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn unencodable_return_value_is_rejected() {
        let state = state();
        let err = state
            .set_return_value(&Job::new(1, "mem"), &Value::Float(f64::INFINITY))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoRemoteRepresentation(_)));
        assert!(state.return_values().await.unwrap().is_empty());
    }
}
