//! Lock-guarded read-modify-write over shared run state.

use opentelemetry::KeyValue;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::services::LockService;
use crate::telemetry::metrics;

/// How long a single lock attempt waits before reporting `Locked`.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Run `body` while holding the lock named `key`.
///
/// A `Locked` failure is logged and retried immediately, with no deadline and
/// no backoff. Any other lock service error is returned.
pub async fn synchronized<F, Fut, T>(
    locks: &dyn LockService,
    key: &str,
    timeout: Duration,
    body: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let guard = loop {
        match locks.acquire(key, timeout).await {
            Ok(guard) => break guard,
            Err(Error::Locked(_)) => {
                warn!(key, "failed to get lock, trying again");
                metrics::lock_contention().add(1, &[KeyValue::new("key", key.to_string())]);
            }
            Err(e) => return Err(e),
        }
    };

    let result = body().await;
    drop(guard);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::LockGuard;
    use crate::services::memory::MemoryLocks;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports `Locked` a fixed number of times before succeeding.
    struct FlakyLocks {
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl LockService for FlakyLocks {
        async fn acquire(&self, name: &str, _timeout: Duration) -> Result<LockGuard> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::Locked(name.to_string()));
            }
            Ok(LockGuard::noop())
        }
    }

    #[tokio::test]
    async fn retries_until_lock_acquired() {
        let locks = FlakyLocks {
            failures_left: AtomicU32::new(3),
            attempts: AtomicU32::new(0),
        };

        let value = synchronized(&locks, "k", LOCK_TIMEOUT, || async { Ok(42) })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(locks.attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn body_errors_propagate() {
        let locks = MemoryLocks::new();
        let result: Result<()> = synchronized(&locks, "k", LOCK_TIMEOUT, || async {
            Err(Error::Other("body failed".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::Other(_))));
    }

    #[tokio::test]
    async fn same_key_bodies_do_not_interleave() {
        let locks = Arc::new(MemoryLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let mut tasks = tokio::task::JoinSet::new();

        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let inside = Arc::clone(&inside);
            tasks.spawn(async move {
                synchronized(locks.as_ref(), "shared", LOCK_TIMEOUT, || async {
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    }
}
