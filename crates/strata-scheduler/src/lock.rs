//! Scoped cluster-wide mutual exclusion.

use crate::config::LockScope;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use strata_core::Result;
use strata_core::ports::LockService;
use tracing::{debug, warn};
use uuid::Uuid;

/// Root of every lock path taken by the scheduler.
pub const LOCK_ROOT: &str = "/strata/agents";

/// Lock path guarding agent selection for jobs requiring `tags`.
pub fn lock_key(scope: LockScope, tags: &[String]) -> String {
    match scope {
        LockScope::Global => LOCK_ROOT.to_string(),
        LockScope::Tags => {
            let mut sorted: Vec<&str> = tags.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            sorted.dedup();
            if sorted.is_empty() {
                format!("{}/_", LOCK_ROOT)
            } else {
                format!("{}/{}", LOCK_ROOT, sorted.join(","))
            }
        }
    }
}

/// Runs critical sections under a [`LockService`] lock owned by this
/// scheduler instance.
pub struct DistributedLock {
    service: Arc<dyn LockService>,
    owner: String,
}

impl DistributedLock {
    pub fn new(service: Arc<dyn LockService>) -> Self {
        Self {
            service,
            owner: format!("scheduler-{}", Uuid::new_v4()),
        }
    }

    /// Acquire `key`, run `f`, release.
    ///
    /// The lock is released however `f` ends, including by panic, which is
    /// resumed after release. Fails with `LockTimeout` without running `f`
    /// when the lock is not obtained within `timeout`. Not reentrant.
    pub async fn with_lock<F, Fut, T>(&self, key: &str, timeout: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.service.acquire(key, &self.owner, timeout).await?;
        debug!(key, owner = %self.owner, "Lock acquired");

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;

        if let Err(e) = self.service.release(key, &self.owner).await {
            warn!(key, error = %e, "Failed to release lock");
        } else {
            debug!(key, "Lock released");
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryLockService;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::Error;

    fn tags(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(lock_key(LockScope::Global, &tags(&["linux"])), "/strata/agents");
        assert_eq!(
            lock_key(LockScope::Tags, &tags(&["linux", "docker", "linux"])),
            "/strata/agents/docker,linux"
        );
        assert_eq!(lock_key(LockScope::Tags, &[]), "/strata/agents/_");
    }

    #[tokio::test]
    async fn test_critical_sections_do_not_overlap() {
        let service = Arc::new(InMemoryLockService::new());
        let lock = Arc::new(DistributedLock::new(service));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (lock, inside, overlaps) = (lock.clone(), inside.clone(), overlaps.clone());
            handles.push(tokio::spawn(async move {
                lock.with_lock(LOCK_ROOT, Duration::from_secs(5), move || async move {
                    if inside.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timeout_skips_critical_section() {
        let service = Arc::new(InMemoryLockService::new());
        service
            .acquire(LOCK_ROOT, "someone-else", Duration::from_secs(1))
            .await
            .unwrap();

        let lock = DistributedLock::new(service);
        let ran = AtomicUsize::new(0);
        let counter = &ran;
        let err = lock
            .with_lock(LOCK_ROOT, Duration::from_millis(20), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::LockTimeout(_)));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_released_after_error_and_panic() {
        let service = Arc::new(InMemoryLockService::new());
        let lock = Arc::new(DistributedLock::new(service.clone()));

        let result: Result<Result<()>> = lock
            .with_lock(LOCK_ROOT, Duration::from_secs(1), || async {
                Err(Error::Internal("boom".to_string()))
            })
            .await;
        assert!(result.unwrap().is_err());
        assert!(!service.exists(LOCK_ROOT).await.unwrap());

        let panicking = lock.clone();
        let joined = tokio::spawn(async move {
            panicking
                .with_lock::<_, _, ()>(LOCK_ROOT, Duration::from_secs(1), || async {
                    panic!("critical section failed");
                })
                .await
        })
        .await;
        assert!(joined.is_err());
        assert!(!service.exists(LOCK_ROOT).await.unwrap());
    }
}
