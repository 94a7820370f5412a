//! Per-release serialization
//!
//! One mutex per `<namespace>/<name>` key, created on demand. A worker holds
//! the guard for the whole sync, which makes reconciliations of the same
//! release strictly sequential across all workers while different releases
//! proceed in parallel. Single-replica assumption: nothing here survives the
//! process.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Map of per-key mutexes
#[derive(Default)]
pub struct KeyedLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock map
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a key, waiting until it is free. The returned
    /// guard releases the lock on drop, on every exit path.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Story: two workers on the same release never overlap; the critical
    /// section admits one at a time
    #[tokio::test]
    async fn story_same_key_is_mutually_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.lock("apps/podinfo").await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.expect("worker");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1, "at most one concurrent sync per key");
    }

    /// Story: different releases are processed in parallel
    #[tokio::test]
    async fn story_different_keys_run_in_parallel() {
        let locks = Arc::new(KeyedLocks::new());

        let first = locks.lock("apps/one").await;
        // If keys shared a lock this would deadlock the test.
        let second = locks.lock("apps/two").await;

        drop(first);
        drop(second);
    }

    /// The guard releases on drop, letting the next waiter in
    #[tokio::test]
    async fn guard_releases_on_drop() {
        let locks = KeyedLocks::new();
        drop(locks.lock("apps/podinfo").await);
        // Second acquisition must not block.
        let _guard = locks.lock("apps/podinfo").await;
    }
}
