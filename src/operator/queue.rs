//! Deduplicating, rate-limited work queue
//!
//! Keys wait in FIFO order; a key that is added while it is being processed
//! is re-queued when processing finishes instead of running concurrently,
//! and a key that is already waiting is not added twice. Failed items come
//! back through [`WorkQueue::add_rate_limited`] with per-item exponential
//! backoff; [`WorkQueue::forget`] resets the backoff after a success.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Base delay of the per-item backoff
const BASE_DELAY: Duration = Duration::from_secs(1);
/// Cap of the per-item backoff
const MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutdown: bool,
}

/// Work queue of namespaced-name keys
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
        }
    }

    /// Add a key. Duplicate of a waiting key: dropped. Key currently being
    /// processed: deferred until `done`.
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock().expect("queue lock poisoned");
        if state.shutdown || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Re-add a key after a failure, delayed by its exponential backoff
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            if state.shutdown {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            backoff_for(*failures)
        };
        debug!(%key, ?delay, "re-queueing with backoff");
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Number of recorded consecutive failures for a key
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Drop the failure history of a key (after a successful run)
    pub fn forget(&self, key: &str) {
        self.state
            .lock()
            .expect("queue lock poisoned")
            .failures
            .remove(key);
    }

    /// Number of keys waiting (not counting in-flight ones)
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock poisoned").queue.len()
    }

    /// Whether no keys are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key. Returns `None` once the queue is shut down
    /// and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    // Wake another waiter in case more items are queued.
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutdown {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key as processed. A key re-added while it was in flight goes
    /// back to the end of the queue.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutdown {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop accepting keys and wake all waiting workers. In-flight and
    /// already-queued items still complete.
    pub fn shut_down(&self) {
        self.state.lock().expect("queue lock poisoned").shutdown = true;
        self.notify.notify_waiters();
    }
}

fn backoff_for(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = BASE_DELAY * 2u32.saturating_pow(exp);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Queue Semantics Stories
    // =========================================================================

    /// Story: a burst of identical events collapses into one work item
    #[tokio::test]
    async fn story_duplicate_keys_are_deduplicated() {
        let queue = WorkQueue::new();
        queue.add("apps/podinfo");
        queue.add("apps/podinfo");
        queue.add("apps/podinfo");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("apps/podinfo"));
        assert!(queue.is_empty());
    }

    /// Story: an event arriving while the key is being processed does not
    /// run concurrently; it is deferred until done() and then re-queued
    #[tokio::test]
    async fn story_in_flight_key_is_deferred_not_parallel() {
        let queue = WorkQueue::new();
        queue.add("apps/podinfo");
        let key = queue.get().await.expect("queued item");

        // Event arrives mid-processing.
        queue.add("apps/podinfo");
        assert!(queue.is_empty(), "key must not be queued while in flight");

        queue.done(&key);
        assert_eq!(queue.len(), 1, "deferred key re-queued on done");
        assert_eq!(queue.get().await.as_deref(), Some("apps/podinfo"));
    }

    /// Story: keys come out in the order they went in
    #[tokio::test]
    async fn story_fifo_order() {
        let queue = WorkQueue::new();
        queue.add("a/1");
        queue.add("b/2");
        queue.add("c/3");

        assert_eq!(queue.get().await.as_deref(), Some("a/1"));
        assert_eq!(queue.get().await.as_deref(), Some("b/2"));
        assert_eq!(queue.get().await.as_deref(), Some("c/3"));
    }

    /// Story: failures back off exponentially, success resets the budget
    #[tokio::test]
    async fn story_failure_backoff_grows_and_resets() {
        let queue = Arc::new(WorkQueue::new());

        queue.add_rate_limited("apps/podinfo");
        queue.add_rate_limited("apps/podinfo");
        queue.add_rate_limited("apps/podinfo");
        assert_eq!(queue.num_requeues("apps/podinfo"), 3);

        queue.forget("apps/podinfo");
        assert_eq!(queue.num_requeues("apps/podinfo"), 0);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_for(1), Duration::from_secs(1));
        assert_eq!(backoff_for(2), Duration::from_secs(2));
        assert_eq!(backoff_for(5), Duration::from_secs(16));
        assert_eq!(backoff_for(20), MAX_DELAY);
    }

    /// Story: a rate-limited item eventually comes back
    #[tokio::test(start_paused = true)]
    async fn story_rate_limited_item_returns_after_delay() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_rate_limited("apps/podinfo");
        assert!(queue.is_empty(), "item is delayed, not queued immediately");

        // First failure backs off one second.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.get().await.as_deref(), Some("apps/podinfo"));
    }

    /// Story: shutdown wakes blocked workers with None and drops new adds
    #[tokio::test]
    async fn story_shutdown_releases_workers() {
        let queue = Arc::new(WorkQueue::new());
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        // Give the worker a chance to block.
        tokio::task::yield_now().await;
        queue.shut_down();
        assert_eq!(worker.await.expect("worker"), None);

        queue.add("apps/late");
        assert!(queue.is_empty(), "adds after shutdown are dropped");
    }

    /// Story: queued items drain before workers see the shutdown
    #[tokio::test]
    async fn story_shutdown_drains_queued_items() {
        let queue = WorkQueue::new();
        queue.add("apps/podinfo");
        queue.shut_down();

        assert_eq!(queue.get().await.as_deref(), Some("apps/podinfo"));
        assert_eq!(queue.get().await, None);
    }
}
