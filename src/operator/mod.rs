//! Work queue controller for HelmRelease resources
//!
//! Watch events feed a deduplicating, rate-limited queue of
//! `<namespace>/<name>` keys; a fixed number of workers drain it. Before a
//! worker enters the sync pipeline it takes the per-key lock, so events on
//! the same release are processed strictly in order with no overlap, while
//! different releases proceed in parallel.

mod events;
mod lock;
mod queue;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use kube::runtime::events::EventType;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher, FAILED_RELEASE_SYNC, RELEASE_SYNCED};
pub use lock::KeyedLocks;
pub use queue::WorkQueue;

use crate::chartsync::GitChartSync;
use crate::crd::HelmRelease;
use crate::metrics::Metrics;
use crate::release::Release;
use crate::status::StatusClient;

/// Split a work queue key into (namespace, name)
fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
            Some((namespace, name))
        }
        _ => None,
    }
}

/// Whether an update event warrants a reconciliation.
///
/// Status-only updates are dropped: the operator writes status itself, and
/// the dry-run that decides on an upgrade is expensive. Updates with no
/// visible change at all still pass so the periodic refresh can detect and
/// undo chart mutations.
fn should_enqueue_update(old: &HelmRelease, new: &HelmRelease) -> bool {
    !(old.spec == new.spec && old.status != new.status)
}

/// The operator: event intake, queue, and workers
pub struct Operator {
    client: Client,
    release: Arc<Release>,
    git: Arc<GitChartSync>,
    status: Arc<dyn StatusClient>,
    events: Arc<dyn EventPublisher>,
    metrics: Arc<Metrics>,
    queue: Arc<WorkQueue>,
    locks: KeyedLocks,
    known: Mutex<HashMap<String, Arc<HelmRelease>>>,
}

impl Operator {
    /// Create the operator
    pub fn new(
        client: Client,
        release: Arc<Release>,
        git: Arc<GitChartSync>,
        status: Arc<dyn StatusClient>,
        events: Arc<dyn EventPublisher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            release,
            git,
            status,
            events,
            metrics,
            queue: Arc::new(WorkQueue::new()),
            locks: KeyedLocks::new(),
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Run the event loop and `threadiness` workers until the shutdown
    /// token fires, then drain in-flight work and return.
    pub async fn run(self: Arc<Self>, threadiness: usize, shutdown: CancellationToken) {
        info!(threadiness, "starting operator");

        let event_loop = {
            let operator = self.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { operator.event_loop(shutdown).await })
        };

        let mut workers = JoinSet::new();
        for id in 0..threadiness {
            let operator = self.clone();
            workers.spawn(async move { operator.worker(id).await });
        }

        shutdown.cancelled().await;
        info!("stopping workers");
        self.queue.shut_down();
        while workers.join_next().await.is_some() {}
        event_loop.abort();
        info!("operator stopped");
    }

    async fn event_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let api: Api<HelmRelease> = Api::all(self.client.clone());
        let stream = watcher(api, watcher::Config::default()).default_backoff();
        tokio::pin!(stream);

        info!("watching HelmRelease resources");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = stream.next() => match event {
                    Some(Ok(event)) => self.handle_event(event).await,
                    Some(Err(e)) => warn!(error = %e, "watch error"),
                    None => break,
                },
            }
        }
    }

    async fn handle_event(&self, event: watcher::Event<HelmRelease>) {
        match event {
            watcher::Event::Init | watcher::Event::InitDone => {}
            watcher::Event::InitApply(hr) | watcher::Event::Apply(hr) => {
                self.handle_apply(hr).await;
            }
            watcher::Event::Delete(hr) => self.handle_delete(hr).await,
        }
    }

    async fn handle_apply(&self, hr: HelmRelease) {
        let key = hr.queue_key();
        let hr = Arc::new(hr);
        let previous = self
            .known
            .lock()
            .expect("known map lock poisoned")
            .insert(key.clone(), hr.clone());

        match previous {
            None => {
                debug!(%key, "HelmRelease added");
                self.metrics.inc_release_count();
            }
            Some(old) => {
                if !should_enqueue_update(&old, &hr) {
                    return;
                }
                // A changed chart source can leave the git mirror behind
                // upstream; sync it before reconciling to avoid a spurious
                // deploy from a stale ref.
                if old.spec.chart != hr.spec.chart {
                    if let Some(git_source) = &hr.spec.chart.git {
                        if let Err(e) = self.git.sync_mirror(git_source).await {
                            warn!(error = %e, %key, "failed to pre-sync git mirror");
                        }
                    }
                }
            }
        }

        self.queue.add(key);
        self.metrics.set_queue_length(self.queue.len());
    }

    async fn handle_delete(&self, hr: HelmRelease) {
        let key = hr.queue_key();
        self.known
            .lock()
            .expect("known map lock poisoned")
            .remove(&key);
        self.metrics.dec_release_count();

        info!(%key, "HelmRelease deleted, uninstalling release");
        if let Err(e) = self.release.uninstall(&hr).await {
            error!(error = %e, %key, "failed to uninstall release of deleted resource");
        }
        if let Err(e) = self.status.clear_conditions(&hr).await {
            warn!(error = %e, %key, "failed to clear conditions of deleted resource");
        }
    }

    async fn worker(&self, id: usize) {
        debug!(worker = id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.metrics.set_queue_length(self.queue.len());
            self.process(&key).await;
            self.queue.done(&key);
        }
        debug!(worker = id, "worker stopped");
    }

    async fn process(&self, key: &str) {
        if split_key(key).is_none() {
            // Malformed keys are never retried.
            warn!(%key, "invalid work queue key");
            self.queue.forget(key);
            return;
        }

        let _guard = self.locks.lock(key).await;

        let hr = self
            .known
            .lock()
            .expect("known map lock poisoned")
            .get(key)
            .cloned();
        let Some(hr) = hr else {
            info!(%key, "HelmRelease referred to in work queue no longer exists");
            self.queue.forget(key);
            return;
        };

        match self.release.sync(&hr).await {
            Ok(()) => {
                self.events
                    .publish(
                        &hr,
                        EventType::Normal,
                        RELEASE_SYNCED,
                        format!(
                            "managed release '{}' in namespace '{}' synchronized",
                            hr.release_name(),
                            hr.target_namespace()
                        ),
                    )
                    .await;
                self.queue.forget(key);
            }
            Err(e) => {
                error!(error = %e, %key, "failed to sync HelmRelease");
                self.events
                    .publish(
                        &hr,
                        EventType::Warning,
                        FAILED_RELEASE_SYNC,
                        format!(
                            "synchronization of release '{}' in namespace '{}' failed: {}",
                            hr.release_name(),
                            hr.target_namespace(),
                            e
                        ),
                    )
                    .await;
                self.queue.add_rate_limited(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ChartSource, HelmReleasePhase, HelmReleaseSpec, HelmReleaseStatus, RepoChartSource};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn release(generation: i64) -> HelmRelease {
        HelmRelease {
            metadata: ObjectMeta {
                name: Some("podinfo".to_string()),
                namespace: Some("apps".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: HelmReleaseSpec {
                chart: ChartSource {
                    repo: Some(RepoChartSource {
                        repository: "https://charts.example.com".to_string(),
                        name: "podinfo".to_string(),
                        version: "1.0.0".to_string(),
                    }),
                    ..Default::default()
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn split_key_requires_namespace_and_name() {
        assert_eq!(split_key("apps/podinfo"), Some(("apps", "podinfo")));
        assert_eq!(split_key("no-slash"), None);
        assert_eq!(split_key("/name-only"), None);
        assert_eq!(split_key("namespace-only/"), None);
    }

    // =========================================================================
    // Update Filtering Stories
    // =========================================================================

    /// Story: the operator's own status writes do not cause another
    /// reconciliation
    #[test]
    fn story_status_only_updates_are_dropped() {
        let old = release(1);
        let mut new = release(1);
        new.status = Some(HelmReleaseStatus {
            phase: Some(HelmReleasePhase::Succeeded),
            ..Default::default()
        });
        assert!(!should_enqueue_update(&old, &new));
    }

    /// Story: a spec edit reconciles even when the status changed too
    #[test]
    fn story_spec_changes_enqueue() {
        let old = release(1);
        let mut new = release(2);
        new.spec.timeout = Some(600);
        new.status = Some(HelmReleaseStatus::default());
        assert!(should_enqueue_update(&old, &new));
    }

    /// Story: a periodic refresh with no visible change still reconciles,
    /// so out-of-band chart mutations are detected and undone
    #[test]
    fn story_no_change_refresh_still_enqueues() {
        let old = release(1);
        let new = release(1);
        assert!(should_enqueue_update(&old, &new));
    }
}
