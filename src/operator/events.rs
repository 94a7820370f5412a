//! Kubernetes Event publishing
//!
//! Wraps `kube::runtime::events::Recorder` behind a trait so workers can
//! emit events without a cluster in tests. Events are fire-and-forget: a
//! failed publish is a warning, never a reconciliation failure.

use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

use crate::crd::HelmRelease;

/// Event reason recorded after a successful sync
pub const RELEASE_SYNCED: &str = "ReleaseSynced";
/// Event reason recorded after a failed sync
pub const FAILED_RELEASE_SYNC: &str = "FailedReleaseSync";

/// Publisher of Kubernetes Events on HelmRelease resources
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event on the given resource
    async fn publish(&self, hr: &HelmRelease, type_: EventType, reason: &str, note: String);
}

/// Publisher backed by the cluster's event API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as the given controller name
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, hr: &HelmRelease, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Sync".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &hr.object_ref(&())).await {
            warn!(reason, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// No-op publisher for tests
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _hr: &HelmRelease, _type_: EventType, _reason: &str, _note: String) {}
}
