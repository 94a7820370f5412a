//! Post-render transformation of rendered manifests
//!
//! Runs between Helm's template rendering and the apply: injects the
//! application identity labels, the log-collection annotation, and the mesh
//! sidecar label into the rendered documents. Toggling the sidecar label on
//! an existing workload requires deleting it first — the label lives in the
//! selector, and selectors on Deployments and StatefulSets are immutable.
//!
//! Cluster reads and deletes go through the injected [`WorkloadClient`];
//! all of their failures are logged and never fail the render.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{DeleteParams, DynamicObject};
use kube::discovery::ApiResource;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::HelmRelease;
use crate::Error;

use super::manifest::{doc_kind, doc_name, doc_namespace, parse_documents, serialize_documents};

/// Label carrying the application identity
pub const APP_ID_LABEL: &str = "oam.runtime.app.id";
/// Label carrying the component identity
pub const COMPONENT_ID_LABEL: &str = "oam.runtime.component.id";
/// Mesh sidecar injection label
pub const ISTIO_LABEL_KEY: &str = "istio-injection";
/// Value enabling sidecar injection
pub const ISTIO_LABEL_VALUE: &str = "enabled";
/// Annotation toggling log collection on workloads
pub const LOG_COLLECT_ANNOTATION: &str = "logCollect";

/// How long a deleted workload is awaited before the render proceeds
const DELETE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const DELETE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Workload kinds whose selectors are immutable and therefore need the
/// delete/recreate treatment on sidecar toggles
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkloadKind {
    /// apps/v1 Deployment
    Deployment,
    /// apps/v1 StatefulSet
    StatefulSet,
}

impl WorkloadKind {
    /// Parse a document kind, `None` for kinds the transformer leaves alone
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(Self::Deployment),
            "StatefulSet" => Some(Self::StatefulSet),
            _ => None,
        }
    }

    fn api_resource(&self) -> ApiResource {
        let (kind, plural) = match self {
            Self::Deployment => ("Deployment", "deployments"),
            Self::StatefulSet => ("StatefulSet", "statefulsets"),
        };
        ApiResource {
            group: "apps".to_string(),
            version: "v1".to_string(),
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }
}

/// Everything the transformer needs to know about the release, serialized
/// into the `post-render` subcommand invocation
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PostRenderSpec {
    /// Namespace the release is deployed into
    pub namespace: String,
    /// Application identity (written even when empty)
    pub app_id: String,
    /// Component identity (written even when empty)
    pub component_id: String,
    /// Desired sidecar injection state
    pub istio_enabled: bool,
    /// Desired log collection state
    pub log_collect: bool,
}

impl PostRenderSpec {
    /// Build the inject-spec for a HelmRelease
    pub fn from_release(hr: &HelmRelease) -> Self {
        Self {
            namespace: hr.target_namespace(),
            app_id: hr.spec.app_id.clone(),
            component_id: hr.spec.component_id.clone(),
            istio_enabled: hr.spec.istio_enabled,
            log_collect: hr.spec.log_collect,
        }
    }
}

/// Live-cluster side of the transformer: read template labels, delete and
/// await disappearance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkloadClient: Send + Sync {
    /// Pod template labels of the live workload, `None` when it does not
    /// exist
    async fn template_labels(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error>;

    /// Delete the live workload and wait until it is gone (bounded)
    async fn delete_and_wait(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error>;
}

/// Workload client backed by the Kubernetes API
pub struct KubeWorkloadClient {
    client: Client,
}

impl KubeWorkloadClient {
    /// Create a client over the given connection
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api_for(&self, kind: WorkloadKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

#[async_trait]
impl WorkloadClient for KubeWorkloadClient {
    async fn template_labels(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, Error> {
        match self.api_for(kind, namespace).get(name).await {
            Ok(obj) => {
                let labels = obj
                    .data
                    .pointer("/spec/template/metadata/labels")
                    .and_then(|v| v.as_object())
                    .map(|m| {
                        m.iter()
                            .filter_map(|(k, v)| {
                                v.as_str().map(|s| (k.clone(), s.to_string()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Some(labels))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_and_wait(
        &self,
        kind: WorkloadKind,
        namespace: &str,
        name: &str,
    ) -> Result<(), Error> {
        let api = self.api_for(kind, namespace);
        api.delete(name, &DeleteParams::default()).await?;

        // Poll until the object is gone; on timeout the render proceeds
        // anyway and the apply resolves the remainder.
        let deadline = tokio::time::Instant::now() + DELETE_WAIT_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            match api.get(name).await {
                Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                Err(e) => return Err(e.into()),
                Ok(_) => tokio::time::sleep(DELETE_WAIT_INTERVAL).await,
            }
        }
        debug!(?kind, namespace, name, "deleted workload still present after wait");
        Ok(())
    }
}

/// Ensure a nested mapping exists at the given path, creating levels as
/// needed, and return it
fn ensure_mapping<'a>(value: &'a mut Value, path: &[&str]) -> &'a mut Mapping {
    let mut current = value;
    for segment in path {
        if !matches!(current, Value::Mapping(_)) {
            *current = Value::Mapping(Mapping::new());
        }
        let Value::Mapping(map) = current else {
            unreachable!("just coerced to mapping")
        };
        let key = Value::String((*segment).to_string());
        if !matches!(map.get(&key), Some(Value::Mapping(_))) {
            map.insert(key.clone(), Value::Mapping(Mapping::new()));
        }
        current = match map.get_mut(&key) {
            Some(next) => next,
            None => unreachable!("just inserted"),
        };
    }
    if !matches!(current, Value::Mapping(_)) {
        *current = Value::Mapping(Mapping::new());
    }
    let Value::Mapping(map) = current else {
        unreachable!("just coerced to mapping")
    };
    map
}

fn set_entry(map: &mut Mapping, key: &str, value: &str) {
    map.insert(
        Value::String(key.to_string()),
        Value::String(value.to_string()),
    );
}

/// Inject appId/componentId into the selector and template labels of a
/// workload document
fn inject_app_info(doc: &mut Value, spec: &PostRenderSpec) {
    for path in [
        &["spec", "selector", "matchLabels"][..],
        &["spec", "template", "metadata", "labels"][..],
    ] {
        let labels = ensure_mapping(doc, path);
        set_entry(labels, APP_ID_LABEL, &spec.app_id);
        set_entry(labels, COMPONENT_ID_LABEL, &spec.component_id);
    }
}

/// Inject the sidecar label into the selector and template labels of a
/// workload document
fn inject_istio(doc: &mut Value) {
    for path in [
        &["spec", "selector", "matchLabels"][..],
        &["spec", "template", "metadata", "labels"][..],
    ] {
        let labels = ensure_mapping(doc, path);
        set_entry(labels, ISTIO_LABEL_KEY, ISTIO_LABEL_VALUE);
    }
}

/// Reconcile the sidecar label of one workload document against the live
/// cluster state. Deletes the live object when the toggle flipped; every
/// failure is logged and leaves the document as rendered.
async fn reconcile_istio(
    doc: &mut Value,
    kind: WorkloadKind,
    spec: &PostRenderSpec,
    client: &dyn WorkloadClient,
) {
    let Some(name) = doc_name(doc).map(|s| s.to_string()) else {
        return;
    };
    let namespace = doc_namespace(doc)
        .unwrap_or(spec.namespace.as_str())
        .to_string();

    let live = match client.template_labels(kind, &namespace, &name).await {
        Ok(live) => live,
        Err(e) => {
            warn!(error = %e, %name, "could not inspect live workload");
            return;
        }
    };

    match live {
        None => {
            if spec.istio_enabled {
                inject_istio(doc);
            }
        }
        Some(labels) => {
            let live_enabled =
                labels.get(ISTIO_LABEL_KEY).map(String::as_str) == Some(ISTIO_LABEL_VALUE);
            if spec.istio_enabled {
                if !live_enabled {
                    if let Err(e) = client.delete_and_wait(kind, &namespace, &name).await {
                        warn!(error = %e, %name, "could not recreate workload for sidecar enable");
                        return;
                    }
                }
                inject_istio(doc);
            } else if live_enabled {
                if let Err(e) = client.delete_and_wait(kind, &namespace, &name).await {
                    warn!(error = %e, %name, "could not recreate workload for sidecar disable");
                }
            }
        }
    }
}

/// Transform a rendered manifest buffer.
///
/// Injection is idempotent: running the transformer on its own output
/// yields the same bytes.
pub async fn transform(
    spec: &PostRenderSpec,
    client: &dyn WorkloadClient,
    input: &str,
) -> Result<String, Error> {
    let mut docs = parse_documents(input);

    for doc in &mut docs {
        // Identity labels go onto every object.
        let labels = ensure_mapping(doc, &["metadata", "labels"]);
        set_entry(labels, APP_ID_LABEL, &spec.app_id);
        set_entry(labels, COMPONENT_ID_LABEL, &spec.component_id);

        let Some(kind) = doc_kind(doc).and_then(WorkloadKind::from_kind) else {
            continue;
        };

        let annotations = ensure_mapping(doc, &["metadata", "annotations"]);
        set_entry(
            annotations,
            LOG_COLLECT_ANNOTATION,
            if spec.log_collect { "true" } else { "false" },
        );

        inject_app_info(doc, spec);
        reconcile_istio(doc, kind, spec, client).await;
    }

    Ok(serialize_documents(&docs))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RENDERED: &str = r#"---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: podinfo
spec:
  selector:
    matchLabels:
      app: podinfo
  template:
    metadata:
      labels:
        app: podinfo
    spec:
      containers:
        - name: podinfo
          image: podinfo:1.0.0
---
apiVersion: v1
kind: Service
metadata:
  name: podinfo
spec:
  ports:
    - port: 80
"#;

    fn spec() -> PostRenderSpec {
        PostRenderSpec {
            namespace: "apps".to_string(),
            app_id: "shop".to_string(),
            component_id: "frontend".to_string(),
            istio_enabled: false,
            log_collect: false,
        }
    }

    fn absent_live() -> MockWorkloadClient {
        let mut client = MockWorkloadClient::new();
        client.expect_template_labels().returning(|_, _, _| Ok(None));
        client
    }

    fn labels_of(doc: &Value, path: &[&str]) -> BTreeMap<String, String> {
        let mut current = Some(doc);
        for seg in path {
            current = current.and_then(|v| v.get(seg));
        }
        current
            .and_then(Value::as_mapping)
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| {
                        Some((k.as_str()?.to_string(), v.as_str()?.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    // =========================================================================
    // Identity Injection Stories
    // =========================================================================

    /// Story: every rendered object gets the identity labels, workloads
    /// additionally get them in selector and template
    #[tokio::test]
    async fn story_identity_labels_are_injected_everywhere() {
        let out = transform(&spec(), &absent_live(), RENDERED).await.unwrap();
        let docs = parse_documents(&out);

        for doc in &docs {
            let labels = labels_of(doc, &["metadata", "labels"]);
            assert_eq!(labels.get(APP_ID_LABEL).map(String::as_str), Some("shop"));
            assert_eq!(
                labels.get(COMPONENT_ID_LABEL).map(String::as_str),
                Some("frontend")
            );
        }

        let deployment = &docs[0];
        let selector = labels_of(deployment, &["spec", "selector", "matchLabels"]);
        let template = labels_of(deployment, &["spec", "template", "metadata", "labels"]);
        for labels in [&selector, &template] {
            assert_eq!(labels.get(APP_ID_LABEL).map(String::as_str), Some("shop"));
            // pre-existing labels survive
            assert_eq!(labels.get("app").map(String::as_str), Some("podinfo"));
        }
    }

    /// Story: empty identities are still written; the labels always exist
    #[tokio::test]
    async fn story_empty_identity_labels_are_still_set() {
        let empty = PostRenderSpec {
            app_id: String::new(),
            component_id: String::new(),
            ..spec()
        };
        let out = transform(&empty, &absent_live(), RENDERED).await.unwrap();
        let docs = parse_documents(&out);
        let labels = labels_of(&docs[0], &["metadata", "labels"]);
        assert_eq!(labels.get(APP_ID_LABEL).map(String::as_str), Some(""));
    }

    /// Story: the log-collect annotation goes onto workloads only, as a
    /// stringified boolean
    #[tokio::test]
    async fn story_log_collect_annotation_on_workloads_only() {
        let collecting = PostRenderSpec {
            log_collect: true,
            ..spec()
        };
        let out = transform(&collecting, &absent_live(), RENDERED)
            .await
            .unwrap();
        let docs = parse_documents(&out);

        let deployment_annotations = labels_of(&docs[0], &["metadata", "annotations"]);
        assert_eq!(
            deployment_annotations
                .get(LOG_COLLECT_ANNOTATION)
                .map(String::as_str),
            Some("true")
        );
        let service_annotations = labels_of(&docs[1], &["metadata", "annotations"]);
        assert!(service_annotations.get(LOG_COLLECT_ANNOTATION).is_none());
    }

    /// Story: running the transformer on its own output changes nothing
    /// (idempotence invariant)
    #[tokio::test]
    async fn story_transform_is_idempotent() {
        let istio = PostRenderSpec {
            istio_enabled: true,
            log_collect: true,
            ..spec()
        };
        let once = transform(&istio, &absent_live(), RENDERED).await.unwrap();
        let twice = transform(&istio, &absent_live(), &once).await.unwrap();
        assert_eq!(once, twice);
    }

    // =========================================================================
    // Sidecar Toggle Stories
    // =========================================================================
    //
    // The sidecar label lives in the immutable selector, so flipping the
    // toggle on an existing workload destroys and recreates it.

    /// Story: no live workload and istio on - labels are injected, nothing
    /// is deleted
    #[tokio::test]
    async fn story_fresh_workload_gets_sidecar_label() {
        let mut client = MockWorkloadClient::new();
        client.expect_template_labels().returning(|_, _, _| Ok(None));
        client.expect_delete_and_wait().never();

        let istio = PostRenderSpec {
            istio_enabled: true,
            ..spec()
        };
        let out = transform(&istio, &client, RENDERED).await.unwrap();
        let docs = parse_documents(&out);
        let selector = labels_of(&docs[0], &["spec", "selector", "matchLabels"]);
        assert_eq!(
            selector.get(ISTIO_LABEL_KEY).map(String::as_str),
            Some(ISTIO_LABEL_VALUE)
        );
    }

    /// Story: live workload without the label and istio on - the live
    /// object is deleted before the labeled rendering goes out
    #[tokio::test]
    async fn story_enabling_sidecar_recreates_workload() {
        let mut client = MockWorkloadClient::new();
        client.expect_template_labels().returning(|_, _, _| {
            Ok(Some(BTreeMap::from([(
                "app".to_string(),
                "podinfo".to_string(),
            )])))
        });
        client
            .expect_delete_and_wait()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let istio = PostRenderSpec {
            istio_enabled: true,
            ..spec()
        };
        let out = transform(&istio, &client, RENDERED).await.unwrap();
        let docs = parse_documents(&out);
        let template = labels_of(&docs[0], &["spec", "template", "metadata", "labels"]);
        assert_eq!(
            template.get(ISTIO_LABEL_KEY).map(String::as_str),
            Some(ISTIO_LABEL_VALUE)
        );
    }

    /// Story: live workload with the label and istio off - the live object
    /// is deleted and the rendering stays unlabeled
    #[tokio::test]
    async fn story_disabling_sidecar_recreates_workload_unlabeled() {
        let mut client = MockWorkloadClient::new();
        client.expect_template_labels().returning(|_, _, _| {
            Ok(Some(BTreeMap::from([(
                ISTIO_LABEL_KEY.to_string(),
                ISTIO_LABEL_VALUE.to_string(),
            )])))
        });
        client
            .expect_delete_and_wait()
            .times(1)
            .returning(|_, _, _| Ok(()));

        let out = transform(&spec(), &client, RENDERED).await.unwrap();
        let docs = parse_documents(&out);
        let selector = labels_of(&docs[0], &["spec", "selector", "matchLabels"]);
        assert!(selector.get(ISTIO_LABEL_KEY).is_none());
    }

    /// Story: live workload already labeled and istio on - nothing is
    /// deleted, labels stay
    #[tokio::test]
    async fn story_matching_sidecar_state_is_left_alone() {
        let mut client = MockWorkloadClient::new();
        client.expect_template_labels().returning(|_, _, _| {
            Ok(Some(BTreeMap::from([(
                ISTIO_LABEL_KEY.to_string(),
                ISTIO_LABEL_VALUE.to_string(),
            )])))
        });
        client.expect_delete_and_wait().never();

        let istio = PostRenderSpec {
            istio_enabled: true,
            ..spec()
        };
        transform(&istio, &client, RENDERED).await.unwrap();
    }

    /// Story: cluster failures never fail the render; the document goes out
    /// as rendered
    #[tokio::test]
    async fn story_cluster_errors_do_not_fail_the_render() {
        let mut client = MockWorkloadClient::new();
        client
            .expect_template_labels()
            .returning(|_, _, _| Err(Error::action_failure("apiserver unavailable")));

        let istio = PostRenderSpec {
            istio_enabled: true,
            ..spec()
        };
        let out = transform(&istio, &client, RENDERED).await.unwrap();
        assert!(out.contains("kind: Deployment"));
    }
}
