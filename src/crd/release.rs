//! HelmRelease Custom Resource Definition
//!
//! A HelmRelease declares the desired state of one Helm-managed workload:
//! where the chart comes from, how it is configured, and how failures are
//! handled. The operator owns the status subresource; the spec is read-only.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ChartSource, HelmReleaseCondition, HelmReleasePhase, HelmVersion, RollbackSpec, TestSpec,
    ValuesFromSource,
};

/// Annotation that triggers a Helm v2 to v3 migration. The literal value
/// `"true"` performs the conversion; any other value runs it in dry-run mode.
pub const MIGRATE_ANNOTATION: &str = "helm.fluxcd.io/migrate";

/// Annotation the engine writes to every released object, recording which
/// HelmRelease produced it. Also embedded into the deployed Helm release and
/// consulted for the ownership check.
pub const ANTECEDENT_ANNOTATION: &str = "helm.fluxcd.io/antecedent";

/// Specification for a HelmRelease
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.fluxcd.io",
    version = "v1",
    kind = "HelmRelease",
    plural = "helmreleases",
    shortname = "hr",
    namespaced,
    status = "HelmReleaseStatus",
    printcolumn = r#"{"name":"Release","type":"string","jsonPath":".status.releaseName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.lastAttemptedRevision"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Name of the Helm release, defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the release is deployed into, defaults to the resource
    /// namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Helm version managing this release, defaults to the operator-wide
    /// setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_version: Option<HelmVersion>,

    /// Where the chart comes from; exactly one sub-source must be set
    #[serde(default)]
    pub chart: ChartSource,

    /// Inline values for the release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<BTreeMap<String, serde_json::Value>>,

    /// Values read from ConfigMaps/Secrets, merged in order before the
    /// inline values
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_from: Vec<ValuesFromSource>,

    /// Timeout in seconds for Helm actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Maximum number of revisions kept in the release history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_history: Option<i64>,

    /// Force resource updates through delete/recreate on upgrade
    #[serde(default)]
    pub force_upgrade: bool,

    /// Wait until all resources are ready before marking the release
    /// successful
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<bool>,

    /// Reuse the last release's values instead of resetting to the chart's
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse_values: Option<bool>,

    /// Skip CRD installation
    #[serde(default, rename = "skipCRDs")]
    pub skip_crds: bool,

    /// Disable OpenAPI validation of the rendered templates
    #[serde(default, rename = "disableOpenAPIValidation")]
    pub disable_open_api_validation: bool,

    /// Release test configuration
    #[serde(default)]
    pub test: TestSpec,

    /// Rollback configuration
    #[serde(default)]
    pub rollback: RollbackSpec,

    /// Application identity injected into rendered workloads
    #[serde(default)]
    pub app_id: String,

    /// Component identity injected into rendered workloads
    #[serde(default)]
    pub component_id: String,

    /// Toggle service-mesh sidecar injection on rendered workloads
    #[serde(default)]
    pub istio_enabled: bool,

    /// Toggle the log-collection annotation on rendered workloads
    #[serde(default)]
    pub log_collect: bool,
}

/// Status of a HelmRelease, owned by the operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Lifecycle phase of the last reconciliation step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<HelmReleasePhase>,

    /// Generation of the spec that was last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the managed Helm release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Status string reported by Helm for the deployed release
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_status: Option<String>,

    /// Last chart revision an install or upgrade was attempted with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// Number of rollbacks performed since the last successful upgrade
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_count: Option<i64>,

    /// Released / Tested / RolledBack conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<HelmReleaseCondition>,
}

impl HelmRelease {
    /// Name of the Helm release, defaulting to the resource name
    pub fn release_name(&self) -> String {
        self.spec
            .release_name
            .clone()
            .unwrap_or_else(|| self.name_any())
    }

    /// Namespace the release is deployed into, defaulting to the resource
    /// namespace
    pub fn target_namespace(&self) -> String {
        self.spec
            .target_namespace
            .clone()
            .or_else(|| self.namespace())
            .unwrap_or_else(|| "default".to_string())
    }

    /// Helm version for this release, falling back to the given default
    pub fn helm_version(&self, default: HelmVersion) -> HelmVersion {
        self.spec.helm_version.unwrap_or(default)
    }

    /// Timeout in seconds for Helm actions (default 300)
    pub fn timeout(&self) -> i64 {
        self.spec.timeout.unwrap_or(300)
    }

    /// Maximum number of release revisions kept (default 10)
    pub fn max_history(&self) -> i64 {
        self.spec.max_history.unwrap_or(10)
    }

    /// Whether Helm should wait for resource readiness (default false)
    pub fn wait(&self) -> bool {
        self.spec.wait.unwrap_or(false)
    }

    /// Whether the last release's values are reused (default false)
    pub fn reuse_values(&self) -> bool {
        self.spec.reuse_values.unwrap_or(false)
    }

    /// Observed spec generation, 0 when the resource was never synced
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Identity of this resource, written as the antecedent annotation on
    /// every released object: `<namespace>:helmrelease/<name>`
    pub fn resource_id(&self) -> String {
        format!(
            "{}:helmrelease/{}",
            self.namespace().unwrap_or_else(|| "default".to_string()),
            self.name_any()
        )
    }

    /// Work queue key of this resource: `<namespace>/<name>`
    pub fn queue_key(&self) -> String {
        format!(
            "{}/{}",
            self.namespace().unwrap_or_else(|| "default".to_string()),
            self.name_any()
        )
    }

    /// Value of the migrate annotation, when present
    pub fn migrate_annotation(&self) -> Option<&str> {
        self.annotations().get(MIGRATE_ANNOTATION).map(|s| s.as_str())
    }
}
