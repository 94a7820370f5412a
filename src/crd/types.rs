//! Supporting types for the HelmRelease custom resource

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Helm version a release is managed with
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum HelmVersion {
    /// Helm v2 (Tiller-backed)
    #[serde(rename = "v2")]
    V2,
    /// Helm v3
    #[serde(rename = "v3")]
    V3,
}

impl std::fmt::Display for HelmVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V2 => write!(f, "v2"),
            Self::V3 => write!(f, "v3"),
        }
    }
}

/// Chart source pointing at a path inside a git repository
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GitChartSource {
    /// Git repository URL
    pub git: String,

    /// Git reference to resolve (branch, tag, or SHA)
    #[serde(default = "GitChartSource::default_ref", rename = "ref")]
    pub git_ref: String,

    /// Path of the chart relative to the repository root
    pub path: String,

    /// Skip `helm dependency update` for this chart
    #[serde(default)]
    pub skip_dep_update: bool,
}

impl GitChartSource {
    fn default_ref() -> String {
        "master".to_string()
    }
}

/// Chart source pointing at a chart repository entry
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoChartSource {
    /// Chart repository URL
    pub repository: String,

    /// Chart name
    pub name: String,

    /// Chart version
    pub version: String,
}

impl RepoChartSource {
    /// Archive file name of the chart (`<name>-<version>.tgz`)
    pub fn archive_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }
}

/// Chart source pointing at a single downloadable object
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CustomizeSource {
    /// URL of the chart archive
    pub key: String,

    /// Reuse a previously downloaded copy when present
    #[serde(default)]
    pub use_cache: bool,
}

/// Cloud object store vendor
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum CloudProvider {
    /// Alibaba Cloud OSS
    #[serde(rename = "aliyun")]
    Aliyun,
    /// Huawei Cloud OBS
    #[serde(rename = "huaweiyun")]
    Huaweiyun,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aliyun => write!(f, "aliyun"),
            Self::Huaweiyun => write!(f, "huaweiyun"),
        }
    }
}

/// Chart source pointing at a cloud object store bucket
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OssSource {
    /// Object store vendor
    pub cloud_provider: CloudProvider,

    /// Vendor region identifier
    pub region_id: String,

    /// Bucket name
    pub bucket: String,

    /// Object key of the chart archive
    pub key: String,

    /// Access key id
    pub ack_id: String,

    /// Access key secret
    pub ack_secret: String,

    /// Whether ackId/ackSecret are stored in the encrypted envelope
    #[serde(default)]
    pub ack_encrypted: bool,

    /// Reuse a previously downloaded copy when present
    #[serde(default)]
    pub use_cache: bool,
}

/// Chart source of a HelmRelease.
///
/// Exactly one of the sub-sources must be set; [`ChartSource::source`]
/// enforces this at reconciliation time so that a misconfigured resource
/// surfaces a clear error instead of being rejected by the API server.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartSource {
    /// Git chart source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitChartSource>,

    /// Chart repository source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<RepoChartSource>,

    /// Single-object URL source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customize: Option<CustomizeSource>,

    /// Cloud object store source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oss: Option<OssSource>,
}

/// View over the unique configured chart source
#[derive(Debug)]
pub enum SourceKind<'a> {
    /// Git export
    Git(&'a GitChartSource),
    /// Chart repository archive
    Repo(&'a RepoChartSource),
    /// Single-object URL
    Customize(&'a CustomizeSource),
    /// Cloud object store object
    Oss(&'a OssSource),
}

impl ChartSource {
    /// Return the unique configured source, or an error when none or more
    /// than one is set
    pub fn source(&self) -> Result<SourceKind<'_>, Error> {
        let mut found = None;
        let mut count = 0;
        if let Some(git) = &self.git {
            found = Some(SourceKind::Git(git));
            count += 1;
        }
        if let Some(repo) = &self.repo {
            found = Some(SourceKind::Repo(repo));
            count += 1;
        }
        if let Some(customize) = &self.customize {
            found = Some(SourceKind::Customize(customize));
            count += 1;
        }
        if let Some(oss) = &self.oss {
            found = Some(SourceKind::Oss(oss));
            count += 1;
        }
        match (found, count) {
            (Some(kind), 1) => Ok(kind),
            _ => Err(Error::invariant(
                "could not find valid chart source configuration for release",
            )),
        }
    }
}

/// Reference to a key inside a ConfigMap or Secret holding values YAML
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValuesFromSource {
    /// ConfigMap reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<ValuesKeySelector>,

    /// Secret reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<ValuesKeySelector>,
}

/// Selects a key of a named ConfigMap or Secret
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValuesKeySelector {
    /// Name of the referenced object
    pub name: String,

    /// Key holding the values document, defaults to `values.yaml`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Tolerate a missing object or key
    #[serde(default)]
    pub optional: bool,
}

/// Release test configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    /// Run `helm test` after install/upgrade
    #[serde(default)]
    pub enable: bool,

    /// Treat test failures as success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_failures: Option<bool>,

    /// Test timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Delete test pods on completion
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup: Option<bool>,
}

impl TestSpec {
    /// Whether test failures are ignored (default false)
    pub fn get_ignore_failures(&self) -> bool {
        self.ignore_failures.unwrap_or(false)
    }

    /// Test timeout in seconds (default 300)
    pub fn get_timeout(&self) -> i64 {
        self.timeout.unwrap_or(300)
    }

    /// Whether test pods are cleaned up (default true)
    pub fn get_cleanup(&self) -> bool {
        self.cleanup.unwrap_or(true)
    }
}

/// Release rollback configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollbackSpec {
    /// Roll back to the previous revision on a failed upgrade
    #[serde(default)]
    pub enable: bool,

    /// Keep retrying the upgrade after a rollback
    #[serde(default)]
    pub retry: bool,

    /// Maximum number of upgrade retries after rollbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,

    /// Force resource updates through delete/recreate
    #[serde(default)]
    pub force: bool,

    /// Perform pod restarts for the resources of the release
    #[serde(default)]
    pub recreate: bool,

    /// Prevent hooks from running during rollback
    #[serde(default)]
    pub disable_hooks: bool,

    /// Rollback timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,

    /// Wait until resources are in a ready state before marking the
    /// rollback as successful
    #[serde(default)]
    pub wait: bool,
}

impl RollbackSpec {
    /// Rollback timeout in seconds (default 300)
    pub fn get_timeout(&self) -> i64 {
        self.timeout.unwrap_or(300)
    }

    /// Maximum upgrade retries after rollbacks (default 5)
    pub fn get_max_retries(&self) -> i64 {
        self.max_retries.unwrap_or(5)
    }
}

/// Lifecycle phase of a HelmRelease, written on every transition
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HelmReleasePhase {
    /// A new chart revision was fetched
    ChartFetched,
    /// The chart source could not be resolved
    ChartFetchFailed,
    /// An installation is running
    Installing,
    /// An upgrade is running
    Upgrading,
    /// A v2 to v3 migration is running
    Migrating,
    /// `helm test` is running
    Testing,
    /// `helm test` failed
    TestFailed,
    /// `helm test` succeeded
    Tested,
    /// A rollback is running
    RollingBack,
    /// The rollback succeeded
    RolledBack,
    /// The rollback failed
    RollbackFailed,
    /// The install or upgrade failed
    DeployFailed,
    /// The install or upgrade succeeded
    Deployed,
    /// The reconciliation completed
    Succeeded,
    /// The reconciliation failed terminally
    Failed,
}

impl std::fmt::Display for HelmReleasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Ternary condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Condition state is unknown
    #[default]
    Unknown,
}

/// Condition types owned by the release engine
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HelmReleaseConditionType {
    /// The release is deployed in the cluster
    Released,
    /// The release passed its tests
    Tested,
    /// The release was rolled back
    RolledBack,
}

/// Observed condition of a HelmRelease
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: HelmReleaseConditionType,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable reason for the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time this condition was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Last time the status flipped
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl HelmReleaseCondition {
    /// Create a condition stamped with the current time
    pub fn new(
        type_: HelmReleaseConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            type_,
            status,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_update_time: Some(now),
            last_transition_time: Some(now),
        }
    }
}
