//! Helm client abstraction
//!
//! The operator drives Helm exclusively through the [`HelmClient`] trait;
//! the production implementation shells out to the Helm binary
//! ([`cli::HelmCli`]), tests use the generated mock. One client exists per
//! supported Helm version, collected in [`Clients`].

mod cli;
mod convert;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[cfg(test)]
use mockall::automock;

use crate::crd::HelmVersion;
use crate::release::postrender::PostRenderSpec;
use crate::Error;

pub use cli::HelmCli;
pub use convert::{Converter, Helm2To3};
#[cfg(test)]
pub use convert::MockConverter;

/// Status of a deployed Helm release
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReleaseStatus {
    /// Status could not be determined
    Unknown,
    /// The release is deployed
    Deployed,
    /// The release was uninstalled
    Uninstalled,
    /// The release was superseded by a newer revision
    Superseded,
    /// The release failed
    Failed,
    /// An uninstall is in progress
    Uninstalling,
    /// An install is in progress
    PendingInstall,
    /// An upgrade is in progress
    PendingUpgrade,
    /// A rollback is in progress
    PendingRollback,
}

impl ReleaseStatus {
    /// Whether the release is in a state from which an upgrade can safely be
    /// attempted. The pending states and uninstalling would conflict with a
    /// concurrent Helm operation.
    pub fn allows_upgrade(&self) -> bool {
        !matches!(
            self,
            Self::PendingInstall | Self::PendingUpgrade | Self::PendingRollback | Self::Uninstalling
        )
    }
}

impl std::fmt::Display for ReleaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Deployed => "deployed",
            Self::Uninstalled => "uninstalled",
            Self::Superseded => "superseded",
            Self::Failed => "failed",
            Self::Uninstalling => "uninstalling",
            Self::PendingInstall => "pending-install",
            Self::PendingUpgrade => "pending-upgrade",
            Self::PendingRollback => "pending-rollback",
        };
        write!(f, "{s}")
    }
}

/// A deployed Helm release, reduced to the fields the engine consults
#[derive(Clone, Debug)]
pub struct Release {
    /// Release name
    pub name: String,
    /// Namespace the release lives in
    pub namespace: String,
    /// Revision number, monotonically increasing
    pub version: i64,
    /// Current status
    pub status: ReleaseStatus,
    /// Rendered manifest of this revision
    pub manifest: String,
}

/// One entry of a release's revision history
#[derive(Clone, Debug, Deserialize)]
pub struct HistoryEntry {
    /// Revision number
    #[serde(rename = "revision")]
    pub version: i64,
    /// Status of the revision
    pub status: ReleaseStatus,
}

/// Options for fetching a release
#[derive(Clone, Debug, Default)]
pub struct GetOptions {
    /// Namespace of the release
    pub namespace: String,
    /// Specific revision; latest when unset
    pub version: Option<i64>,
}

/// Options for fetching release history
#[derive(Clone, Debug, Default)]
pub struct HistoryOptions {
    /// Namespace of the release
    pub namespace: String,
    /// Maximum number of entries, most recent first
    pub max: i64,
}

/// Options for an install or upgrade run
#[derive(Clone, Debug, Default)]
pub struct UpgradeOptions {
    /// Namespace the release is deployed into
    pub namespace: String,
    /// Timeout in seconds for the Helm action
    pub timeout: Option<i64>,
    /// Install the release when it does not exist
    pub install: bool,
    /// Render and compare only, without touching the cluster
    pub dry_run: bool,
    /// Force resource updates through delete/recreate
    pub force: bool,
    /// Reuse the last release's values
    pub reuse_values: bool,
    /// Reset values to the chart's defaults
    pub reset_values: bool,
    /// Skip CRD installation
    pub skip_crds: bool,
    /// Maximum number of revisions kept
    pub max_history: i64,
    /// Wait for resource readiness
    pub wait: bool,
    /// Disable OpenAPI validation of the rendered templates
    pub disable_validation: bool,
    /// Post-render transformation applied between rendering and apply
    pub post_render: Option<PostRenderSpec>,
}

/// Options for a rollback
#[derive(Clone, Debug, Default)]
pub struct RollbackOptions {
    /// Namespace of the release
    pub namespace: String,
    /// Timeout in seconds
    pub timeout: i64,
    /// Wait for resource readiness
    pub wait: bool,
    /// Prevent hooks from running
    pub disable_hooks: bool,
    /// Restart pods of the release
    pub recreate: bool,
    /// Force resource updates through delete/recreate
    pub force: bool,
}

/// Options for a release test run
#[derive(Clone, Debug, Default)]
pub struct TestOptions {
    /// Namespace of the release
    pub namespace: String,
    /// Timeout in seconds
    pub timeout: i64,
    /// Delete test pods on completion
    pub cleanup: bool,
}

/// Options for an uninstall
#[derive(Clone, Debug, Default)]
pub struct UninstallOptions {
    /// Namespace of the release
    pub namespace: String,
    /// Keep the release history around
    pub keep_history: bool,
    /// Timeout in seconds
    pub timeout: i64,
}

/// Client for one Helm version.
///
/// All chart paths refer to the local filesystem; the chart source resolver
/// is responsible for producing them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// The Helm version this client drives
    fn version(&self) -> HelmVersion;

    /// Fetch the release with the given name, `None` when it does not exist
    async fn get(&self, release_name: &str, opts: GetOptions) -> Result<Option<Release>, Error>;

    /// Fetch the revision history of a release, most recent first
    async fn history(
        &self,
        release_name: &str,
        opts: HistoryOptions,
    ) -> Result<Vec<HistoryEntry>, Error>;

    /// Run an install or upgrade from a chart on the local filesystem
    async fn upgrade_from_path(
        &self,
        chart_path: &Path,
        release_name: &str,
        values: &[u8],
        opts: UpgradeOptions,
    ) -> Result<Release, Error>;

    /// Roll the release back to its previous revision
    async fn rollback(&self, release_name: &str, opts: RollbackOptions) -> Result<Release, Error>;

    /// Run the chart's tests against the deployed release
    async fn test(&self, release_name: &str, opts: TestOptions) -> Result<(), Error>;

    /// Uninstall the release
    async fn uninstall(&self, release_name: &str, opts: UninstallOptions) -> Result<(), Error>;

    /// Update the chart's dependencies in place
    async fn dependency_update(&self, chart_path: &Path) -> Result<(), Error>;

    /// Read the chart's own version string from a chart path or archive
    async fn get_chart_revision(&self, chart_path: &Path) -> Result<String, Error>;
}

/// Helm clients keyed by version, read-mostly after startup
#[derive(Default)]
pub struct Clients {
    clients: HashMap<HelmVersion, Arc<dyn HelmClient>>,
}

impl Clients {
    /// Create an empty client set
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client for its version
    pub fn insert(&mut self, client: Arc<dyn HelmClient>) {
        self.clients.insert(client.version(), client);
    }

    /// Look up the client for a version
    pub fn load(&self, version: HelmVersion) -> Option<Arc<dyn HelmClient>> {
        self.clients.get(&version).cloned()
    }
}

/// Compare two rendered manifests, returning an empty string when they are
/// identical and a unified-style fragment otherwise.
///
/// The comparison trims the common prefix and suffix and prints the
/// differing middle; line-exact output is only consumed by humans reading
/// the diff log.
pub fn diff(old: &str, new: &str) -> String {
    if old == new {
        return String::new();
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let mut start = 0;
    while start < old_lines.len() && start < new_lines.len() && old_lines[start] == new_lines[start]
    {
        start += 1;
    }
    let mut old_end = old_lines.len();
    let mut new_end = new_lines.len();
    while old_end > start && new_end > start && old_lines[old_end - 1] == new_lines[new_end - 1] {
        old_end -= 1;
        new_end -= 1;
    }

    let mut out = String::new();
    for line in &old_lines[start..old_end] {
        out.push_str("- ");
        out.push_str(line);
        out.push('\n');
    }
    for line in &new_lines[start..new_end] {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    out
}
