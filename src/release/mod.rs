//! Release synchronization engine
//!
//! [`Release::sync`] is the entry point a worker invokes for one
//! HelmRelease: resolve the chart, compose values, decide on an action, and
//! drive the action loop against the Helm client. Every phase boundary is
//! written to the status subresource and every action records a metric.
//!
//! The action loop is an explicit state machine: each handler returns the
//! next action or `None` to terminate, and failures accumulate into one
//! aggregate returned at the end (which is what re-queues the work item).

pub mod manifest;
pub mod mark;
pub mod postrender;
pub mod values;

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, instrument, warn};

use crate::chartsync::{Chart, ChartSync, GitChartSync};
use crate::crd::{HelmRelease, HelmReleasePhase, ANTECEDENT_ANNOTATION};
use crate::error::ErrorCollection;
use crate::helm::{
    self, Clients, Converter, GetOptions, HelmClient, HistoryOptions, ReleaseStatus,
    RollbackOptions, TestOptions, UninstallOptions, UpgradeOptions,
};
use crate::metrics::{Metrics, SYNC_ACTION};
use crate::status::{self, StatusClient};
use crate::Error;

use self::mark::Marker;
use self::postrender::PostRenderSpec;
use self::values::{compose_values, ValuesClient};

/// Engine configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Log the full dry-run diff instead of just noting a difference
    pub log_diffs: bool,
    /// Helm version used when the resource does not pin one
    pub default_helm_version: crate::crd::HelmVersion,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_diffs: false,
            default_helm_version: crate::crd::HelmVersion::V3,
        }
    }
}

/// Action chosen by the decision machine or reached through a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// Compare a dry-run rendering against the deployed release
    DryRunCompare,
    /// Install the release
    Install,
    /// Convert a v2 release to v3
    Migrate,
    /// Upgrade the release
    Upgrade,
    /// Run the chart tests
    Test,
    /// Roll back to the previous revision
    Rollback,
    /// Mark and annotate the released objects
    Annotate,
    /// Uninstall the release
    Uninstall,
    /// Do nothing
    Skip,
}

impl SyncAction {
    /// Metric label of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DryRunCompare => "dry-run-compare",
            Self::Install => "install",
            Self::Migrate => "migrate",
            Self::Upgrade => "upgrade",
            Self::Test => "test",
            Self::Rollback => "rollback",
            Self::Annotate => "annotate",
            Self::Uninstall => "uninstall",
            Self::Skip => "skip",
        }
    }
}

impl std::fmt::Display for SyncAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First antecedent annotation found in a rendered manifest, identifying
/// the HelmRelease that produced the deployed release
fn manifest_antecedent(manifest_text: &str) -> Option<String> {
    for doc in manifest::parse_documents(manifest_text) {
        if let Some(antecedent) = doc
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(ANTECEDENT_ANNOTATION))
            .and_then(|v| v.as_str())
        {
            return Some(antecedent.to_string());
        }
    }
    None
}

/// Release synchronization engine, shared by all workers
pub struct Release {
    clients: Arc<Clients>,
    chart_sync: Arc<ChartSync>,
    git: Arc<GitChartSync>,
    status: Arc<dyn StatusClient>,
    values: Arc<dyn ValuesClient>,
    converter: Arc<dyn Converter>,
    marker: Arc<dyn Marker>,
    metrics: Arc<Metrics>,
    config: Config,
}

impl Release {
    /// Create the engine
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clients: Arc<Clients>,
        chart_sync: Arc<ChartSync>,
        git: Arc<GitChartSync>,
        status: Arc<dyn StatusClient>,
        values: Arc<dyn ValuesClient>,
        converter: Arc<dyn Converter>,
        marker: Arc<dyn Marker>,
        metrics: Arc<Metrics>,
        config: Config,
    ) -> Self {
        Self {
            clients,
            chart_sync,
            git,
            status,
            values,
            converter,
            marker,
            metrics,
            config,
        }
    }

    /// Synchronize one HelmRelease with Helm.
    ///
    /// Writes the observed generation and the sync metric on every exit
    /// path.
    #[instrument(skip(self, hr), fields(
        release = %hr.release_name(),
        target_namespace = %hr.target_namespace(),
        resource = %hr.resource_id(),
    ))]
    pub async fn sync(&self, hr: &HelmRelease) -> Result<(), Error> {
        let version = hr.helm_version(self.config.default_helm_version);
        let Some(client) = self.clients.load(version) else {
            self.record_phase(hr, HelmReleasePhase::Failed, None).await;
            return Err(Error::invariant(format!("no client found for Helm '{version}'")));
        };

        let start = Instant::now();
        let result = self.sync_inner(client.as_ref(), hr).await;

        if let Err(e) = self.status.set_observed_generation(hr, hr.generation()).await {
            warn!(error = %e, "failed to record observed generation");
        }
        self.metrics.observe_action(
            &hr.target_namespace(),
            &hr.release_name(),
            SYNC_ACTION,
            result.is_ok(),
            start.elapsed(),
        );
        result
    }

    /// Uninstall the Helm release of a deleted HelmRelease, including its
    /// git mirror when present
    pub async fn uninstall(&self, hr: &HelmRelease) -> Result<(), Error> {
        let version = hr.helm_version(self.config.default_helm_version);
        let Some(client) = self.clients.load(version) else {
            return Err(Error::invariant(format!("no client found for Helm '{version}'")));
        };
        self.run(
            client.as_ref(),
            SyncAction::Uninstall,
            hr,
            None,
            &Chart::default(),
            &[],
        )
        .await
    }

    async fn sync_inner(&self, client: &dyn HelmClient, hr: &HelmRelease) -> Result<(), Error> {
        info!("starting sync run");

        let (chart, export) = match self.chart_sync.prepare_chart(client, hr).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::ChartFetchFailed, None)
                    .await;
                warn!(error = %e, "failed to prepare chart for release");
                return Err(e);
            }
        };
        if chart.changed {
            self.record_phase(hr, HelmReleasePhase::ChartFetched, Some(&chart.revision))
                .await;
        }

        let values = match compose_values(self.values.as_ref(), hr).await {
            Ok(values) => values,
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::Failed, None).await;
                warn!(error = %e, "failed to compose values for release");
                return Err(e);
            }
        };

        let (action, cur_rel) = match self.determine_sync_action(client, hr, &chart).await {
            Ok(decision) => decision,
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::Failed, None).await;
                warn!(error = %e, "failed to determine sync action for release");
                return Err(e);
            }
        };

        let result = self.run(client, action, hr, cur_rel, &chart, &values).await;
        // The git export stays alive until here so the chart path remains
        // valid for the whole run.
        drop(export);
        result
    }

    /// Choose the action for this reconciliation. The cheapest signals are
    /// consulted first; the dry-run comparison is the fallback for "nothing
    /// obviously changed".
    async fn determine_sync_action(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
        chart: &Chart,
    ) -> Result<(SyncAction, Option<helm::Release>), Error> {
        let name = hr.release_name();
        let namespace = hr.target_namespace();

        let cur_rel = client
            .get(
                &name,
                GetOptions {
                    namespace: namespace.clone(),
                    version: None,
                },
            )
            .await
            .map_err(|e| Error::action_failure(format!("failed to retrieve Helm release: {e}")))?;

        // No release deployed: install, unless a migration is requested and
        // a v2 release with this name still exists.
        let Some(cur_rel) = cur_rel else {
            if hr.migrate_annotation().is_some()
                && hr.helm_version(self.config.default_helm_version) == crate::crd::HelmVersion::V3
            {
                let v2_exists = self.converter.v2_release_exists(&name).await.map_err(|e| {
                    Error::migration_failure(format!(
                        "failed to retrieve Helm v2 release while attempting migration: {e}"
                    ))
                })?;
                if v2_exists {
                    return Ok((SyncAction::Migrate, None));
                }
            }
            return Ok((SyncAction::Install, None));
        };

        // The release must be ours: the antecedent annotation embedded in
        // the deployed manifest names the owning resource.
        if let Some(antecedent) = manifest_antecedent(&cur_rel.manifest) {
            if antecedent != hr.resource_id() {
                return Err(Error::ownership_conflict(format!(
                    "release appears to be managed by '{antecedent}'"
                )));
            }
        }

        if !cur_rel.status.allows_upgrade() {
            return Err(Error::upgrade_disallowed(format!(
                "status '{}' of release does not allow a safe upgrade",
                cur_rel.status
            )));
        }

        // A spec generation we have not acted on yet always upgrades.
        if !status::has_synced(hr) {
            return Ok((SyncAction::Upgrade, Some(cur_rel)));
        }

        let mut cur_rel = cur_rel;
        if status::has_rolled_back(hr) {
            if chart.changed || status::should_retry_upgrade(hr) {
                return Ok((SyncAction::Upgrade, Some(cur_rel)));
            }
            // Compare against the release that was rolled back, not the
            // rollback itself, so the dry-run diff reflects what failed.
            let history = client
                .history(
                    &name,
                    HistoryOptions {
                        namespace: namespace.clone(),
                        max: hr.max_history(),
                    },
                )
                .await
                .map_err(|e| {
                    Error::action_failure(format!(
                        "failed to retrieve history for rolled back release: {e}"
                    ))
                })?;
            if let Some(entry) = history.iter().find(|h| {
                matches!(h.status, ReleaseStatus::Failed | ReleaseStatus::Superseded)
            }) {
                if let Some(rel) = client
                    .get(
                        &name,
                        GetOptions {
                            namespace: namespace.clone(),
                            version: Some(entry.version),
                        },
                    )
                    .await?
                {
                    cur_rel = rel;
                }
            }
        } else if chart.changed {
            return Ok((SyncAction::Upgrade, Some(cur_rel)));
        }

        Ok((SyncAction::DryRunCompare, Some(cur_rel)))
    }

    /// Drive the action loop from the initial action until a handler
    /// terminates it
    async fn run(
        &self,
        client: &dyn HelmClient,
        initial: SyncAction,
        hr: &HelmRelease,
        cur_rel: Option<helm::Release>,
        chart: &Chart,
        values: &[u8],
    ) -> Result<(), Error> {
        let mut errs = ErrorCollection::new();
        let mut new_rel: Option<helm::Release> = None;
        let mut action = initial;

        loop {
            let next: Option<SyncAction> = match action {
                SyncAction::DryRunCompare => match cur_rel.as_ref() {
                    None => {
                        errs.push(Error::invariant(
                            "dry-run comparison without a deployed release",
                        ));
                        None
                    }
                    Some(cur) => {
                        info!(version = cur.version, action = %action,
                            "running dry-run upgrade to compare with deployed release");
                        match self.dry_run_compare(client, hr, cur, chart, values).await {
                            Err(e) => {
                                self.record_phase(hr, HelmReleasePhase::Failed, None).await;
                                warn!(error = %e, action = %action, "dry-run comparison failed");
                                errs.push(e);
                                None
                            }
                            Ok((rel, diff)) if diff.is_empty() => {
                                if !status::has_rolled_back(hr) {
                                    self.record_phase(hr, HelmReleasePhase::Succeeded, None).await;
                                }
                                info!(action = %action, "no changes");
                                new_rel = Some(rel);
                                None
                            }
                            Ok(_) => {
                                info!(action = %action,
                                    "difference detected during release comparison");
                                Some(SyncAction::Upgrade)
                            }
                        }
                    }
                },
                SyncAction::Install => {
                    info!(action = %action, "running installation");
                    match self.install(client, hr, chart, values).await {
                        Err(e) => {
                            warn!(error = %e, action = %action, "installation failed");
                            errs.push(e);
                            // Clean up the partial install.
                            Some(SyncAction::Uninstall)
                        }
                        Ok(rel) => {
                            info!(revision = %chart.revision, action = %action,
                                "installation succeeded");
                            new_rel = Some(rel);
                            Some(SyncAction::Test)
                        }
                    }
                }
                SyncAction::Migrate => {
                    info!(action = %action, "running 2to3 migration");
                    let dry_run = hr.migrate_annotation() != Some("true");
                    match self.migrate(hr, chart, dry_run).await {
                        Err(e) => {
                            warn!(error = %e, action = %action, "migration failed");
                            errs.push(e);
                            None
                        }
                        // There might be spec changes on top of the migrated
                        // release, so a real conversion continues as an
                        // upgrade.
                        Ok(()) if dry_run => Some(SyncAction::Skip),
                        Ok(()) => Some(SyncAction::Upgrade),
                    }
                }
                SyncAction::Upgrade => {
                    info!(action = %action, "running upgrade");
                    match self.upgrade(client, hr, chart, values).await {
                        Err(e) => {
                            warn!(error = %e, action = %action, "upgrade failed");
                            errs.push(e);
                            Some(SyncAction::Rollback)
                        }
                        Ok(rel) => {
                            info!(revision = %chart.revision, action = %action,
                                "upgrade succeeded");
                            new_rel = Some(rel);
                            Some(SyncAction::Test)
                        }
                    }
                }
                SyncAction::Test => {
                    let mut next = Some(SyncAction::Annotate);
                    if hr.spec.test.enable {
                        info!(action = %action, "running test");
                        match self.test(client, hr).await {
                            Err(e) => {
                                warn!(error = %e, action = %action, "test failed");
                                errs.push(e);
                                if !hr.spec.test.get_ignore_failures() {
                                    next = Some(match cur_rel {
                                        // First release: nothing to roll
                                        // back to.
                                        None => SyncAction::Uninstall,
                                        Some(_) => SyncAction::Rollback,
                                    });
                                } else {
                                    info!(revision = %chart.revision,
                                        "test failed - ignoring failures");
                                }
                            }
                            Ok(()) => {
                                info!(revision = %chart.revision, action = %action,
                                    "test succeeded");
                            }
                        }
                    }
                    if next == Some(SyncAction::Annotate) {
                        self.record_phase(hr, HelmReleasePhase::Succeeded, Some(&chart.revision))
                            .await;
                    }
                    next
                }
                SyncAction::Rollback => {
                    let mut next = None;
                    if hr.spec.rollback.enable {
                        if let Some(cur) = cur_rel.as_ref() {
                            match client
                                .get(
                                    &hr.release_name(),
                                    GetOptions {
                                        namespace: hr.target_namespace(),
                                        version: None,
                                    },
                                )
                                .await
                            {
                                Err(e) => {
                                    let e = Error::action_failure(format!(
                                        "unable to determine if rollback should be performed: {e}"
                                    ));
                                    warn!(error = %e, action = %action, "rollback skipped");
                                    errs.push(e);
                                }
                                Ok(latest) => {
                                    // Only roll back when the failed attempt
                                    // actually produced a newer revision.
                                    let latest_version =
                                        latest.as_ref().map(|l| l.version).unwrap_or(0);
                                    if cur.version < latest_version {
                                        info!(action = %action, "running rollback");
                                        match self.rollback(client, hr).await {
                                            Err(e) => {
                                                warn!(error = %e, action = %action,
                                                    "rollback failed");
                                                errs.push(e);
                                            }
                                            Ok(rel) => {
                                                info!(action = %action, "rollback succeeded");
                                                new_rel = Some(rel);
                                                next = Some(SyncAction::Annotate);
                                            }
                                        }
                                    }
                                }
                            }
                        }
                    }
                    next
                }
                SyncAction::Annotate => {
                    if let Some(rel) = new_rel.as_ref() {
                        let start = Instant::now();
                        let mut ok = true;
                        if let Err(e) = self.marker.mark(hr, rel).await {
                            warn!(error = %e, action = %action, "failed to mark release resources");
                            ok = false;
                        }
                        if let Err(e) = self.marker.annotate(hr, rel).await {
                            warn!(error = %e, action = %action,
                                "failed to annotate release resources");
                            ok = false;
                        }
                        self.metrics.observe_action(
                            &hr.target_namespace(),
                            &hr.release_name(),
                            action.as_str(),
                            ok,
                            start.elapsed(),
                        );
                    }
                    None
                }
                SyncAction::Uninstall => {
                    info!(action = %action, "running uninstall");
                    self.uninstall_release(client, hr).await;
                    if let Some(git_source) = &hr.spec.chart.git {
                        if let Err(e) = self.git.delete(git_source).await {
                            warn!(error = %e, "failed to delete git mirror");
                        }
                    }
                    None
                }
                SyncAction::Skip => None,
            };

            match next {
                Some(n) => action = n,
                None => break,
            }
        }

        errs.into_result()
    }

    async fn dry_run_compare(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
        cur: &helm::Release,
        chart: &Chart,
        values: &[u8],
    ) -> Result<(helm::Release, String), Error> {
        let start = Instant::now();
        let result = client
            .upgrade_from_path(
                &chart.chart_path,
                &hr.release_name(),
                values,
                UpgradeOptions {
                    namespace: hr.target_namespace(),
                    dry_run: true,
                    force: hr.spec.force_upgrade,
                    reuse_values: hr.reuse_values(),
                    reset_values: !hr.reuse_values(),
                    post_render: Some(PostRenderSpec::from_release(hr)),
                    ..Default::default()
                },
            )
            .await;
        self.observe(hr, SyncAction::DryRunCompare, result.is_ok(), start);
        let dry_rel = result.map_err(|e| {
            Error::action_failure(format!("dry-run upgrade for comparison failed: {e}"))
        })?;
        let diff = helm::diff(&cur.manifest, &dry_rel.manifest);
        if !diff.is_empty() && self.config.log_diffs {
            info!(%diff, "release comparison diff");
        }
        Ok((dry_rel, diff))
    }

    async fn install(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
        chart: &Chart,
        values: &[u8],
    ) -> Result<helm::Release, Error> {
        let start = Instant::now();
        self.record_phase(hr, HelmReleasePhase::Installing, Some(&chart.revision))
            .await;
        let result = client
            .upgrade_from_path(
                &chart.chart_path,
                &hr.release_name(),
                values,
                UpgradeOptions {
                    namespace: hr.target_namespace(),
                    timeout: Some(hr.timeout()),
                    install: true,
                    force: hr.spec.force_upgrade,
                    skip_crds: hr.spec.skip_crds,
                    max_history: hr.max_history(),
                    wait: hr.wait(),
                    disable_validation: hr.spec.disable_open_api_validation,
                    post_render: Some(PostRenderSpec::from_release(hr)),
                    ..Default::default()
                },
            )
            .await;
        self.observe(hr, SyncAction::Install, result.is_ok(), start);
        match result {
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::DeployFailed, None).await;
                Err(Error::action_failure(format!("installation failed: {e}")))
            }
            Ok(rel) => {
                self.record_phase(hr, HelmReleasePhase::Deployed, None).await;
                Ok(rel)
            }
        }
    }

    async fn migrate(&self, hr: &HelmRelease, chart: &Chart, dry_run: bool) -> Result<(), Error> {
        let start = Instant::now();
        self.record_phase(hr, HelmReleasePhase::Migrating, Some(&chart.revision))
            .await;
        if dry_run {
            info!("running helm 2to3 conversion in dry-run mode");
        }
        let result = self.converter.convert(&hr.release_name(), dry_run).await;
        self.observe(hr, SyncAction::Migrate, result.is_ok(), start);
        match result {
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::Failed, None).await;
                Err(Error::migration_failure(format!(
                    "failed to convert helm release from v2 to v3: {e}"
                )))
            }
            Ok(()) => {
                self.record_phase(hr, HelmReleasePhase::Succeeded, None).await;
                Ok(())
            }
        }
    }

    async fn upgrade(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
        chart: &Chart,
        values: &[u8],
    ) -> Result<helm::Release, Error> {
        let start = Instant::now();
        self.record_phase(hr, HelmReleasePhase::Upgrading, Some(&chart.revision))
            .await;
        let result = client
            .upgrade_from_path(
                &chart.chart_path,
                &hr.release_name(),
                values,
                UpgradeOptions {
                    namespace: hr.target_namespace(),
                    timeout: Some(hr.timeout()),
                    install: false,
                    force: hr.spec.force_upgrade,
                    reuse_values: hr.reuse_values(),
                    reset_values: !hr.reuse_values(),
                    skip_crds: hr.spec.skip_crds,
                    max_history: hr.max_history(),
                    wait: hr.wait(),
                    disable_validation: hr.spec.disable_open_api_validation,
                    post_render: Some(PostRenderSpec::from_release(hr)),
                    ..Default::default()
                },
            )
            .await;
        self.observe(hr, SyncAction::Upgrade, result.is_ok(), start);
        match result {
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::DeployFailed, None).await;
                Err(Error::action_failure(format!("upgrade failed: {e}")))
            }
            Ok(rel) => {
                self.record_phase(hr, HelmReleasePhase::Deployed, None).await;
                // A successful upgrade resets the rollback retry budget.
                let rollback_count = hr
                    .status
                    .as_ref()
                    .and_then(|s| s.rollback_count)
                    .unwrap_or(0);
                if rollback_count > 0 {
                    if let Err(e) = self.status.set_rollback_count(hr, 0).await {
                        warn!(error = %e, "failed to reset rollback count");
                    }
                }
                Ok(rel)
            }
        }
    }

    async fn test(&self, client: &dyn HelmClient, hr: &HelmRelease) -> Result<(), Error> {
        let start = Instant::now();
        self.record_phase(hr, HelmReleasePhase::Testing, None).await;
        let result = client
            .test(
                &hr.release_name(),
                TestOptions {
                    namespace: hr.target_namespace(),
                    timeout: hr.spec.test.get_timeout(),
                    cleanup: hr.spec.test.get_cleanup(),
                },
            )
            .await;
        self.observe(hr, SyncAction::Test, result.is_ok(), start);
        match result {
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::TestFailed, None).await;
                Err(Error::action_failure(format!("test failed: {e}")))
            }
            Ok(()) => {
                self.record_phase(hr, HelmReleasePhase::Tested, None).await;
                Ok(())
            }
        }
    }

    async fn rollback(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
    ) -> Result<helm::Release, Error> {
        let start = Instant::now();
        self.record_phase(hr, HelmReleasePhase::RollingBack, None).await;
        let result = client
            .rollback(
                &hr.release_name(),
                RollbackOptions {
                    namespace: hr.target_namespace(),
                    timeout: hr.spec.rollback.get_timeout(),
                    wait: hr.spec.rollback.wait,
                    disable_hooks: hr.spec.rollback.disable_hooks,
                    recreate: hr.spec.rollback.recreate,
                    force: hr.spec.rollback.force,
                },
            )
            .await;
        self.observe(hr, SyncAction::Rollback, result.is_ok(), start);
        match result {
            Err(e) => {
                self.record_phase(hr, HelmReleasePhase::RollbackFailed, None).await;
                Err(Error::action_failure(format!("rollback failed: {e}")))
            }
            Ok(rel) => {
                self.record_phase(hr, HelmReleasePhase::RolledBack, None).await;
                let count = hr
                    .status
                    .as_ref()
                    .and_then(|s| s.rollback_count)
                    .unwrap_or(0);
                if let Err(e) = self.status.set_rollback_count(hr, count + 1).await {
                    warn!(error = %e, "failed to record rollback count");
                }
                Ok(rel)
            }
        }
    }

    /// Uninstall never fails the loop; problems are warnings.
    async fn uninstall_release(&self, client: &dyn HelmClient, hr: &HelmRelease) {
        let start = Instant::now();
        let result = client
            .uninstall(
                &hr.release_name(),
                UninstallOptions {
                    namespace: hr.target_namespace(),
                    keep_history: false,
                    timeout: hr.timeout(),
                },
            )
            .await;
        self.observe(hr, SyncAction::Uninstall, result.is_ok(), start);
        if let Err(e) = result {
            warn!(error = %e, "uninstall failed");
        }
    }

    fn observe(&self, hr: &HelmRelease, action: SyncAction, success: bool, start: Instant) {
        self.metrics.observe_action(
            &hr.target_namespace(),
            &hr.release_name(),
            action.as_str(),
            success,
            start.elapsed(),
        );
    }

    /// Status writes are best-effort: a failed write must never abort the
    /// reconciliation mid-action.
    async fn record_phase(
        &self,
        hr: &HelmRelease,
        phase: HelmReleasePhase,
        revision: Option<&str>,
    ) {
        if let Err(e) = self
            .status
            .set_phase(hr, phase, revision.map(str::to_string))
            .await
        {
            warn!(error = %e, ?phase, "failed to record status phase");
        }
    }
}
