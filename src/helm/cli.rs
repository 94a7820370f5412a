//! Helm client backed by the Helm binary
//!
//! All release operations shell out to `helm` with JSON output where the
//! command supports it. The post-render hook points Helm back at this very
//! binary's `post-render` subcommand, with the inject-spec serialized to a
//! temporary file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::crd::HelmVersion;
use crate::Error;

use super::{
    GetOptions, HelmClient, HistoryEntry, HistoryOptions, Release, ReleaseStatus, RollbackOptions,
    TestOptions, UninstallOptions, UpgradeOptions,
};

/// Helm client invoking the `helm` binary
pub struct HelmCli {
    version: HelmVersion,
    bin: PathBuf,
}

impl HelmCli {
    /// Create a client for the given Helm version and binary path
    pub fn new(version: HelmVersion, bin: impl Into<PathBuf>) -> Self {
        Self {
            version,
            bin: bin.into(),
        }
    }

    /// Run the binary with the given arguments, returning stdout
    async fn run(&self, args: &[String]) -> Result<String, Error> {
        debug!(helm = %self.bin.display(), ?args, "running helm");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::action_failure(format!("failed to run helm: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::action_failure(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Release payload of `helm status`/`helm upgrade -o json`
#[derive(Debug, Deserialize)]
struct ReleasePayload {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    version: i64,
    #[serde(default)]
    manifest: Option<String>,
    info: InfoPayload,
}

#[derive(Debug, Deserialize)]
struct InfoPayload {
    status: ReleaseStatus,
}

impl ReleasePayload {
    fn into_release(self, fallback_namespace: &str) -> Release {
        Release {
            name: self.name,
            namespace: self
                .namespace
                .unwrap_or_else(|| fallback_namespace.to_string()),
            version: self.version,
            status: self.info.status,
            manifest: self.manifest.unwrap_or_default(),
        }
    }
}

/// `version` field of a Chart.yaml document
#[derive(Debug, Deserialize)]
struct ChartMetadata {
    version: String,
}

fn parse_release(stdout: &str, fallback_namespace: &str) -> Result<Release, Error> {
    let payload: ReleasePayload = serde_json::from_str(stdout)
        .map_err(|e| Error::action_failure(format!("failed to parse helm output: {e}")))?;
    Ok(payload.into_release(fallback_namespace))
}

/// Helm prints a `release: not found` error for absent releases; the engine
/// treats that as a regular "no current release" answer.
fn is_not_found(message: &str) -> bool {
    message.contains("not found")
}

/// Seconds rendered the way the Helm version expects them (`300s` for v3, a
/// bare integer for v2)
fn format_timeout(version: HelmVersion, seconds: i64) -> String {
    match version {
        HelmVersion::V3 => format!("{seconds}s"),
        HelmVersion::V2 => seconds.to_string(),
    }
}

/// Build the argument list of an install/upgrade run, without the values
/// file and post-renderer plumbing that depend on temporary files.
fn build_upgrade_args(
    version: HelmVersion,
    release_name: &str,
    chart_path: &Path,
    opts: &UpgradeOptions,
) -> Vec<String> {
    let mut args = vec![
        "upgrade".to_string(),
        release_name.to_string(),
        chart_path.display().to_string(),
        "--namespace".to_string(),
        opts.namespace.clone(),
        "--output".to_string(),
        "json".to_string(),
    ];
    if opts.install {
        args.push("--install".to_string());
    }
    if opts.dry_run {
        args.push("--dry-run".to_string());
    }
    if opts.force {
        args.push("--force".to_string());
    }
    if opts.reuse_values {
        args.push("--reuse-values".to_string());
    }
    if opts.reset_values {
        args.push("--reset-values".to_string());
    }
    if opts.skip_crds {
        args.push("--skip-crds".to_string());
    }
    if opts.wait {
        args.push("--wait".to_string());
    }
    if opts.disable_validation {
        args.push("--disable-openapi-validation".to_string());
    }
    if opts.max_history > 0 {
        args.push("--history-max".to_string());
        args.push(opts.max_history.to_string());
    }
    if let Some(timeout) = opts.timeout {
        args.push("--timeout".to_string());
        args.push(format_timeout(version, timeout));
    }
    args
}

#[async_trait]
impl HelmClient for HelmCli {
    fn version(&self) -> HelmVersion {
        self.version
    }

    async fn get(&self, release_name: &str, opts: GetOptions) -> Result<Option<Release>, Error> {
        let mut args = vec![
            "status".to_string(),
            release_name.to_string(),
            "--namespace".to_string(),
            opts.namespace.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        if let Some(version) = opts.version {
            args.push("--revision".to_string());
            args.push(version.to_string());
        }
        match self.run(&args).await {
            Ok(stdout) => parse_release(&stdout, &opts.namespace).map(Some),
            Err(Error::ActionFailure(msg)) if is_not_found(&msg) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn history(
        &self,
        release_name: &str,
        opts: HistoryOptions,
    ) -> Result<Vec<HistoryEntry>, Error> {
        let args = vec![
            "history".to_string(),
            release_name.to_string(),
            "--namespace".to_string(),
            opts.namespace.clone(),
            "--max".to_string(),
            opts.max.to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let stdout = match self.run(&args).await {
            Ok(stdout) => stdout,
            Err(Error::ActionFailure(msg)) if is_not_found(&msg) => return Ok(vec![]),
            Err(e) => return Err(e),
        };
        let mut entries: Vec<HistoryEntry> = serde_json::from_str(&stdout)
            .map_err(|e| Error::action_failure(format!("failed to parse helm history: {e}")))?;
        // helm prints oldest first; the engine wants most recent first
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(entries)
    }

    async fn upgrade_from_path(
        &self,
        chart_path: &Path,
        release_name: &str,
        values: &[u8],
        opts: UpgradeOptions,
    ) -> Result<Release, Error> {
        let mut args = build_upgrade_args(self.version, release_name, chart_path, &opts);

        // Values travel through a temp file kept alive for the duration of
        // the command.
        let mut values_file = None;
        if !values.is_empty() {
            let file = tempfile::Builder::new()
                .prefix("helm-values-")
                .suffix(".yaml")
                .tempfile()?;
            tokio::fs::File::from_std(file.reopen()?)
                .write_all(values)
                .await?;
            args.push("--values".to_string());
            args.push(file.path().display().to_string());
            values_file = Some(file);
        }

        // The post-renderer is this binary's own `post-render` subcommand,
        // configured through a serialized inject-spec.
        let mut post_render_file = None;
        if let Some(spec) = &opts.post_render {
            let file = tempfile::Builder::new()
                .prefix("helm-postrender-")
                .suffix(".json")
                .tempfile()?;
            let payload = serde_json::to_vec(spec)
                .map_err(|e| Error::invariant(format!("failed to serialize inject spec: {e}")))?;
            tokio::fs::File::from_std(file.reopen()?)
                .write_all(&payload)
                .await?;
            let exe = std::env::current_exe()?;
            args.push("--post-renderer".to_string());
            args.push(exe.display().to_string());
            args.push("--post-renderer-args".to_string());
            args.push("post-render".to_string());
            args.push("--post-renderer-args".to_string());
            args.push(format!("--config={}", file.path().display()));
            post_render_file = Some(file);
        }

        let result = self.run(&args).await;
        drop(values_file);
        drop(post_render_file);
        parse_release(&result?, &opts.namespace)
    }

    async fn rollback(&self, release_name: &str, opts: RollbackOptions) -> Result<Release, Error> {
        let mut args = vec![
            "rollback".to_string(),
            release_name.to_string(),
            "--namespace".to_string(),
            opts.namespace.clone(),
            "--timeout".to_string(),
            format_timeout(self.version, opts.timeout),
        ];
        if opts.wait {
            args.push("--wait".to_string());
        }
        if opts.disable_hooks {
            args.push("--no-hooks".to_string());
        }
        if opts.recreate {
            args.push("--recreate-pods".to_string());
        }
        if opts.force {
            args.push("--force".to_string());
        }
        self.run(&args).await?;

        // Helm's rollback output is human-oriented; read the resulting
        // release back for the caller.
        let rolled = self
            .get(
                release_name,
                GetOptions {
                    namespace: opts.namespace.clone(),
                    version: None,
                },
            )
            .await?;
        rolled.ok_or_else(|| Error::action_failure("release vanished during rollback"))
    }

    async fn test(&self, release_name: &str, opts: TestOptions) -> Result<(), Error> {
        let mut args = vec![
            "test".to_string(),
            release_name.to_string(),
            "--namespace".to_string(),
            opts.namespace.clone(),
            "--timeout".to_string(),
            format_timeout(self.version, opts.timeout),
        ];
        if opts.cleanup && self.version == HelmVersion::V2 {
            args.push("--cleanup".to_string());
        }
        self.run(&args).await?;
        Ok(())
    }

    async fn uninstall(&self, release_name: &str, opts: UninstallOptions) -> Result<(), Error> {
        let args = match self.version {
            HelmVersion::V3 => {
                let mut args = vec![
                    "uninstall".to_string(),
                    release_name.to_string(),
                    "--namespace".to_string(),
                    opts.namespace.clone(),
                    "--timeout".to_string(),
                    format_timeout(self.version, opts.timeout),
                ];
                if opts.keep_history {
                    args.push("--keep-history".to_string());
                }
                args
            }
            HelmVersion::V2 => {
                let mut args = vec!["delete".to_string(), release_name.to_string()];
                if !opts.keep_history {
                    args.push("--purge".to_string());
                }
                args
            }
        };
        match self.run(&args).await {
            Ok(_) => Ok(()),
            Err(Error::ActionFailure(msg)) if is_not_found(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn dependency_update(&self, chart_path: &Path) -> Result<(), Error> {
        let args = vec![
            "dependency".to_string(),
            "update".to_string(),
            chart_path.display().to_string(),
        ];
        self.run(&args).await?;
        Ok(())
    }

    async fn get_chart_revision(&self, chart_path: &Path) -> Result<String, Error> {
        let subcommand = match self.version {
            HelmVersion::V3 => vec!["show".to_string(), "chart".to_string()],
            HelmVersion::V2 => vec!["inspect".to_string(), "chart".to_string()],
        };
        let mut args = subcommand;
        args.push(chart_path.display().to_string());
        let stdout = self.run(&args).await?;
        let metadata: ChartMetadata = serde_yaml::from_str(&stdout)
            .map_err(|e| Error::chart_unavailable(format!("failed to read chart metadata: {e}")))?;
        Ok(metadata.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_opts() -> UpgradeOptions {
        UpgradeOptions {
            namespace: "apps".to_string(),
            max_history: 10,
            ..Default::default()
        }
    }

    // =========================================================================
    // Argument Construction
    // =========================================================================
    //
    // The flag set is the contract with the Helm binary; these tests pin it
    // down without spawning a process.

    #[test]
    fn upgrade_args_carry_namespace_and_json_output() {
        let args = build_upgrade_args(
            HelmVersion::V3,
            "podinfo",
            Path::new("/tmp/chart"),
            &base_opts(),
        );
        assert_eq!(args[0], "upgrade");
        assert_eq!(args[1], "podinfo");
        assert!(args.contains(&"--namespace".to_string()));
        assert!(args.contains(&"apps".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(!args.contains(&"--install".to_string()));
    }

    #[test]
    fn install_and_dry_run_flags_are_emitted() {
        let opts = UpgradeOptions {
            install: true,
            dry_run: true,
            ..base_opts()
        };
        let args = build_upgrade_args(HelmVersion::V3, "podinfo", Path::new("/tmp/chart"), &opts);
        assert!(args.contains(&"--install".to_string()));
        assert!(args.contains(&"--dry-run".to_string()));
    }

    /// reuse-values and reset-values are mutually exclusive at the call
    /// site; the builder emits whichever one is set
    #[test]
    fn value_strategy_flags() {
        let opts = UpgradeOptions {
            reuse_values: true,
            ..base_opts()
        };
        let args = build_upgrade_args(HelmVersion::V3, "r", Path::new("/c"), &opts);
        assert!(args.contains(&"--reuse-values".to_string()));
        assert!(!args.contains(&"--reset-values".to_string()));

        let opts = UpgradeOptions {
            reset_values: true,
            ..base_opts()
        };
        let args = build_upgrade_args(HelmVersion::V3, "r", Path::new("/c"), &opts);
        assert!(args.contains(&"--reset-values".to_string()));
    }

    #[test]
    fn timeout_format_differs_between_versions() {
        assert_eq!(format_timeout(HelmVersion::V3, 300), "300s");
        assert_eq!(format_timeout(HelmVersion::V2, 300), "300");
    }

    // =========================================================================
    // Output Parsing
    // =========================================================================

    #[test]
    fn release_payload_parses_status_json() {
        let json = r#"{
            "name": "podinfo",
            "namespace": "apps",
            "version": 4,
            "manifest": "---\nkind: Deployment\n",
            "info": {"status": "deployed", "notes": "ignored"}
        }"#;
        let release = parse_release(json, "fallback").unwrap();
        assert_eq!(release.name, "podinfo");
        assert_eq!(release.namespace, "apps");
        assert_eq!(release.version, 4);
        assert_eq!(release.status, ReleaseStatus::Deployed);
        assert!(release.manifest.contains("kind: Deployment"));
    }

    #[test]
    fn release_payload_falls_back_to_request_namespace() {
        let json = r#"{"name": "podinfo", "version": 1, "info": {"status": "failed"}}"#;
        let release = parse_release(json, "apps").unwrap();
        assert_eq!(release.namespace, "apps");
        assert_eq!(release.status, ReleaseStatus::Failed);
    }

    #[test]
    fn history_entries_parse_and_sort_most_recent_first() {
        let json = r#"[
            {"revision": 1, "status": "superseded"},
            {"revision": 2, "status": "deployed"}
        ]"#;
        let mut entries: Vec<HistoryEntry> = serde_json::from_str(json).unwrap();
        entries.sort_by(|a, b| b.version.cmp(&a.version));
        assert_eq!(entries[0].version, 2);
        assert_eq!(entries[1].status, ReleaseStatus::Superseded);
    }

    #[test]
    fn chart_metadata_reads_version() {
        let yaml = "apiVersion: v2\nname: podinfo\nversion: 1.2.3\nappVersion: 6.0.0\n";
        let metadata: ChartMetadata = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(metadata.version, "1.2.3");
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found("Error: release: not found"));
        assert!(!is_not_found("Error: connection refused"));
    }
}
