//! Git chart mirrors
//!
//! Each git chart source is backed by a bare mirror clone under the chart
//! cache. Reconciliation exports a working copy pinned to the resolved
//! revision; the export directory is temporary and cleaned up when the
//! export handle is dropped.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::crd::GitChartSource;
use crate::Error;

/// Temporary working copy of a chart repository pinned to one revision.
///
/// Dropping the export removes the directory; holding it for the duration
/// of a sync is the cleanup contract of [`GitChartSync::export`].
#[derive(Debug)]
pub struct Export {
    dir: TempDir,
}

impl Export {
    /// Directory of the working copy
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Manager of bare git mirrors for chart sources
pub struct GitChartSync {
    base: PathBuf,
}

impl GitChartSync {
    /// Create a manager storing mirrors under the given directory
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Mirror directory for a repository URL
    fn mirror_path(&self, url: &str) -> PathBuf {
        self.base
            .join(format!("{}.git", URL_SAFE.encode(url.as_bytes())))
    }

    async fn run_git(&self, args: &[String], cwd: Option<&Path>) -> Result<String, Error> {
        debug!(?args, "running git");
        let mut cmd = Command::new("git");
        cmd.args(args).stdin(Stdio::null());
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| Error::chart_unavailable(format!("failed to run git: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::chart_unavailable(format!("git: {stderr}")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Bring the mirror for the source up to date, cloning it on first use.
    pub async fn sync_mirror(&self, source: &GitChartSource) -> Result<(), Error> {
        let mirror = self.mirror_path(&source.git);
        if mirror.exists() {
            self.run_git(
                &["remote".into(), "update".into(), "--prune".into()],
                Some(&mirror),
            )
            .await?;
        } else {
            tokio::fs::create_dir_all(&self.base).await?;
            self.run_git(
                &[
                    "clone".into(),
                    "--mirror".into(),
                    source.git.clone(),
                    mirror.display().to_string(),
                ],
                None,
            )
            .await?;
        }
        Ok(())
    }

    /// Resolve the source ref against the mirror
    async fn resolve_revision(&self, source: &GitChartSource) -> Result<String, Error> {
        let mirror = self.mirror_path(&source.git);
        let out = self
            .run_git(
                &["rev-parse".into(), format!("{}^{{commit}}", source.git_ref)],
                Some(&mirror),
            )
            .await?;
        Ok(out.trim().to_string())
    }

    /// Export a working copy pinned to the resolved revision of the source,
    /// returning the export handle and the revision.
    pub async fn export(&self, source: &GitChartSource) -> Result<(Export, String), Error> {
        self.sync_mirror(source).await?;
        let revision = self.resolve_revision(source).await?;

        let dir = tempfile::Builder::new()
            .prefix("helm-operator-export-")
            .tempdir()?;
        let mirror = self.mirror_path(&source.git);
        self.run_git(
            &[
                "clone".into(),
                mirror.display().to_string(),
                dir.path().display().to_string(),
            ],
            None,
        )
        .await?;
        self.run_git(
            &["checkout".into(), "--detach".into(), revision.clone()],
            Some(dir.path()),
        )
        .await?;

        Ok((Export { dir }, revision))
    }

    /// Whether any file under the chart path differs between the two
    /// revisions. Unresolvable revisions are treated as unchanged (the
    /// dry-run comparison downstream still converges the release).
    pub async fn changed_files(
        &self,
        source: &GitChartSource,
        from: &str,
        to: &str,
    ) -> bool {
        if from == to {
            return false;
        }
        if from.is_empty() {
            // Never attempted before: everything counts as new.
            return true;
        }
        let mirror = self.mirror_path(&source.git);
        match self
            .run_git(
                &[
                    "diff".into(),
                    "--name-only".into(),
                    from.to_string(),
                    to.to_string(),
                    "--".into(),
                    source.path.clone(),
                ],
                Some(&mirror),
            )
            .await
        {
            Ok(out) => out.lines().any(|l| !l.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, from, to, "could not diff chart revisions");
                false
            }
        }
    }

    /// Drop the mirror of the source (used when a git-sourced release is
    /// uninstalled)
    pub async fn delete(&self, source: &GitChartSource) -> Result<(), Error> {
        let mirror = self.mirror_path(&source.git);
        if mirror.exists() {
            tokio::fs::remove_dir_all(&mirror).await?;
        }
        Ok(())
    }
}
