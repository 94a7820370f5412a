//! Helm v2 to v3 release conversion
//!
//! Wraps the `helm 2to3` plugin behind a trait so the decision machine and
//! the migrate action can be tested without Tiller state.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::ListParams;
use kube::{Api, Client};
use tokio::process::Command;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Converter between Helm v2 and v3 release storage
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Converter: Send + Sync {
    /// Whether a Helm v2 (Tiller) release with the given name exists
    async fn v2_release_exists(&self, release_name: &str) -> Result<bool, Error>;

    /// Convert the v2 release to v3 storage. With `dry_run` the plugin only
    /// reports what it would do.
    async fn convert(&self, release_name: &str, dry_run: bool) -> Result<(), Error>;
}

/// Converter invoking the `helm 2to3` plugin, detecting v2 releases through
/// the Tiller ConfigMaps in `kube-system`
pub struct Helm2To3 {
    client: Client,
    helm_bin: PathBuf,
}

impl Helm2To3 {
    /// Tiller stores release state in ConfigMaps labelled with its owner tag
    const TILLER_NAMESPACE: &'static str = "kube-system";

    /// Create a converter using the given Kubernetes client and Helm binary
    pub fn new(client: Client, helm_bin: impl Into<PathBuf>) -> Self {
        Self {
            client,
            helm_bin: helm_bin.into(),
        }
    }
}

#[async_trait]
impl Converter for Helm2To3 {
    async fn v2_release_exists(&self, release_name: &str) -> Result<bool, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), Self::TILLER_NAMESPACE);
        let params =
            ListParams::default().labels(&format!("OWNER=TILLER,NAME={release_name}"));
        let list = api.list(&params).await?;
        Ok(!list.items.is_empty())
    }

    async fn convert(&self, release_name: &str, dry_run: bool) -> Result<(), Error> {
        let mut args = vec![
            "2to3".to_string(),
            "convert".to_string(),
            release_name.to_string(),
        ];
        if dry_run {
            args.push("--dry-run".to_string());
        }
        info!(release = release_name, dry_run, "converting v2 release");
        let output = Command::new(&self.helm_bin)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::migration_failure(format!("failed to run helm 2to3: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::migration_failure(stderr));
        }
        Ok(())
    }
}
