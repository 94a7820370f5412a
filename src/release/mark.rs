//! Out-of-band labeling and annotation of released objects
//!
//! After a successful action the released objects are labeled with the
//! application identity and annotated with the owning resource id through
//! `kubectl` (`--overwrite`), grouped per namespace. Failures here are
//! warnings for the caller, never reconciliation failures.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{HelmRelease, ANTECEDENT_ANNOTATION};
use crate::error::ErrorCollection;
use crate::helm::Release;
use crate::Error;

use super::manifest::{namespaced_resource_map, parse_documents};
use super::postrender::{
    APP_ID_LABEL, COMPONENT_ID_LABEL, ISTIO_LABEL_KEY, ISTIO_LABEL_VALUE, LOG_COLLECT_ANNOTATION,
};

/// Labeling large umbrella charts can take a while.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(120);

/// Marks released objects with identity labels and ownership annotations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Marker: Send + Sync {
    /// Apply identity labels and the log-collect annotation to the objects
    /// of the release
    async fn mark(&self, hr: &HelmRelease, rel: &Release) -> Result<(), Error>;

    /// Attach the owning resource id to the objects of the release
    async fn annotate(&self, hr: &HelmRelease, rel: &Release) -> Result<(), Error>;
}

/// Marker invoking the `kubectl` binary
pub struct KubectlMarker {
    bin: String,
}

impl KubectlMarker {
    /// Create a marker using the given kubectl binary
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    async fn run(&self, args: &[String]) -> Result<(), Error> {
        debug!(kubectl = %self.bin, ?args, "running kubectl");
        let output = tokio::time::timeout(
            KUBECTL_TIMEOUT,
            Command::new(&self.bin)
                .args(args)
                .stdin(Stdio::null())
                .output(),
        )
        .await
        .map_err(|_| Error::action_failure("kubectl timed out"))?
        .map_err(|e| Error::action_failure(format!("failed to run kubectl: {e}")))?;

        if !output.status.success() {
            // Non-empty combined output becomes the error message.
            let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if !stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            if !combined.is_empty() {
                return Err(Error::action_failure(combined));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Marker for KubectlMarker {
    async fn mark(&self, hr: &HelmRelease, rel: &Release) -> Result<(), Error> {
        let spec = &hr.spec;
        if spec.app_id.is_empty()
            && spec.component_id.is_empty()
            && !spec.istio_enabled
            && !spec.log_collect
        {
            return Ok(());
        }

        let docs = parse_documents(&rel.manifest);
        let resources = namespaced_resource_map(&docs, &rel.namespace);
        let mut errs = ErrorCollection::new();

        for (namespace, refs) in &resources {
            let mut args = vec![
                "label".to_string(),
                "--overwrite".to_string(),
                "--namespace".to_string(),
                namespace.clone(),
            ];
            args.extend(refs.iter().cloned());
            if !spec.app_id.is_empty() {
                args.push(format!("{}={}", APP_ID_LABEL, spec.app_id));
            }
            if !spec.component_id.is_empty() {
                args.push(format!("{}={}", COMPONENT_ID_LABEL, spec.component_id));
            }
            if spec.istio_enabled {
                args.push(format!("{}={}", ISTIO_LABEL_KEY, ISTIO_LABEL_VALUE));
            }
            if let Err(e) = self.run(&args).await {
                errs.push(e);
            }
        }

        if spec.log_collect {
            for (namespace, refs) in &resources {
                let mut args = vec![
                    "annotate".to_string(),
                    "--overwrite".to_string(),
                    "--namespace".to_string(),
                    namespace.clone(),
                ];
                args.extend(refs.iter().cloned());
                args.push(format!("{}=true", LOG_COLLECT_ANNOTATION));
                if let Err(e) = self.run(&args).await {
                    errs.push(e);
                }
            }
        }

        errs.into_result()
    }

    async fn annotate(&self, hr: &HelmRelease, rel: &Release) -> Result<(), Error> {
        let docs = parse_documents(&rel.manifest);
        let mut errs = ErrorCollection::new();

        for (namespace, refs) in namespaced_resource_map(&docs, &rel.namespace) {
            let mut args = vec![
                "annotate".to_string(),
                "--overwrite".to_string(),
                "--namespace".to_string(),
                namespace,
            ];
            args.extend(refs);
            args.push(format!("{}={}", ANTECEDENT_ANNOTATION, hr.resource_id()));
            if let Err(e) = self.run(&args).await {
                errs.push(e);
            }
        }

        errs.into_result()
    }
}
