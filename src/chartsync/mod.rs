//! Chart source resolution
//!
//! Turns the chart source of a HelmRelease into a local chart path, a
//! source-derived revision, and a changed flag relative to the last
//! attempted revision. Downloads are cached under a shared directory;
//! identical fetches collide into one file.

mod crypto;
mod git;
mod oss;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::crd::{CustomizeSource, HelmRelease, RepoChartSource, SourceKind};
use crate::helm::HelmClient;
use crate::Error;

pub use crypto::{AckCipher, DEFAULT_ACK_KEY};
pub use git::{Export, GitChartSync};
pub use oss::{endpoint, FetchRequest, ObjectFetcher, OssProvider};
#[cfg(test)]
pub use oss::MockObjectFetcher;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;

/// A chart resolved to the local filesystem
#[derive(Clone, Debug, Default)]
pub struct Chart {
    /// Path of the chart directory or archive
    pub chart_path: PathBuf,
    /// Source-derived revision (git SHA, chart version, object revision)
    pub revision: String,
    /// Whether the revision differs from the last attempted one
    pub changed: bool,
}

/// Configuration of the chart source resolver
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding cached chart downloads
    pub chart_cache: PathBuf,
    /// Run `helm dependency update` for git charts
    pub update_deps: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chart_cache: PathBuf::from("/tmp"),
            update_deps: true,
        }
    }
}

/// Chart source resolver shared by all workers
pub struct ChartSync {
    config: Config,
    git: Arc<GitChartSync>,
    cipher: Arc<AckCipher>,
    http: reqwest::Client,
}

impl ChartSync {
    /// Create a resolver with the given configuration and credential cipher
    pub fn new(config: Config, git: Arc<GitChartSync>, cipher: Arc<AckCipher>) -> Self {
        Self {
            config,
            git,
            cipher,
            http: reqwest::Client::new(),
        }
    }

    /// Resolve the chart for a HelmRelease.
    ///
    /// Returns the chart and, for git sources, the export that keeps the
    /// working copy alive; the caller holds it for the duration of the sync.
    pub async fn prepare_chart(
        &self,
        client: &dyn HelmClient,
        hr: &HelmRelease,
    ) -> Result<(Chart, Option<Export>), Error> {
        let last_attempted = hr
            .status
            .as_ref()
            .and_then(|s| s.last_attempted_revision.clone())
            .unwrap_or_default();

        match hr.spec.chart.source()? {
            SourceKind::Git(source) => {
                let (export, revision) = self.git.export(source).await?;
                let chart_path = export.dir().join(&source.path);
                let changed = self
                    .git
                    .changed_files(source, &last_attempted, &revision)
                    .await;
                if self.config.update_deps && !source.skip_dep_update {
                    client.dependency_update(&chart_path).await?;
                }
                Ok((
                    Chart {
                        chart_path,
                        revision,
                        changed,
                    },
                    Some(export),
                ))
            }
            SourceKind::Repo(source) => {
                let chart_path = self.ensure_repo_chart(source).await?;
                let revision = client.get_chart_revision(&chart_path).await?;
                let changed = last_attempted != revision;
                Ok((
                    Chart {
                        chart_path,
                        revision,
                        changed,
                    },
                    None,
                ))
            }
            SourceKind::Customize(source) => {
                let chart_path = self.download_object(source).await?;
                let revision = client.get_chart_revision(&chart_path).await?;
                let changed = last_attempted != revision;
                Ok((
                    Chart {
                        chart_path,
                        revision,
                        changed,
                    },
                    None,
                ))
            }
            SourceKind::Oss(source) => {
                let provider =
                    OssProvider::new(source.clone(), &self.config.chart_cache, self.cipher.clone());
                let chart_path = provider.download_file(source.use_cache).await?;
                let revision = client.get_chart_revision(&chart_path).await?;
                let changed = last_attempted != revision;
                Ok((
                    Chart {
                        chart_path,
                        revision,
                        changed,
                    },
                    None,
                ))
            }
        }
    }

    /// Fetch (or reuse) the `<name>-<version>.tgz` archive of a chart
    /// repository source
    async fn ensure_repo_chart(&self, source: &RepoChartSource) -> Result<PathBuf, Error> {
        let cache_path = self.config.chart_cache.join(source.archive_name());
        if cache_path.exists() {
            debug!(path = %cache_path.display(), "reusing cached chart archive");
            return Ok(cache_path);
        }
        let url = format!(
            "{}/{}",
            source.repository.trim_end_matches('/'),
            source.archive_name()
        );
        self.download_url(&url, &cache_path).await?;
        Ok(cache_path)
    }

    /// Download a single-object source to its cache file
    async fn download_object(&self, source: &CustomizeSource) -> Result<PathBuf, Error> {
        let cache_path = self
            .config
            .chart_cache
            .join(URL_SAFE.encode(source.key.as_bytes()));
        if source.use_cache && cache_path.exists() {
            debug!(path = %cache_path.display(), "reusing cached chart object");
            return Ok(cache_path);
        }
        self.download_url(&source.key, &cache_path).await?;
        Ok(cache_path)
    }

    async fn download_url(&self, url: &str, dest: &std::path::Path) -> Result<(), Error> {
        debug!(url, dest = %dest.display(), "downloading chart");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::chart_unavailable(format!("failed to fetch '{url}': {e}")))?
            .error_for_status()
            .map_err(|e| Error::chart_unavailable(format!("failed to fetch '{url}': {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::chart_unavailable(format!("failed to read '{url}': {e}")))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ChartSource, HelmReleaseSpec, HelmReleaseStatus};
    use crate::helm::MockHelmClient;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn release_with_source(chart: ChartSource) -> HelmRelease {
        HelmRelease {
            metadata: ObjectMeta {
                name: Some("podinfo".to_string()),
                namespace: Some("apps".to_string()),
                ..Default::default()
            },
            spec: HelmReleaseSpec {
                chart,
                ..Default::default()
            },
            status: None,
        }
    }

    fn sync_in(dir: &std::path::Path) -> ChartSync {
        ChartSync::new(
            Config {
                chart_cache: dir.to_path_buf(),
                update_deps: true,
            },
            Arc::new(GitChartSync::new(dir.join("mirrors"))),
            Arc::new(AckCipher::with_default_key()),
        )
    }

    /// Story: a release without a chart source cannot be resolved, and the
    /// error names the problem
    #[tokio::test]
    async fn story_no_source_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path());
        let hr = release_with_source(ChartSource::default());
        let client = MockHelmClient::new();

        let err = sync.prepare_chart(&client, &hr).await.unwrap_err();
        assert!(err.to_string().contains("valid chart source"));
    }

    /// Story: a cached repo archive is reused without a network fetch, and
    /// `changed` reflects the revision comparison
    #[tokio::test]
    async fn story_cached_repo_archive_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path());

        // Pre-seed the cache so no download is attempted (the repository
        // URL is unreachable on purpose).
        std::fs::write(dir.path().join("podinfo-1.0.0.tgz"), b"archive").unwrap();

        let hr = release_with_source(ChartSource {
            repo: Some(RepoChartSource {
                repository: "http://127.0.0.1:1/charts".to_string(),
                name: "podinfo".to_string(),
                version: "1.0.0".to_string(),
            }),
            ..Default::default()
        });

        let mut client = MockHelmClient::new();
        client
            .expect_get_chart_revision()
            .returning(|_| Ok("1.0.0".to_string()));

        let (chart, export) = sync.prepare_chart(&client, &hr).await.unwrap();
        assert!(export.is_none());
        assert_eq!(chart.revision, "1.0.0");
        assert!(chart.changed, "no last attempted revision means changed");
        assert!(chart.chart_path.ends_with("podinfo-1.0.0.tgz"));
    }

    /// Story: an unchanged revision is reported as such, which is what
    /// routes the reconciliation into the dry-run comparison
    #[tokio::test]
    async fn story_unchanged_revision_is_not_changed() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path());
        std::fs::write(dir.path().join("podinfo-1.0.0.tgz"), b"archive").unwrap();

        let mut hr = release_with_source(ChartSource {
            repo: Some(RepoChartSource {
                repository: "http://127.0.0.1:1/charts".to_string(),
                name: "podinfo".to_string(),
                version: "1.0.0".to_string(),
            }),
            ..Default::default()
        });
        hr.status = Some(HelmReleaseStatus {
            last_attempted_revision: Some("1.0.0".to_string()),
            ..Default::default()
        });

        let mut client = MockHelmClient::new();
        client
            .expect_get_chart_revision()
            .returning(|_| Ok("1.0.0".to_string()));

        let (chart, _) = sync.prepare_chart(&client, &hr).await.unwrap();
        assert!(!chart.changed);
    }

    /// Story: a single-object source with useCache reuses the cache file
    /// named by the URL-safe encoding of the key
    #[tokio::test]
    async fn story_customize_source_honors_use_cache() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path());

        let key = "http://127.0.0.1:1/objects/podinfo.tgz";
        let cache_name = URL_SAFE.encode(key.as_bytes());
        std::fs::write(dir.path().join(&cache_name), b"archive").unwrap();

        let hr = release_with_source(ChartSource {
            customize: Some(CustomizeSource {
                key: key.to_string(),
                use_cache: true,
            }),
            ..Default::default()
        });

        let mut client = MockHelmClient::new();
        client
            .expect_get_chart_revision()
            .returning(|_| Ok("2.1.0".to_string()));

        let (chart, _) = sync.prepare_chart(&client, &hr).await.unwrap();
        assert_eq!(chart.revision, "2.1.0");
        assert!(chart.chart_path.ends_with(cache_name));
    }

    /// An unreachable download surfaces as a chart-unavailable error
    #[tokio::test]
    async fn unreachable_download_is_chart_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let sync = sync_in(dir.path());
        let hr = release_with_source(ChartSource {
            customize: Some(CustomizeSource {
                key: "http://127.0.0.1:1/objects/podinfo.tgz".to_string(),
                use_cache: false,
            }),
            ..Default::default()
        });
        let client = MockHelmClient::new();

        let err = sync.prepare_chart(&client, &hr).await.unwrap_err();
        assert!(matches!(err, Error::ChartUnavailable(_)));
    }
}
