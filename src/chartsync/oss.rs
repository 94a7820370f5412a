//! Cloud object store chart sources
//!
//! Each vendor maps a region to a deterministic endpoint URL and downloads a
//! keyed object into the chart cache. The actual byte transfer goes through
//! the narrow [`ObjectFetcher`] contract; production implementations drive
//! the vendor CLI tools, tests substitute a mock.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use tokio::process::Command;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::crd::{CloudProvider, OssSource};
use crate::Error;

use super::crypto::AckCipher;

/// One object download, fully resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Endpoint URL for the region
    pub endpoint: String,
    /// Bucket name
    pub bucket: String,
    /// Object key
    pub key: String,
    /// Decoded access key id
    pub access_id: String,
    /// Decoded access key secret
    pub access_secret: String,
    /// Local file the object is written to
    pub dest: PathBuf,
}

/// Narrow "fetch object to local path" contract over the vendor tooling
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// Download the object described by the request to `req.dest`
    async fn fetch(&self, req: &FetchRequest) -> Result<(), Error>;
}

/// Map a region to the vendor's endpoint URL
pub fn endpoint(provider: CloudProvider, region_id: &str) -> String {
    match provider {
        CloudProvider::Aliyun => format!("http://{region_id}.aliyuncs.com"),
        CloudProvider::Huaweiyun => format!("http://obs.{region_id}.myhuaweicloud.com"),
    }
}

/// Chart provider for one object store source
pub struct OssProvider {
    source: OssSource,
    base: PathBuf,
    cipher: Arc<AckCipher>,
    fetcher: Arc<dyn ObjectFetcher>,
}

impl OssProvider {
    /// Create a provider with the vendor's CLI-backed fetcher
    pub fn new(source: OssSource, base: impl Into<PathBuf>, cipher: Arc<AckCipher>) -> Self {
        let fetcher: Arc<dyn ObjectFetcher> = match source.cloud_provider {
            CloudProvider::Aliyun => Arc::new(OssutilFetcher::default()),
            CloudProvider::Huaweiyun => Arc::new(ObsutilFetcher::default()),
        };
        Self::with_fetcher(source, base, cipher, fetcher)
    }

    /// Create a provider with a custom fetcher (used by tests)
    pub fn with_fetcher(
        source: OssSource,
        base: impl Into<PathBuf>,
        cipher: Arc<AckCipher>,
        fetcher: Arc<dyn ObjectFetcher>,
    ) -> Self {
        Self {
            source,
            base: base.into(),
            cipher,
            fetcher,
        }
    }

    /// Cache file for this object, named by a URL-safe encoding of the key
    /// so identical fetches collide into one file
    pub fn cache_path(&self) -> PathBuf {
        self.base.join(URL_SAFE.encode(self.source.key.as_bytes()))
    }

    /// Download the object to the cache, honoring `use_cache`, and return
    /// the local path.
    ///
    /// Credentials are decoded before any vendor call; a decode failure is
    /// surfaced and no download is attempted.
    pub async fn download_file(&self, use_cache: bool) -> Result<PathBuf, Error> {
        let cache_path = self.cache_path();
        if use_cache && cache_path.exists() {
            debug!(path = %cache_path.display(), "reusing cached chart object");
            return Ok(cache_path);
        }

        let (access_id, access_secret) = self.cipher.decode_credentials(&self.source)?;
        let req = FetchRequest {
            endpoint: endpoint(self.source.cloud_provider, &self.source.region_id),
            bucket: self.source.bucket.clone(),
            key: self.source.key.clone(),
            access_id,
            access_secret,
            dest: cache_path.clone(),
        };
        self.fetcher.fetch(&req).await?;
        Ok(cache_path)
    }
}

async fn run_fetch_tool(bin: &str, args: &[String]) -> Result<(), Error> {
    let output = Command::new(bin)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::chart_unavailable(format!("failed to run {bin}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(Error::chart_unavailable(format!("{bin}: {stderr}")));
    }
    Ok(())
}

/// Fetcher driving Alibaba Cloud's `ossutil`
pub struct OssutilFetcher {
    bin: String,
}

impl Default for OssutilFetcher {
    fn default() -> Self {
        Self {
            bin: "ossutil".to_string(),
        }
    }
}

#[async_trait]
impl ObjectFetcher for OssutilFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<(), Error> {
        let args = vec![
            "cp".to_string(),
            format!("oss://{}/{}", req.bucket, req.key),
            req.dest.display().to_string(),
            "--endpoint".to_string(),
            req.endpoint.clone(),
            "--access-key-id".to_string(),
            req.access_id.clone(),
            "--access-key-secret".to_string(),
            req.access_secret.clone(),
            "--force".to_string(),
        ];
        run_fetch_tool(&self.bin, &args).await
    }
}

/// Fetcher driving Huawei Cloud's `obsutil`
pub struct ObsutilFetcher {
    bin: String,
}

impl Default for ObsutilFetcher {
    fn default() -> Self {
        Self {
            bin: "obsutil".to_string(),
        }
    }
}

#[async_trait]
impl ObjectFetcher for ObsutilFetcher {
    async fn fetch(&self, req: &FetchRequest) -> Result<(), Error> {
        let args = vec![
            "cp".to_string(),
            format!("obs://{}/{}", req.bucket, req.key),
            req.dest.display().to_string(),
            "-e".to_string(),
            req.endpoint.clone(),
            "-i".to_string(),
            req.access_id.clone(),
            "-k".to_string(),
            req.access_secret.clone(),
            "-f".to_string(),
        ];
        run_fetch_tool(&self.bin, &args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_source(provider: CloudProvider) -> OssSource {
        OssSource {
            cloud_provider: provider,
            region_id: "cn-hangzhou".to_string(),
            bucket: "charts".to_string(),
            key: "releases/podinfo-1.0.0.tgz".to_string(),
            ack_id: "id".to_string(),
            ack_secret: "secret".to_string(),
            ack_encrypted: false,
            use_cache: true,
        }
    }

    /// Counting fetcher that records how often the network was hit and
    /// creates the destination file like a real download would
    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl CountingFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ObjectFetcher for CountingFetcher {
        async fn fetch(&self, req: &FetchRequest) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::fs::write(&req.dest, b"chart bytes")?;
            Ok(())
        }
    }

    // =========================================================================
    // Endpoint Mapping
    // =========================================================================

    #[test]
    fn aliyun_endpoint_template() {
        assert_eq!(
            endpoint(CloudProvider::Aliyun, "cn-hangzhou"),
            "http://cn-hangzhou.aliyuncs.com"
        );
    }

    #[test]
    fn huaweiyun_endpoint_template() {
        assert_eq!(
            endpoint(CloudProvider::Huaweiyun, "cn-north-4"),
            "http://obs.cn-north-4.myhuaweicloud.com"
        );
    }

    // =========================================================================
    // Cache Behavior Stories
    // =========================================================================

    /// Story: with useCache on, the second download of the same key does
    /// not touch the network (cache idempotence)
    #[tokio::test]
    async fn story_cached_object_is_fetched_at_most_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new();
        let provider = OssProvider::with_fetcher(
            sample_source(CloudProvider::Aliyun),
            dir.path(),
            Arc::new(AckCipher::with_default_key()),
            fetcher.clone(),
        );

        let first = provider.download_file(true).await.unwrap();
        let second = provider.download_file(true).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    /// Story: without useCache, every call re-downloads (last writer wins)
    #[tokio::test]
    async fn story_uncached_object_is_fetched_every_time() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new();
        let provider = OssProvider::with_fetcher(
            sample_source(CloudProvider::Huaweiyun),
            dir.path(),
            Arc::new(AckCipher::with_default_key()),
            fetcher.clone(),
        );

        provider.download_file(false).await.unwrap();
        provider.download_file(false).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    /// The cache file name is a URL-safe encoding of the object key, so
    /// identical keys collide into one file and slashes never leak into
    /// the filesystem
    #[test]
    fn cache_path_is_url_safe_encoding_of_key() {
        let dir = tempfile::tempdir().unwrap();
        let provider = OssProvider::with_fetcher(
            sample_source(CloudProvider::Aliyun),
            dir.path(),
            Arc::new(AckCipher::with_default_key()),
            CountingFetcher::new(),
        );
        let name = provider
            .cache_path()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(!name.contains('/'));
        let decoded = URL_SAFE.decode(name.as_bytes()).unwrap();
        assert_eq!(decoded, b"releases/podinfo-1.0.0.tgz");
    }

    /// Story: a credential decode failure surfaces before any fetch
    #[tokio::test]
    async fn story_decode_failure_prevents_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = CountingFetcher::new();
        let mut source = sample_source(CloudProvider::Aliyun);
        source.ack_encrypted = true;
        source.ack_id = "not-a-ciphertext".to_string();
        let provider = OssProvider::with_fetcher(
            source,
            dir.path(),
            Arc::new(AckCipher::with_default_key()),
            fetcher.clone(),
        );

        let err = provider.download_file(false).await.unwrap_err();
        assert!(matches!(err, Error::Decode(_)));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    }

    /// Decoded credentials reach the fetcher, not the raw envelope
    #[tokio::test]
    async fn decoded_credentials_reach_the_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = Arc::new(AckCipher::with_default_key());

        let mut mock = MockObjectFetcher::new();
        mock.expect_fetch()
            .withf(|req| req.access_id == "real-id" && req.access_secret == "real-secret")
            .returning(|req| {
                std::fs::write(&req.dest, b"x")?;
                Ok(())
            });

        let mut source = sample_source(CloudProvider::Aliyun);
        source.ack_encrypted = true;
        source.ack_id = cipher.encrypt("real-id");
        source.ack_secret = cipher.encrypt("real-secret");

        let provider =
            OssProvider::with_fetcher(source, dir.path(), cipher.clone(), Arc::new(mock));
        provider.download_file(false).await.unwrap();
    }
}
