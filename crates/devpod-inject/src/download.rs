//! Agent binary download and on-disk cache

use crate::{Arch, DownloadError};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source of artifact bytes
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Fetch the whole body at `url`
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError>;
}

/// GET through a single reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Client verifying certificates
    pub fn strict() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self { client })
    }

    /// Client accepting any certificate
    pub fn relaxed_tls() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(DownloadError::Client)?;
        Ok(Self { client })
    }

    async fn get(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client.get(url).send().await?.error_for_status()?.bytes().await
    }
}

#[async_trait]
impl Fetch for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        self.get(url).await.map_err(|source| DownloadError::Request {
            url: url.to_string(),
            source,
        })
    }
}

/// Fetch with `primary`, retrying once with `fallback` when it fails.
/// The fallback's error is the one reported.
#[derive(Debug, Clone)]
pub struct Fallback<A, B> {
    primary: A,
    fallback: B,
}

impl<A: Fetch, B: Fetch> Fallback<A, B> {
    /// Pair two sources
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<A: Fetch, B: Fetch> Fetch for Fallback<A, B> {
    async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
        match self.primary.fetch(url).await {
            Ok(body) => Ok(body),
            Err(e) => {
                warn!(url, error = %e, "download failed, retrying");
                self.fallback.fetch(url).await
            }
        }
    }
}

/// HTTP fetcher retrying without certificate verification
pub type HttpFetcher = Fallback<ReqwestFetcher, ReqwestFetcher>;

impl HttpFetcher {
    /// Strict client first, relaxed TLS second
    pub fn with_tls_fallback() -> Result<Self, DownloadError> {
        Ok(Self::new(ReqwestFetcher::strict()?, ReqwestFetcher::relaxed_tls()?))
    }
}

/// URL of the agent build for `arch`
pub fn artifact_url(base_url: &str, arch: Arch) -> String {
    format!("{}/devpod-linux-{}", base_url.trim_end_matches('/'), arch)
}

/// Architecture-keyed cache of downloaded agent binaries.
///
/// Concurrent fills of the same entry are not serialized: every writer stages
/// into its own temp file and renames it over the entry, so the last rename
/// wins with identical content.
#[derive(Debug, Clone)]
pub struct BinaryCache<F = HttpFetcher> {
    dir: PathBuf,
    base_url: String,
    fetcher: F,
}

impl<F: Fetch> BinaryCache<F> {
    /// Create a cache in `dir` downloading from `base_url`
    pub fn new(dir: impl Into<PathBuf>, base_url: impl Into<String>, fetcher: F) -> Self {
        Self {
            dir: dir.into(),
            base_url: base_url.into(),
            fetcher,
        }
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache entry for `arch`
    pub fn path(&self, arch: Arch) -> PathBuf {
        self.dir.join(format!("devpod-linux-{}", arch))
    }

    /// Return the cached binary for `arch`, downloading it on a miss
    pub async fn fetch(&self, arch: Arch) -> Result<PathBuf, DownloadError> {
        let target = self.path(arch);

        let cached = tokio::fs::metadata(&target)
            .await
            .map(|meta| meta.is_file() && meta.len() > 0)
            .unwrap_or(false);
        if cached {
            debug!(path = %target.display(), "using cached agent binary");
            return Ok(target);
        }

        let url = artifact_url(&self.base_url, arch);
        info!(%url, "Downloading devpod agent");
        let body = self.fetcher.fetch(&url).await?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| DownloadError::Cache {
                path: self.dir.clone(),
                source,
            })?;

        let staging = self
            .dir
            .join(format!(".devpod-linux-{}.{}", arch, Uuid::new_v4().simple()));
        if let Err(source) = tokio::fs::write(&staging, &body).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(DownloadError::Cache { path: staging, source });
        }
        if let Err(source) = tokio::fs::rename(&staging, &target).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(DownloadError::Cache { path: target, source });
        }

        debug!(path = %target.display(), bytes = body.len(), "cached agent binary");
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingFetcher {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Fetch for Arc<CountingFetcher> {
        async fn fetch(&self, url: &str) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            Ok(Bytes::from(format!("binary from {}", url)))
        }
    }

    /// Source that fails until it has been called `failures` times
    struct FlakyFetcher {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyFetcher {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetch for Arc<FlakyFetcher> {
        async fn fetch(&self, _url: &str) -> Result<Bytes, DownloadError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(DownloadError::Cache {
                    path: PathBuf::from("/unreachable"),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            Ok(Bytes::from_static(b"agent"))
        }
    }

    #[tokio::test]
    async fn test_fallback_is_skipped_on_success() {
        let primary = FlakyFetcher::failing(0);
        let fallback = FlakyFetcher::failing(0);
        let fetcher = Fallback::new(primary.clone(), fallback.clone());

        assert_eq!(fetcher.fetch("https://example.com/a").await.unwrap(), "agent");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_failure_retries_exactly_once() {
        let primary = FlakyFetcher::failing(usize::MAX);
        let fallback = FlakyFetcher::failing(0);
        let fetcher = Fallback::new(primary.clone(), fallback.clone());

        assert_eq!(fetcher.fetch("https://example.com/a").await.unwrap(), "agent");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_second_failure_surfaces_request_error() {
        let primary = FlakyFetcher::failing(usize::MAX);
        let fetcher = Fallback::new(primary.clone(), ReqwestFetcher::relaxed_tls().unwrap());

        // an unparsable URL fails inside reqwest without touching the network
        let error = fetcher.fetch("not a url").await.unwrap_err();

        assert!(matches!(error, DownloadError::Request { ref url, .. } if url == "not a url"));
        assert_eq!(error.to_string(), "request not a url");
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_fetcher_reports_last_attempt() {
        let fetcher = HttpFetcher::with_tls_fallback().unwrap();

        let error = fetcher.fetch("not a url").await.unwrap_err();

        assert!(matches!(error, DownloadError::Request { .. }));
    }

    #[test]
    fn test_artifact_url() {
        assert_eq!(
            artifact_url("https://example.com/releases/", Arch::Arm64),
            "https://example.com/releases/devpod-linux-arm64"
        );
        assert_eq!(
            artifact_url("https://example.com", Arch::Amd64),
            "https://example.com/devpod-linux-amd64"
        );
    }

    #[tokio::test]
    async fn test_downloads_once_per_arch() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = BinaryCache::new(dir.path().join("cache"), "https://example.com", fetcher.clone());

        let first = cache.fetch(Arch::Amd64).await.unwrap();
        let second = cache.fetch(Arch::Amd64).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        cache.fetch(Arch::Arm64).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);

        let contents = std::fs::read_to_string(&first).unwrap();
        assert_eq!(contents, "binary from https://example.com/devpod-linux-amd64");
    }

    #[tokio::test]
    async fn test_concurrent_fills_leave_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = Arc::new(BinaryCache::new(dir.path(), "https://example.com", fetcher.clone()));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.fetch(Arch::Arm64).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // no staging files left behind, whatever the interleaving
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, ["devpod-linux-arm64"]);
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_empty_entry_is_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(CountingFetcher::default());
        let cache = BinaryCache::new(dir.path(), "https://example.com", fetcher.clone());
        std::fs::write(cache.path(Arch::Amd64), b"").unwrap();

        cache.fetch(Arch::Amd64).await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
