//! Batch image downloader.
//!
//! Downloads a batch of URLs into a target directory with bounded
//! concurrency. Filenames are derived from a hash of the URL, so the same
//! URL always lands on the same file and re-downloads are skipped. A
//! `registry.json` file beside the images records url -> filename so
//! lookups survive restarts.
//!
//! Per-URL failures never abort the batch; callers inspect the returned
//! outcome. Cancelling the engine token aborts outstanding downloads while
//! already-completed files stay on disk.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::EngineError;

const REGISTRY_FILE: &str = "registry.json";

/// Fetches the raw bytes of one image URL.
pub trait ImageFetcher: Send + Sync + 'static {
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Vec<u8>, EngineError>> + Send;
}

/// Default fetcher over reqwest.
#[derive(Debug, Clone, Default)]
pub struct HttpImageFetcher {
    http: Client,
}

impl HttpImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        let resp = self.http.get(url).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Result of one batch: successes keyed by URL, plus captured failures.
#[derive(Debug, Default)]
pub struct DownloadOutcome {
    /// url -> filename relative to the batch directory.
    pub files: HashMap<String, String>,
    pub failed: Vec<(String, EngineError)>,
}

impl DownloadOutcome {
    /// True only when every URL in the batch succeeded.
    pub fn ok(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct ImageDownloader<F> {
    fetcher: Arc<F>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl<F: ImageFetcher> ImageDownloader<F> {
    pub fn new(fetcher: F, concurrency: usize, cancel: CancellationToken) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            concurrency: concurrency.max(1),
            cancel,
        }
    }

    /// Download every URL into `dir`. Already-registered URLs whose file is
    /// still present are reused without refetching.
    pub async fn download_batch(
        &self,
        dir: &Path,
        urls: &[String],
    ) -> Result<DownloadOutcome, EngineError> {
        let mut outcome = DownloadOutcome::default();
        if urls.is_empty() {
            return Ok(outcome);
        }

        tokio::fs::create_dir_all(dir).await?;
        let mut registry = load_registry(dir).await;

        let mut to_fetch = Vec::new();
        let mut seen = HashSet::new();
        for url in urls {
            if !seen.insert(url.as_str()) {
                continue;
            }
            if let Some(name) = registry.get(url) {
                if dir.join(name).is_file() {
                    outcome.files.insert(url.clone(), name.clone());
                    continue;
                }
            }
            to_fetch.push(url.clone());
        }

        let results: Vec<(String, Result<String, EngineError>)> = stream::iter(to_fetch)
            .map(|url| {
                let fetcher = Arc::clone(&self.fetcher);
                let cancel = self.cancel.clone();
                let dir = dir.to_path_buf();
                async move {
                    let result = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(EngineError::Cancelled),
                        res = download_one(fetcher, dir, url.clone()) => res,
                    };
                    (url, result)
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (url, result) in results {
            match result {
                Ok(name) => {
                    registry.insert(url.clone(), name.clone());
                    outcome.files.insert(url, name);
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "image: download failed");
                    outcome.failed.push((url, e));
                }
            }
        }

        if let Err(e) = save_registry(dir, &registry).await {
            warn!(error = %e, "image: failed to persist download registry");
        }

        Ok(outcome)
    }

    /// Filename recorded for a URL by a prior successful download.
    pub async fn lookup_by_url(&self, dir: &Path, url: &str) -> Option<String> {
        let registry = load_registry(dir).await;
        let name = registry.get(url)?;
        dir.join(name).is_file().then(|| name.clone())
    }
}

async fn download_one<F: ImageFetcher>(
    fetcher: Arc<F>,
    dir: PathBuf,
    url: String,
) -> Result<String, EngineError> {
    let bytes = fetcher.fetch(&url).await?;
    let name = filename_for(&url);

    // Write to a temp name and rename so a crashed download never leaves a
    // half-written file under the final name.
    let tmp = dir.join(format!("{name}.part"));
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, dir.join(&name)).await?;
    Ok(name)
}

/// Stable hash-derived filename for a URL, keeping its extension.
fn filename_for(url: &str) -> String {
    let hash = blake3::hash(url.as_bytes()).to_hex();
    let short = &hash.as_str()[..16];
    match extension_of(url) {
        Some(ext) => format!("{short}.{ext}"),
        None => short.to_string(),
    }
}

fn extension_of(url: &str) -> Option<&str> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .then_some(ext)
}

async fn load_registry(dir: &Path) -> BTreeMap<String, String> {
    match tokio::fs::read(dir.join(REGISTRY_FILE)).await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
        Err(_) => BTreeMap::new(),
    }
}

async fn save_registry(dir: &Path, registry: &BTreeMap<String, String>) -> Result<(), EngineError> {
    let bytes = serde_json::to_vec_pretty(registry).map_err(kagami_core::KagamiError::from)?;
    tokio::fs::write(dir.join(REGISTRY_FILE), bytes).await?;
    Ok(())
}
