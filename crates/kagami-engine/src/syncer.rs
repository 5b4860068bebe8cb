//! Job queues and per-entity synchronization.
//!
//! Two bounded queues (anime, manga) with one long-lived worker each. Every
//! job processed marks a rebuild as pending; whenever both queues drain the
//! worker that processed the last job runs one local-collection rebuild
//! under the engine mutex. Each job executes in its own task so a panic on
//! one entity never kills a worker.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use kagami_core::assets::AssetStore;
use kagami_core::diff::{AnimeDiff, DiffKind, MangaDiff};
use kagami_core::models::{
    AnimeSnapshot, ChapterContainer, ListEntry, LocalFile, MangaSnapshot, MediaCollection,
    MediaKind, TrackedMedia,
};
use kagami_core::refkey;
use kagami_core::storage::Storage;

use crate::builder;
use crate::download::{ImageDownloader, ImageFetcher};
use crate::error::EngineError;
use crate::metadata::MetadataProvider;

pub(crate) const QUEUE_CAPACITY: usize = 100;

pub(crate) struct AnimeJob {
    pub diff: AnimeDiff,
}

pub(crate) struct MangaJob {
    pub diff: MangaDiff,
}

/// Mutable engine state, guarded by the engine mutex.
#[derive(Default)]
pub(crate) struct SyncState {
    pub anime_collection: Option<MediaCollection>,
    pub manga_collection: Option<MediaCollection>,
    pub local_anime_collection: Option<MediaCollection>,
    pub local_manga_collection: Option<MediaCollection>,
    pub local_files: Vec<LocalFile>,
    pub chapter_containers: Vec<ChapterContainer>,
    pub tracked_anime: HashMap<i32, TrackedMedia>,
    pub tracked_manga: HashMap<i32, TrackedMedia>,
}

/// Everything the manager, workers, and builder share.
pub(crate) struct Shared<P, F> {
    pub storage: Arc<Storage>,
    pub assets: AssetStore,
    pub provider: P,
    pub downloader: ImageDownloader<F>,
    /// The engine mutex. Held for tracked-set reads and pruning during a
    /// cycle, and for the drain check + rebuild. Never held across network
    /// I/O or image writes.
    pub state: Mutex<SyncState>,
    pub failed_anime: Mutex<HashMap<i32, ListEntry>>,
    pub failed_manga: Mutex<HashMap<i32, ListEntry>>,
    pub pending_anime: AtomicUsize,
    pub pending_manga: AtomicUsize,
    pub rebuild_pending: AtomicBool,
    pub drained: Notify,
    pub cancel: CancellationToken,
}

pub(crate) async fn run_anime_worker<P: MetadataProvider, F: ImageFetcher>(
    shared: Arc<Shared<P, F>>,
    mut rx: Receiver<AnimeJob>,
) {
    while let Some(job) = rx.recv().await {
        shared.rebuild_pending.store(true, Ordering::SeqCst);
        let media_id = job.diff.entry.media_id();

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.synchronize_anime(job.diff).await }
        });
        if let Err(err) = task.await {
            if err.is_panic() {
                error!(media_id, "sync: anime job panicked, continuing with next job");
            }
        }

        shared.pending_anime.fetch_sub(1, Ordering::SeqCst);
        shared.check_and_rebuild().await;
    }
    trace!("sync: anime worker stopped");
}

pub(crate) async fn run_manga_worker<P: MetadataProvider, F: ImageFetcher>(
    shared: Arc<Shared<P, F>>,
    mut rx: Receiver<MangaJob>,
) {
    while let Some(job) = rx.recv().await {
        shared.rebuild_pending.store(true, Ordering::SeqCst);
        let media_id = job.diff.entry.media_id();

        let task = tokio::spawn({
            let shared = Arc::clone(&shared);
            async move { shared.synchronize_manga(job.diff).await }
        });
        if let Err(err) = task.await {
            if err.is_panic() {
                error!(media_id, "sync: manga job panicked, continuing with next job");
            }
        }

        shared.pending_manga.fetch_sub(1, Ordering::SeqCst);
        shared.check_and_rebuild().await;
    }
    trace!("sync: manga worker stopped");
}

impl<P: MetadataProvider, F: ImageFetcher> Shared<P, F> {
    /// Run the local-collection rebuild if both queues are empty and a job
    /// was processed since the last rebuild. Exactly one rebuild runs per
    /// drain: the check and the rebuild happen under the engine mutex, and
    /// the pending flag is only cleared here.
    pub(crate) async fn check_and_rebuild(&self) {
        let mut state = self.state.lock().await;
        if self.pending_anime.load(Ordering::SeqCst) == 0
            && self.pending_manga.load(Ordering::SeqCst) == 0
            && self.rebuild_pending.load(Ordering::SeqCst)
        {
            if let Err(e) =
                builder::rebuild_local_collections(&mut state, &self.storage, &self.assets)
            {
                error!(error = %e, "sync: failed to rebuild local collections");
            }
            self.rebuild_pending.store(false, Ordering::SeqCst);
            self.drained.notify_waiters();
        }
    }

    /// Create or update the snapshot for one anime.
    ///
    /// A tracked anime without local files is removed entirely instead.
    pub(crate) async fn synchronize_anime(&self, diff: AnimeDiff) {
        let entry = diff.entry;
        let media_id = entry.media_id();
        trace!(media_id, kind = ?diff.kind, "sync: starting anime synchronization");

        let media_files: Vec<LocalFile> = {
            let state = self.state.lock().await;
            state
                .local_files
                .iter()
                .filter(|f| f.media_id == media_id)
                .cloned()
                .collect()
        };

        if media_files.is_empty() {
            warn!(media_id, "sync: no local files for anime, removing from local database");
            if let Err(e) = self.remove_anime(media_id) {
                error!(media_id, error = %e, "sync: failed to remove anime");
            }
            return;
        }

        if diff.kind == DiffKind::UpToDate {
            return;
        }

        let metadata = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = self.provider.anime_metadata(media_id) => match res {
                Ok(m) => m,
                Err(e) => {
                    error!(media_id, error = %e, "sync: failed to get anime metadata");
                    self.fail_anime(entry).await;
                    return;
                }
            },
        };

        match diff.kind {
            DiffKind::Missing => {
                let dir = self.assets.media_dir(media_id);
                let banner_url = entry.media.banner_image.clone();
                let cover_url = entry.media.cover_url().map(|s| s.to_string());
                let episode_urls = metadata.episode_image_urls();

                let mut batch: Vec<String> = Vec::new();
                batch.extend(banner_url.clone());
                batch.extend(cover_url.clone());
                batch.extend(episode_urls.values().cloned());

                let outcome = match self.downloader.download_batch(&dir, &batch).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(media_id, error = %e, "sync: anime image batch failed");
                        self.fail_anime(entry).await;
                        return;
                    }
                };
                if !outcome.ok() {
                    warn!(
                        media_id,
                        failed = outcome.failed.len(),
                        "sync: anime images failed to download"
                    );
                    self.fail_anime(entry).await;
                    return;
                }

                let episode_image_paths: BTreeMap<String, String> = episode_urls
                    .iter()
                    .filter_map(|(key, url)| {
                        outcome.files.get(url).map(|name| (key.clone(), name.clone()))
                    })
                    .collect();

                let snapshot = AnimeSnapshot {
                    media_id,
                    metadata,
                    banner_image_path: banner_url.and_then(|u| outcome.files.get(&u).cloned()),
                    cover_image_path: cover_url.and_then(|u| outcome.files.get(&u).cloned()),
                    episode_image_paths,
                    reference_key: refkey::anime_reference_key(media_id, &media_files),
                    synced_at: Some(Utc::now()),
                };

                if let Err(e) = self.storage.save_anime_snapshot(&snapshot) {
                    error!(media_id, error = %e, "sync: failed to save anime snapshot");
                    self.fail_anime(entry).await;
                    return;
                }
                self.clear_failed_anime(media_id).await;
                debug!(media_id, title = entry.media.title.preferred(), "sync: created anime snapshot");
            }
            DiffKind::MetadataStale => {
                let Some(mut snapshot) = diff.snapshot else {
                    return;
                };
                snapshot.reference_key = refkey::anime_reference_key(media_id, &media_files);
                snapshot.synced_at = Some(Utc::now());

                let current_urls = metadata.episode_image_urls();
                snapshot.metadata = metadata;

                // Only episodes the snapshot has no image for yet.
                let to_download: BTreeMap<String, String> = current_urls
                    .into_iter()
                    .filter(|(key, _)| !snapshot.episode_image_paths.contains_key(key))
                    .collect();

                if !to_download.is_empty() {
                    let dir = self.assets.media_dir(media_id);
                    let batch: Vec<String> = to_download.values().cloned().collect();
                    let outcome = match self.downloader.download_batch(&dir, &batch).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            error!(media_id, error = %e, "sync: anime image batch failed");
                            self.fail_anime(entry).await;
                            return;
                        }
                    };
                    if !outcome.ok() {
                        warn!(
                            media_id,
                            failed = outcome.failed.len(),
                            "sync: anime episode images failed to download"
                        );
                        self.fail_anime(entry).await;
                        return;
                    }
                    for (key, url) in &to_download {
                        if let Some(name) = outcome.files.get(url) {
                            snapshot.episode_image_paths.insert(key.clone(), name.clone());
                        }
                    }
                }

                if let Err(e) = self.storage.save_anime_snapshot(&snapshot) {
                    error!(media_id, error = %e, "sync: failed to save anime snapshot");
                    self.fail_anime(entry).await;
                    return;
                }
                self.clear_failed_anime(media_id).await;
                debug!(media_id, title = entry.media.title.preferred(), "sync: updated anime snapshot");
            }
            DiffKind::UpToDate => {}
        }
    }

    /// Create or update the snapshot for one manga.
    ///
    /// A tracked manga without chapter containers is removed entirely. A
    /// manga whose containers all have zero chapters is a failed remote
    /// search; it routes to the failed cache instead of persisting an empty
    /// mirror.
    pub(crate) async fn synchronize_manga(&self, diff: MangaDiff) {
        let entry = diff.entry;
        let media_id = entry.media_id();
        trace!(media_id, kind = ?diff.kind, "sync: starting manga synchronization");

        let containers: Vec<ChapterContainer> = {
            let state = self.state.lock().await;
            state
                .chapter_containers
                .iter()
                .filter(|c| c.media_id == media_id)
                .cloned()
                .collect()
        };

        if containers.is_empty() {
            warn!(media_id, "sync: no chapter containers for manga, removing from local database");
            if let Err(e) = self.remove_manga(media_id) {
                error!(media_id, error = %e, "sync: failed to remove manga");
            }
            return;
        }

        if diff.kind == DiffKind::UpToDate {
            return;
        }

        if containers.iter().all(|c| c.chapter_ids.is_empty()) {
            warn!(media_id, "sync: chapter containers hold no chapters, marking failed");
            self.fail_manga(entry).await;
            return;
        }

        match diff.kind {
            DiffKind::Missing => {
                let dir = self.assets.media_dir(media_id);
                let banner_url = entry.media.banner_image.clone();
                let cover_url = entry.media.cover_url().map(|s| s.to_string());

                let mut batch: Vec<String> = Vec::new();
                batch.extend(banner_url.clone());
                batch.extend(cover_url.clone());

                let outcome = match self.downloader.download_batch(&dir, &batch).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(media_id, error = %e, "sync: manga image batch failed");
                        self.fail_manga(entry).await;
                        return;
                    }
                };
                if !outcome.ok() {
                    warn!(
                        media_id,
                        failed = outcome.failed.len(),
                        "sync: manga images failed to download"
                    );
                    self.fail_manga(entry).await;
                    return;
                }

                let snapshot = MangaSnapshot {
                    media_id,
                    reference_key: refkey::manga_reference_key(media_id, &containers),
                    chapter_containers: containers,
                    banner_image_path: banner_url.and_then(|u| outcome.files.get(&u).cloned()),
                    cover_image_path: cover_url.and_then(|u| outcome.files.get(&u).cloned()),
                    synced_at: Some(Utc::now()),
                };

                if let Err(e) = self.storage.save_manga_snapshot(&snapshot) {
                    error!(media_id, error = %e, "sync: failed to save manga snapshot");
                    self.fail_manga(entry).await;
                    return;
                }
                self.clear_failed_manga(media_id).await;
                debug!(media_id, title = entry.media.title.preferred(), "sync: created manga snapshot");
            }
            DiffKind::MetadataStale => {
                let Some(mut snapshot) = diff.snapshot else {
                    return;
                };
                // Existing images stay; only the dependency view changes.
                snapshot.reference_key = refkey::manga_reference_key(media_id, &containers);
                snapshot.chapter_containers = containers;
                snapshot.synced_at = Some(Utc::now());

                if let Err(e) = self.storage.save_manga_snapshot(&snapshot) {
                    error!(media_id, error = %e, "sync: failed to save manga snapshot");
                    self.fail_manga(entry).await;
                    return;
                }
                self.clear_failed_manga(media_id).await;
                debug!(media_id, title = entry.media.title.preferred(), "sync: updated manga snapshot");
            }
            DiffKind::UpToDate => {}
        }
    }

    // ── Removal ─────────────────────────────────────────────────

    /// Delete the snapshot and assets for a media.
    pub(crate) fn purge_records(&self, media_id: i32, kind: MediaKind) -> Result<(), EngineError> {
        match kind {
            MediaKind::Anime => self.storage.delete_anime_snapshot(media_id)?,
            MediaKind::Manga => self.storage.delete_manga_snapshot(media_id)?,
        }
        self.assets.delete_media(media_id)?;
        Ok(())
    }

    /// Full removal when an anime's local dependencies disappeared:
    /// snapshot, assets, and the tracked record itself.
    pub(crate) fn remove_anime(&self, media_id: i32) -> Result<(), EngineError> {
        self.purge_records(media_id, MediaKind::Anime)?;
        self.storage.remove_tracked(media_id, MediaKind::Anime)?;
        Ok(())
    }

    pub(crate) fn remove_manga(&self, media_id: i32) -> Result<(), EngineError> {
        self.purge_records(media_id, MediaKind::Manga)?;
        self.storage.remove_tracked(media_id, MediaKind::Manga)?;
        Ok(())
    }

    // ── Failed-entry caches ─────────────────────────────────────

    pub(crate) async fn fail_anime(&self, entry: ListEntry) {
        self.failed_anime.lock().await.insert(entry.media_id(), entry);
    }

    pub(crate) async fn fail_manga(&self, entry: ListEntry) {
        self.failed_manga.lock().await.insert(entry.media_id(), entry);
    }

    async fn clear_failed_anime(&self, media_id: i32) {
        self.failed_anime.lock().await.remove(&media_id);
    }

    async fn clear_failed_manga(&self, media_id: i32) {
        self.failed_manga.lock().await.remove(&media_id);
    }
}
