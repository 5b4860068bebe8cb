//! Public entry point of the synchronization engine.
//!
//! One `SyncEngine` per server process. `synchronize` is non-blocking: it
//! prunes stale snapshots, diffs the remote collections against local
//! state, and enqueues per-entity jobs for the workers. Per-entity failures
//! are recorded in the failed caches and never abort a cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, Sender};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use kagami_core::assets::AssetStore;
use kagami_core::diff::{self, AnimeDiffRequest, DiffKind, MangaDiffRequest};
use kagami_core::models::{
    AnimeSnapshot, ChapterContainer, ListEntry, LocalFile, MangaSnapshot, MediaCollection,
    MediaKind, TrackedMedia,
};
use kagami_core::storage::Storage;

use crate::builder;
use crate::config::EngineConfig;
use crate::download::{HttpImageFetcher, ImageDownloader, ImageFetcher};
use crate::error::EngineError;
use crate::metadata::MetadataProvider;
use crate::syncer::{self, AnimeJob, MangaJob, Shared, SyncState, QUEUE_CAPACITY};

/// Inputs to one synchronization cycle, gathered by the host server.
#[derive(Debug, Clone, Default)]
pub struct SynchronizeRequest {
    pub anime_collection: Option<MediaCollection>,
    pub manga_collection: Option<MediaCollection>,
    pub local_files: Vec<LocalFile>,
    pub chapter_containers: Vec<ChapterContainer>,
}

pub struct SyncEngine<P: MetadataProvider, F: ImageFetcher = HttpImageFetcher> {
    shared: Arc<Shared<P, F>>,
    config: EngineConfig,
    senders: Mutex<Option<(Sender<AnimeJob>, Sender<MangaJob>)>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: MetadataProvider> SyncEngine<P, HttpImageFetcher> {
    /// Open the engine with the default HTTP image fetcher.
    ///
    /// Must be called from within a tokio runtime; spawns the two queue
    /// workers. Refuses to start if the store cannot be opened.
    pub fn new(config: EngineConfig, provider: P) -> Result<Self, EngineError> {
        Self::with_fetcher(config, provider, HttpImageFetcher::new())
    }
}

impl<P: MetadataProvider, F: ImageFetcher> SyncEngine<P, F> {
    /// Open the engine with a custom image fetcher.
    pub fn with_fetcher(
        config: EngineConfig,
        provider: P,
        fetcher: F,
    ) -> Result<Self, EngineError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let storage = Arc::new(Storage::open(&config.db_path)?);
        let assets = AssetStore::new(&config.assets_dir);
        let cancel = CancellationToken::new();
        let downloader = ImageDownloader::new(fetcher, config.image_concurrency, cancel.clone());

        // Serve previously built collections before the first cycle runs.
        let state = SyncState {
            local_anime_collection: storage.local_anime_collection()?,
            local_manga_collection: storage.local_manga_collection()?,
            ..SyncState::default()
        };

        let shared = Arc::new(Shared {
            storage,
            assets,
            provider,
            downloader,
            state: Mutex::new(state),
            failed_anime: Mutex::new(HashMap::new()),
            failed_manga: Mutex::new(HashMap::new()),
            pending_anime: AtomicUsize::new(0),
            pending_manga: AtomicUsize::new(0),
            rebuild_pending: AtomicBool::new(false),
            drained: Notify::new(),
            cancel,
        });

        let (anime_tx, anime_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (manga_tx, manga_rx) = mpsc::channel(QUEUE_CAPACITY);
        let workers = vec![
            tokio::spawn(syncer::run_anime_worker(Arc::clone(&shared), anime_rx)),
            tokio::spawn(syncer::run_manga_worker(Arc::clone(&shared), manga_rx)),
        ];

        Ok(Self {
            shared,
            config,
            senders: Mutex::new(Some((anime_tx, manga_tx))),
            workers: Mutex::new(workers),
        })
    }

    // ── Tracking ────────────────────────────────────────────────

    /// Add a media to the tracked set. Idempotent.
    pub fn track(&self, media_id: i32, kind: MediaKind) -> Result<(), EngineError> {
        info!(media_id, kind = kind.as_db_str(), "sync: tracking media");
        self.shared.storage.add_tracked(media_id, kind)?;
        Ok(())
    }

    /// Remove a media from the tracked set and schedule removal of its
    /// snapshot and assets. Idempotent; fails only on store I/O.
    pub fn untrack(&self, media_id: i32, kind: MediaKind) -> Result<(), EngineError> {
        info!(media_id, kind = kind.as_db_str(), "sync: untracking media");
        self.shared.storage.remove_tracked(media_id, kind)?;

        // Snapshot and asset removal happens off the caller's path.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            if let Err(e) = shared.purge_records(media_id, kind) {
                warn!(media_id, error = %e, "sync: failed to remove untracked media records");
            }
        });
        Ok(())
    }

    pub fn is_tracked(&self, media_id: i32, kind: MediaKind) -> Result<bool, EngineError> {
        Ok(self.shared.storage.is_tracked(media_id, kind)?)
    }

    // ── Synchronization ─────────────────────────────────────────

    /// Start a synchronization cycle. Non-blocking: jobs are processed by
    /// the workers after this returns.
    ///
    /// Only precondition failures (absent collections) are returned; every
    /// error past that point is logged and the cycle continues or is
    /// skipped, per-entity failures landing in the failed caches.
    pub async fn synchronize(&self, request: SynchronizeRequest) -> Result<(), EngineError> {
        let anime_collection = request
            .anime_collection
            .ok_or(EngineError::MissingCollection("anime"))?;
        let manga_collection = request
            .manga_collection
            .ok_or(EngineError::MissingCollection("manga"))?;

        trace!("sync: starting synchronization cycle");
        let shared = &self.shared;
        let mut state = shared.state.lock().await;

        state.local_files = request.local_files;
        state.chapter_containers = request.chapter_containers;

        state.tracked_anime = match shared.storage.tracked_ids(MediaKind::Anime) {
            Ok(ids) => ids
                .into_iter()
                .map(|id| (id, TrackedMedia { media_id: id, kind: MediaKind::Anime }))
                .collect(),
            Err(e) => {
                error!(error = %e, "sync: failed to read tracked anime");
                return Ok(());
            }
        };
        state.tracked_manga = match shared.storage.tracked_ids(MediaKind::Manga) {
            Ok(ids) => ids
                .into_iter()
                .map(|id| (id, TrackedMedia { media_id: id, kind: MediaKind::Manga }))
                .collect(),
            Err(e) => {
                error!(error = %e, "sync: failed to read tracked manga");
                return Ok(());
            }
        };

        // Prune snapshots whose media is no longer tracked.
        let mut anime_snapshots = match shared.storage.all_anime_snapshots() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "sync: failed to read anime snapshots");
                return Ok(());
            }
        };
        let mut manga_snapshots = match shared.storage.all_manga_snapshots() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                error!(error = %e, "sync: failed to read manga snapshots");
                return Ok(());
            }
        };

        let mut pruned_any = false;
        let untracked_anime: Vec<i32> = anime_snapshots
            .keys()
            .filter(|id| !state.tracked_anime.contains_key(id))
            .copied()
            .collect();
        for media_id in untracked_anime {
            debug!(media_id, "sync: pruning untracked anime snapshot");
            anime_snapshots.remove(&media_id);
            pruned_any = true;
            if let Err(e) = shared.purge_records(media_id, MediaKind::Anime) {
                warn!(media_id, error = %e, "sync: failed to prune anime snapshot");
            }
        }
        let untracked_manga: Vec<i32> = manga_snapshots
            .keys()
            .filter(|id| !state.tracked_manga.contains_key(id))
            .copied()
            .collect();
        for media_id in untracked_manga {
            debug!(media_id, "sync: pruning untracked manga snapshot");
            manga_snapshots.remove(&media_id);
            pruned_any = true;
            if let Err(e) = shared.purge_records(media_id, MediaKind::Manga) {
                warn!(media_id, error = %e, "sync: failed to prune manga snapshot");
            }
        }

        // A previous cycle is still in flight; it will finish and the next
        // call picks up from there.
        if shared.pending_anime.load(Ordering::SeqCst) > 0
            || shared.pending_manga.load(Ordering::SeqCst) > 0
        {
            debug!("sync: job queues are not empty, skipping diff run");
            state.anime_collection = Some(anime_collection);
            state.manga_collection = Some(manga_collection);
            return Ok(());
        }

        // Diff both kinds in parallel on short-lived threads.
        let tracked_anime = &state.tracked_anime;
        let tracked_manga = &state.tracked_manga;
        let local_files = &state.local_files;
        let chapter_containers = &state.chapter_containers;
        let (anime_joined, manga_joined) = std::thread::scope(|scope| {
            let anime_handle = scope.spawn(|| {
                diff::anime_diffs(AnimeDiffRequest {
                    collection: &anime_collection,
                    tracked: tracked_anime,
                    snapshots: &anime_snapshots,
                    local_files,
                })
            });
            let manga_handle = scope.spawn(|| {
                diff::manga_diffs(MangaDiffRequest {
                    collection: &manga_collection,
                    tracked: tracked_manga,
                    snapshots: &manga_snapshots,
                    chapter_containers,
                })
            });
            (anime_handle.join(), manga_handle.join())
        });
        let (Ok(anime_outcome), Ok(manga_outcome)) = (anime_joined, manga_joined) else {
            error!("sync: diff computation panicked, skipping cycle");
            state.anime_collection = Some(anime_collection);
            state.manga_collection = Some(manga_collection);
            return Ok(());
        };

        state.anime_collection = Some(anime_collection);
        state.manga_collection = Some(manga_collection);

        // Tracked snapshots that vanished from the remote collection are
        // pruned like untracked ones.
        for media_id in &anime_outcome.prune {
            debug!(media_id, "sync: pruning anime snapshot absent from remote collection");
            pruned_any = true;
            if let Err(e) = shared.purge_records(*media_id, MediaKind::Anime) {
                warn!(media_id, error = %e, "sync: failed to prune anime snapshot");
            }
        }
        for media_id in &manga_outcome.prune {
            debug!(media_id, "sync: pruning manga snapshot absent from remote collection");
            pruned_any = true;
            if let Err(e) = shared.purge_records(*media_id, MediaKind::Manga) {
                warn!(media_id, error = %e, "sync: failed to prune manga snapshot");
            }
        }

        let anime_jobs: Vec<AnimeJob> = anime_outcome
            .diffs
            .into_values()
            .filter(|d| d.kind != DiffKind::UpToDate)
            .map(|diff| AnimeJob { diff })
            .collect();
        let manga_jobs: Vec<MangaJob> = manga_outcome
            .diffs
            .into_values()
            .filter(|d| d.kind != DiffKind::UpToDate)
            .map(|diff| MangaJob { diff })
            .collect();

        if anime_jobs.is_empty() && manga_jobs.is_empty() {
            // No jobs means no drain, so a prune-only cycle rebuilds here
            // or removed entries would linger in the local collections.
            if pruned_any {
                if let Err(e) = builder::rebuild_local_collections(
                    &mut state,
                    &shared.storage,
                    &shared.assets,
                ) {
                    error!(error = %e, "sync: failed to rebuild local collections after prune");
                }
            } else {
                trace!("sync: nothing to synchronize");
            }
            return Ok(());
        }

        debug!(
            anime_jobs = anime_jobs.len(),
            manga_jobs = manga_jobs.len(),
            "sync: enqueueing jobs"
        );

        // Counters are bumped before the mutex drops so a fast worker can
        // never observe a half-enqueued cycle as drained.
        shared.pending_anime.fetch_add(anime_jobs.len(), Ordering::SeqCst);
        shared.pending_manga.fetch_add(manga_jobs.len(), Ordering::SeqCst);
        drop(state);

        let senders = self.senders.lock().await.clone();
        let Some((anime_tx, manga_tx)) = senders else {
            shared.pending_anime.fetch_sub(anime_jobs.len(), Ordering::SeqCst);
            shared.pending_manga.fetch_sub(manga_jobs.len(), Ordering::SeqCst);
            return Ok(());
        };

        // Enqueue off this call so a full queue cannot block the caller.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            for job in anime_jobs {
                if anime_tx.send(job).await.is_err() {
                    shared.pending_anime.fetch_sub(1, Ordering::SeqCst);
                }
            }
            for job in manga_jobs {
                if manga_tx.send(job).await.is_err() {
                    shared.pending_manga.fetch_sub(1, Ordering::SeqCst);
                }
            }
        });

        Ok(())
    }

    /// Block until both queues are empty and the post-drain rebuild of the
    /// local collections has completed.
    pub async fn wait_for_drain(&self) {
        loop {
            let notified = self.shared.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.pending_anime.load(Ordering::SeqCst) == 0
                && self.shared.pending_manga.load(Ordering::SeqCst) == 0
                && !self.shared.rebuild_pending.load(Ordering::SeqCst)
            {
                return;
            }
            notified.await;
        }
    }

    /// Stop intake, drain both queues up to the configured deadline, cancel
    /// outstanding downloads, and join the workers.
    pub async fn shutdown(&self) {
        info!("sync: shutting down");
        self.senders.lock().await.take();

        if tokio::time::timeout(self.config.shutdown_timeout(), self.wait_for_drain())
            .await
            .is_err()
        {
            warn!("sync: shutdown deadline reached before queues drained");
        }
        self.shared.cancel.cancel();

        let workers = {
            let mut guard = self.workers.lock().await;
            std::mem::take(&mut *guard)
        };
        for worker in workers {
            if let Err(e) = worker.await {
                if e.is_panic() {
                    error!("sync: worker panicked during shutdown");
                }
            }
        }
    }

    // ── Read accessors ──────────────────────────────────────────

    /// The most recently built local anime collection, if any.
    pub async fn local_anime_collection(&self) -> Option<MediaCollection> {
        self.shared.state.lock().await.local_anime_collection.clone()
    }

    /// The most recently built local manga collection, if any.
    pub async fn local_manga_collection(&self) -> Option<MediaCollection> {
        self.shared.state.lock().await.local_manga_collection.clone()
    }

    pub fn anime_snapshot(&self, media_id: i32) -> Result<Option<AnimeSnapshot>, EngineError> {
        Ok(self.shared.storage.get_anime_snapshot(media_id)?)
    }

    pub fn manga_snapshot(&self, media_id: i32) -> Result<Option<MangaSnapshot>, EngineError> {
        Ok(self.shared.storage.get_manga_snapshot(media_id)?)
    }

    /// Entries whose last sync attempt failed, keyed by media id. They are
    /// retried naturally on the next cycle.
    pub async fn failed_anime(&self) -> HashMap<i32, ListEntry> {
        self.shared.failed_anime.lock().await.clone()
    }

    pub async fn failed_manga(&self) -> HashMap<i32, ListEntry> {
        self.shared.failed_manga.lock().await.clone()
    }
}
