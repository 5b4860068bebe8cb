//! End-to-end engine scenarios with stubbed metadata and image fetching.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use kagami_core::models::{
    AnimeMetadata, ChapterContainer, CollectionList, CoverImage, EpisodeMetadata, ListEntry,
    LocalFile, LocalFileKind, Media, MediaCollection, MediaKind, MediaListStatus, MediaTitle,
};
use kagami_core::refkey;
use kagami_engine::{
    EngineConfig, EngineError, ImageFetcher, MetadataProvider, SyncEngine, SynchronizeRequest,
};

// ── Stubs ───────────────────────────────────────────────────────

#[derive(Default)]
struct ProviderState {
    fail_ids: Mutex<HashSet<i32>>,
    panic_ids: Mutex<HashSet<i32>>,
    episode_counts: Mutex<HashMap<i32, u32>>,
    delays_ms: Mutex<HashMap<i32, u64>>,
}

#[derive(Clone, Default)]
struct StubProvider(Arc<ProviderState>);

impl StubProvider {
    fn set_episodes(&self, media_id: i32, count: u32) {
        self.0.episode_counts.lock().unwrap().insert(media_id, count);
    }

    fn fail_for(&self, media_id: i32) {
        self.0.fail_ids.lock().unwrap().insert(media_id);
    }

    fn recover(&self, media_id: i32) {
        self.0.fail_ids.lock().unwrap().remove(&media_id);
        self.0.panic_ids.lock().unwrap().remove(&media_id);
    }

    fn panic_for(&self, media_id: i32) {
        self.0.panic_ids.lock().unwrap().insert(media_id);
    }

    fn delay_for(&self, media_id: i32, ms: u64) {
        self.0.delays_ms.lock().unwrap().insert(media_id, ms);
    }
}

impl MetadataProvider for StubProvider {
    async fn anime_metadata(&self, media_id: i32) -> Result<AnimeMetadata, EngineError> {
        let delay = self.0.delays_ms.lock().unwrap().get(&media_id).copied();
        if let Some(ms) = delay {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if self.0.panic_ids.lock().unwrap().contains(&media_id) {
            panic!("stub metadata panic for {media_id}");
        }
        if self.0.fail_ids.lock().unwrap().contains(&media_id) {
            return Err(EngineError::Metadata(format!(
                "stub metadata failure for {media_id}"
            )));
        }

        let count = self
            .0
            .episode_counts
            .lock()
            .unwrap()
            .get(&media_id)
            .copied()
            .unwrap_or(2);
        let episodes = (1..=count)
            .map(|n| {
                (
                    n.to_string(),
                    EpisodeMetadata {
                        title: Some(format!("Episode {n}")),
                        image: Some(format!("https://img.example/{media_id}/ep-{n}.jpg")),
                        air_date: None,
                    },
                )
            })
            .collect();
        Ok(AnimeMetadata {
            episode_count: Some(count),
            episodes,
        })
    }
}

#[derive(Default)]
struct FetcherState {
    fail_urls: Mutex<HashSet<String>>,
}

#[derive(Clone, Default)]
struct StubFetcher(Arc<FetcherState>);

impl StubFetcher {
    fn fail_for(&self, url: &str) {
        self.0.fail_urls.lock().unwrap().insert(url.to_string());
    }

    fn recover(&self, url: &str) {
        self.0.fail_urls.lock().unwrap().remove(url);
    }
}

impl ImageFetcher for StubFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, EngineError> {
        if self.0.fail_urls.lock().unwrap().contains(url) {
            return Err(EngineError::Image(format!("stub fetch failure for {url}")));
        }
        Ok(url.as_bytes().to_vec())
    }
}

// ── Fixture ─────────────────────────────────────────────────────

struct TestEngine {
    engine: SyncEngine<StubProvider, StubFetcher>,
    provider: StubProvider,
    fetcher: StubFetcher,
    data_dir: TempDir,
}

fn spawn_engine() -> TestEngine {
    let data_dir = TempDir::new().unwrap();
    let config = EngineConfig::for_data_dir(data_dir.path());
    let provider = StubProvider::default();
    let fetcher = StubFetcher::default();
    let engine = SyncEngine::with_fetcher(config, provider.clone(), fetcher.clone()).unwrap();
    TestEngine {
        engine,
        provider,
        fetcher,
        data_dir,
    }
}

fn media(media_id: i32) -> Media {
    Media {
        id: media_id,
        title: MediaTitle {
            romaji: Some(format!("Media {media_id}")),
            ..MediaTitle::default()
        },
        cover_image: Some(CoverImage {
            extra_large: Some(format!("https://img.example/{media_id}/cover-xl.jpg")),
            large: Some(format!("https://img.example/{media_id}/cover-l.jpg")),
            medium: None,
            color: Some("#334455".into()),
        }),
        banner_image: Some(format!("https://img.example/{media_id}/banner.jpg")),
        episodes: Some(12),
        ..Media::default()
    }
}

fn entry(media_id: i32) -> ListEntry {
    ListEntry {
        id: media_id as i64 * 10,
        score: Some(80.0),
        progress: Some(2),
        status: Some(MediaListStatus::Current),
        notes: None,
        repeat: Some(0),
        private: Some(false),
        started_at: None,
        completed_at: None,
        media: media(media_id),
    }
}

fn current_list(media_ids: &[i32]) -> CollectionList {
    CollectionList {
        status: Some(MediaListStatus::Current),
        name: Some("Watching".into()),
        is_custom_list: Some(false),
        entries: media_ids.iter().map(|id| entry(*id)).collect(),
    }
}

fn collection(media_ids: &[i32]) -> MediaCollection {
    MediaCollection {
        lists: vec![current_list(media_ids)],
    }
}

fn files(media_id: i32, episodes: &[u32]) -> Vec<LocalFile> {
    episodes
        .iter()
        .map(|ep| LocalFile {
            path: format!("/library/{media_id}/ep-{ep}.mkv"),
            media_id,
            episode_number: Some(*ep),
            kind: LocalFileKind::Main,
        })
        .collect()
}

fn containers(media_id: i32, provider: &str, chapters: &[&str]) -> ChapterContainer {
    ChapterContainer {
        media_id,
        provider: provider.into(),
        chapter_ids: chapters.iter().map(|c| c.to_string()).collect(),
    }
}

fn request(
    anime: MediaCollection,
    manga: MediaCollection,
    local_files: Vec<LocalFile>,
    chapter_containers: Vec<ChapterContainer>,
) -> SynchronizeRequest {
    SynchronizeRequest {
        anime_collection: Some(anime),
        manga_collection: Some(manga),
        local_files,
        chapter_containers,
    }
}

// ── Scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_remote_collection_is_a_precondition_error() {
    let t = spawn_engine();
    let result = t
        .engine
        .synchronize(SynchronizeRequest {
            anime_collection: None,
            manga_collection: Some(MediaCollection::default()),
            ..SynchronizeRequest::default()
        })
        .await;
    assert!(matches!(result, Err(EngineError::MissingCollection("anime"))));
}

#[tokio::test]
async fn fresh_install_creates_snapshot_and_local_collection() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.provider.set_episodes(101, 12);

    let local_files = files(101, &[1, 2]);
    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            local_files.clone(),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let snapshot = t.engine.anime_snapshot(101).unwrap().unwrap();
    assert_eq!(snapshot.episode_image_paths.len(), 12);
    assert!(snapshot.episode_image_paths.contains_key("1"));
    assert!(snapshot.episode_image_paths.contains_key("12"));
    assert_eq!(
        snapshot.reference_key,
        refkey::anime_reference_key(101, &local_files)
    );
    assert!(snapshot.cover_image_path.is_some());
    assert!(snapshot.banner_image_path.is_some());

    let local = t.engine.local_anime_collection().await.unwrap();
    assert_eq!(local.lists.len(), 1);
    assert_eq!(local.lists[0].status, Some(MediaListStatus::Current));
    assert_eq!(local.lists[0].entries.len(), 1);

    let local_entry = &local.lists[0].entries[0];
    let cover = local_entry.media.cover_image.as_ref().unwrap();
    assert!(cover.large.as_deref().unwrap().starts_with("/assets/101/"));
    assert!(local_entry
        .media
        .banner_image
        .as_deref()
        .unwrap()
        .starts_with("/assets/101/"));

    // Images actually landed in the asset directory.
    let media_dir = t.data_dir.path().join("assets").join("101");
    assert!(media_dir.is_dir());
    assert!(t.engine.failed_anime().await.is_empty());
}

#[tokio::test]
async fn custom_lists_never_appear_locally() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();

    let remote = MediaCollection {
        lists: vec![
            CollectionList {
                status: None,
                name: Some("Favorites".into()),
                is_custom_list: Some(true),
                entries: vec![entry(101)],
            },
            current_list(&[101]),
        ],
    };
    t.engine
        .synchronize(request(
            remote,
            MediaCollection::default(),
            files(101, &[1]),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let local = t.engine.local_anime_collection().await.unwrap();
    assert_eq!(local.lists.len(), 1);
    assert_eq!(local.lists[0].name.as_deref(), Some("Watching"));
    assert_eq!(local.lists[0].entries.len(), 1);
}

#[tokio::test]
async fn untrack_removes_snapshot_assets_and_entries() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();

    let req = request(
        collection(&[101]),
        MediaCollection::default(),
        files(101, &[1, 2]),
        vec![],
    );
    t.engine.synchronize(req.clone()).await.unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.anime_snapshot(101).unwrap().is_some());

    t.engine.untrack(101, MediaKind::Anime).unwrap();
    t.engine.synchronize(req).await.unwrap();
    t.engine.wait_for_drain().await;

    assert!(t.engine.anime_snapshot(101).unwrap().is_none());
    assert!(!t.data_dir.path().join("assets").join("101").exists());
    let local = t.engine.local_anime_collection().await.unwrap();
    assert!(local.lists.iter().all(|l| l.entries.is_empty()));
}

#[tokio::test]
async fn disappearing_local_files_remove_the_anime() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();

    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            files(101, &[1]),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.anime_snapshot(101).unwrap().is_some());

    // Same remote state, but every local file is gone.
    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            vec![],
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    assert!(t.engine.anime_snapshot(101).unwrap().is_none());
    assert!(!t.engine.is_tracked(101, MediaKind::Anime).unwrap());
    let local = t.engine.local_anime_collection().await.unwrap();
    assert!(local.lists.iter().all(|l| l.entries.is_empty()));
}

#[tokio::test]
async fn failed_image_fetch_routes_to_failed_cache_and_recovers() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.fetcher.fail_for("https://img.example/101/banner.jpg");

    let req = request(
        collection(&[101]),
        MediaCollection::default(),
        files(101, &[1]),
        vec![],
    );
    t.engine.synchronize(req.clone()).await.unwrap();
    t.engine.wait_for_drain().await;

    assert!(t.engine.anime_snapshot(101).unwrap().is_none());
    assert!(t.engine.failed_anime().await.contains_key(&101));

    // Network recovers; the next cycle re-classifies the anime as missing
    // and the retry succeeds.
    t.fetcher.recover("https://img.example/101/banner.jpg");
    t.engine.synchronize(req).await.unwrap();
    t.engine.wait_for_drain().await;

    assert!(t.engine.anime_snapshot(101).unwrap().is_some());
    assert!(t.engine.failed_anime().await.is_empty());
}

#[tokio::test]
async fn failed_metadata_fetch_routes_to_failed_cache() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.provider.fail_for(101);

    let req = request(
        collection(&[101]),
        MediaCollection::default(),
        files(101, &[1]),
        vec![],
    );
    t.engine.synchronize(req.clone()).await.unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.failed_anime().await.contains_key(&101));

    t.provider.recover(101);
    t.engine.synchronize(req).await.unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.failed_anime().await.is_empty());
    assert!(t.engine.anime_snapshot(101).unwrap().is_some());
}

#[tokio::test]
async fn panic_in_one_job_does_not_kill_the_worker() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.engine.track(102, MediaKind::Anime).unwrap();
    t.provider.panic_for(101);

    let local_files: Vec<LocalFile> = files(101, &[1])
        .into_iter()
        .chain(files(102, &[1]))
        .collect();
    let req = request(
        collection(&[101, 102]),
        MediaCollection::default(),
        local_files,
        vec![],
    );
    t.engine.synchronize(req.clone()).await.unwrap();
    t.engine.wait_for_drain().await;

    // The panicking entity is lost for the cycle, the other one lands.
    assert!(t.engine.anime_snapshot(101).unwrap().is_none());
    assert!(t.engine.anime_snapshot(102).unwrap().is_some());

    // The worker is still alive and picks up the entity next cycle.
    t.provider.recover(101);
    t.engine.synchronize(req).await.unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.anime_snapshot(101).unwrap().is_some());
}

#[tokio::test]
async fn no_op_cycle_leaves_local_collection_byte_identical() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();

    let req = request(
        collection(&[101]),
        MediaCollection::default(),
        files(101, &[1, 2]),
        vec![],
    );
    t.engine.synchronize(req.clone()).await.unwrap();
    t.engine.wait_for_drain().await;

    let first = serde_json::to_vec(&t.engine.local_anime_collection().await.unwrap()).unwrap();

    t.engine.synchronize(req).await.unwrap();
    t.engine.wait_for_drain().await;

    let second = serde_json::to_vec(&t.engine.local_anime_collection().await.unwrap()).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn anime_and_manga_jobs_interleave_into_one_consistent_rebuild() {
    let t = spawn_engine();
    for id in [101, 102, 103] {
        t.engine.track(id, MediaKind::Anime).unwrap();
        // Anime metadata is slow so an anime job finishes last.
        t.provider.delay_for(id, 25);
    }
    for id in [201, 202, 203] {
        t.engine.track(id, MediaKind::Manga).unwrap();
    }

    let local_files: Vec<LocalFile> = [101, 102, 103]
        .into_iter()
        .flat_map(|id| files(id, &[1]))
        .collect();
    let chapter_containers: Vec<ChapterContainer> = [201, 202, 203]
        .into_iter()
        .map(|id| containers(id, "provider-a", &["c1", "c2"]))
        .collect();

    t.engine
        .synchronize(request(
            collection(&[101, 102, 103]),
            collection(&[201, 202, 203]),
            local_files,
            chapter_containers,
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let anime = t.engine.local_anime_collection().await.unwrap();
    let manga = t.engine.local_manga_collection().await.unwrap();
    assert_eq!(anime.lists[0].entries.len(), 3);
    assert_eq!(manga.lists[0].entries.len(), 3);
    for id in [101, 102, 103] {
        assert!(t.engine.anime_snapshot(id).unwrap().is_some());
    }
    for id in [201, 202, 203] {
        assert!(t.engine.manga_snapshot(id).unwrap().is_some());
    }
}

#[tokio::test]
async fn back_to_back_synchronize_matches_single_cycle_with_later_inputs() {
    // Two calls without an intervening drain. The first cycle's jobs are
    // still pending when the second call arrives, so the second only
    // refreshes the stored collections and inventories; the in-flight jobs
    // then complete against the later inputs.
    let twice = spawn_engine();
    twice.engine.track(101, MediaKind::Anime).unwrap();
    twice.engine.track(7, MediaKind::Manga).unwrap();

    let earlier = request(
        collection(&[101]),
        collection(&[7]),
        files(101, &[1]),
        vec![containers(7, "provider-a", &["c1"])],
    );
    let later_files = files(101, &[1, 2]);
    let later_containers = vec![containers(7, "provider-a", &["c1", "c2"])];
    let later = request(
        collection(&[101]),
        collection(&[7]),
        later_files.clone(),
        later_containers.clone(),
    );

    twice.engine.synchronize(earlier).await.unwrap();
    twice.engine.synchronize(later.clone()).await.unwrap();
    twice.engine.wait_for_drain().await;

    // Reference run: a fresh engine, one call with the later inputs.
    let once = spawn_engine();
    once.engine.track(101, MediaKind::Anime).unwrap();
    once.engine.track(7, MediaKind::Manga).unwrap();
    once.engine.synchronize(later).await.unwrap();
    once.engine.wait_for_drain().await;

    let twice_anime = twice.engine.anime_snapshot(101).unwrap().unwrap();
    let once_anime = once.engine.anime_snapshot(101).unwrap().unwrap();
    assert_eq!(twice_anime.reference_key, once_anime.reference_key);
    assert_eq!(
        twice_anime.reference_key,
        refkey::anime_reference_key(101, &later_files)
    );
    assert_eq!(
        twice_anime.episode_image_paths,
        once_anime.episode_image_paths
    );

    let twice_manga = twice.engine.manga_snapshot(7).unwrap().unwrap();
    let once_manga = once.engine.manga_snapshot(7).unwrap().unwrap();
    assert_eq!(twice_manga.chapter_containers, later_containers);
    assert_eq!(twice_manga.reference_key, once_manga.reference_key);

    let twice_local = serde_json::to_vec(&twice.engine.local_anime_collection().await.unwrap()).unwrap();
    let once_local = serde_json::to_vec(&once.engine.local_anime_collection().await.unwrap()).unwrap();
    assert_eq!(twice_local, once_local);

    let twice_local = serde_json::to_vec(&twice.engine.local_manga_collection().await.unwrap()).unwrap();
    let once_local = serde_json::to_vec(&once.engine.local_manga_collection().await.unwrap()).unwrap();
    assert_eq!(twice_local, once_local);

    assert!(twice.engine.failed_anime().await.is_empty());
    assert!(twice.engine.failed_manga().await.is_empty());
}

#[tokio::test]
async fn manga_snapshot_follows_chapter_containers() {
    let t = spawn_engine();
    t.engine.track(7, MediaKind::Manga).unwrap();

    let initial = vec![containers(7, "provider-a", &["c1", "c2"])];
    t.engine
        .synchronize(request(
            MediaCollection::default(),
            collection(&[7]),
            vec![],
            initial.clone(),
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let snapshot = t.engine.manga_snapshot(7).unwrap().unwrap();
    assert_eq!(snapshot.chapter_containers, initial);
    assert_eq!(
        snapshot.reference_key,
        refkey::manga_reference_key(7, &initial)
    );
    let first_cover = snapshot.cover_image_path.clone();

    // A second provider appears: stale metadata, images kept.
    let grown = vec![
        containers(7, "provider-a", &["c1", "c2"]),
        containers(7, "provider-b", &["x1"]),
    ];
    t.engine
        .synchronize(request(
            MediaCollection::default(),
            collection(&[7]),
            vec![],
            grown.clone(),
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let snapshot = t.engine.manga_snapshot(7).unwrap().unwrap();
    assert_eq!(snapshot.chapter_containers, grown);
    assert_eq!(snapshot.cover_image_path, first_cover);

    // All containers gone: the manga is removed entirely.
    t.engine
        .synchronize(request(
            MediaCollection::default(),
            collection(&[7]),
            vec![],
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;
    assert!(t.engine.manga_snapshot(7).unwrap().is_none());
    assert!(!t.engine.is_tracked(7, MediaKind::Manga).unwrap());
}

#[tokio::test]
async fn empty_chapter_lists_route_to_failed_cache() {
    let t = spawn_engine();
    t.engine.track(7, MediaKind::Manga).unwrap();

    t.engine
        .synchronize(request(
            MediaCollection::default(),
            collection(&[7]),
            vec![],
            vec![containers(7, "provider-a", &[])],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    assert!(t.engine.manga_snapshot(7).unwrap().is_none());
    assert!(t.engine.failed_manga().await.contains_key(&7));
}

#[tokio::test]
async fn stale_anime_downloads_only_missing_episode_images() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.provider.set_episodes(101, 2);

    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            files(101, &[1]),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let before = t.engine.anime_snapshot(101).unwrap().unwrap();
    assert_eq!(before.episode_image_paths.len(), 2);

    // New episode airs and a new file appears: metadata is stale.
    t.provider.set_episodes(101, 3);
    let local_files = files(101, &[1, 2]);
    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            local_files.clone(),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.wait_for_drain().await;

    let after = t.engine.anime_snapshot(101).unwrap().unwrap();
    assert_eq!(after.episode_image_paths.len(), 3);
    // Previously downloaded images are left in place.
    assert_eq!(
        after.episode_image_paths.get("1"),
        before.episode_image_paths.get("1")
    );
    assert_eq!(
        after.reference_key,
        refkey::anime_reference_key(101, &local_files)
    );
}

#[tokio::test]
async fn local_collections_survive_a_restart() {
    let data_dir = TempDir::new().unwrap();
    let config = EngineConfig::for_data_dir(data_dir.path());

    {
        let provider = StubProvider::default();
        let fetcher = StubFetcher::default();
        let engine =
            SyncEngine::with_fetcher(config.clone(), provider.clone(), fetcher.clone()).unwrap();
        engine.track(101, MediaKind::Anime).unwrap();
        engine
            .synchronize(request(
                collection(&[101]),
                MediaCollection::default(),
                files(101, &[1]),
                vec![],
            ))
            .await
            .unwrap();
        engine.wait_for_drain().await;
        engine.shutdown().await;
    }

    let engine =
        SyncEngine::with_fetcher(config, StubProvider::default(), StubFetcher::default()).unwrap();
    let local = engine.local_anime_collection().await.unwrap();
    assert_eq!(local.lists[0].entries.len(), 1);
    assert_eq!(local.lists[0].entries[0].media.id, 101);
}

#[tokio::test]
async fn shutdown_drains_and_stops_workers() {
    let t = spawn_engine();
    t.engine.track(101, MediaKind::Anime).unwrap();
    t.provider.delay_for(101, 20);

    t.engine
        .synchronize(request(
            collection(&[101]),
            MediaCollection::default(),
            files(101, &[1]),
            vec![],
        ))
        .await
        .unwrap();
    t.engine.shutdown().await;

    // The in-flight job completed before the workers stopped.
    assert!(t.engine.anime_snapshot(101).unwrap().is_some());
}
