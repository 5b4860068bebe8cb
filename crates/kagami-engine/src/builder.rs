//! Local collection builder.
//!
//! Regenerates both local collections from scratch after every queue drain.
//! The local collection mirrors the remote one: same list skeletons (minus
//! custom lists), but only tracked entries that have a snapshot, with image
//! URLs rewritten to the asset store. The remote collections are never
//! mutated; every entry is rebuilt from copies.

use std::collections::HashMap;

use tracing::{debug, trace};

use kagami_core::assets::AssetStore;
use kagami_core::models::{CollectionList, CoverImage, ListEntry, MediaCollection, TrackedMedia};
use kagami_core::storage::Storage;

use crate::error::EngineError;
use crate::syncer::SyncState;

/// Snapshot-recorded asset filenames for one media.
struct AssetPaths {
    banner: Option<String>,
    cover: Option<String>,
}

/// Rebuild and persist both local collections. Runs under the engine mutex.
///
/// Idempotent: the same inputs produce byte-identical collections.
pub(crate) fn rebuild_local_collections(
    state: &mut SyncState,
    storage: &Storage,
    assets: &AssetStore,
) -> Result<(), EngineError> {
    trace!("sync: rebuilding local collections");

    let remote_anime = state
        .anime_collection
        .as_ref()
        .ok_or(EngineError::MissingCollection("anime"))?;
    let remote_manga = state
        .manga_collection
        .as_ref()
        .ok_or(EngineError::MissingCollection("manga"))?;

    let anime_paths: HashMap<i32, AssetPaths> = storage
        .all_anime_snapshots()?
        .into_iter()
        .map(|(id, s)| {
            (
                id,
                AssetPaths {
                    banner: s.banner_image_path,
                    cover: s.cover_image_path,
                },
            )
        })
        .collect();
    let manga_paths: HashMap<i32, AssetPaths> = storage
        .all_manga_snapshots()?
        .into_iter()
        .map(|(id, s)| {
            (
                id,
                AssetPaths {
                    banner: s.banner_image_path,
                    cover: s.cover_image_path,
                },
            )
        })
        .collect();

    let local_anime = mirror_collection(remote_anime, &state.tracked_anime, &anime_paths, assets);
    let local_manga = mirror_collection(remote_manga, &state.tracked_manga, &manga_paths, assets);

    storage.save_local_collections(&local_anime, &local_manga)?;
    state.local_anime_collection = Some(local_anime);
    state.local_manga_collection = Some(local_manga);

    debug!("sync: rebuilt local collections");
    Ok(())
}

/// Mirror one remote collection into its tracked-only local counterpart.
fn mirror_collection(
    remote: &MediaCollection,
    tracked: &HashMap<i32, TrackedMedia>,
    paths: &HashMap<i32, AssetPaths>,
    assets: &AssetStore,
) -> MediaCollection {
    // List skeletons first, preserving remote ordering. Custom lists
    // (status = null) never appear locally.
    let mut local = MediaCollection {
        lists: remote
            .lists
            .iter()
            .filter(|l| !l.is_custom())
            .map(|l| CollectionList {
                status: l.status,
                name: l.name.clone(),
                is_custom_list: l.is_custom_list,
                entries: Vec::new(),
            })
            .collect(),
    };

    for remote_list in remote.lists.iter().filter(|l| !l.is_custom()) {
        for entry in &remote_list.entries {
            let media_id = entry.media_id();
            if !tracked.contains_key(&media_id) {
                continue;
            }
            let Some(asset_paths) = paths.get(&media_id) else {
                continue;
            };

            // First local list with a matching status wins.
            for list in local.lists.iter_mut() {
                if list.status != remote_list.status {
                    continue;
                }
                list.entries.push(localize_entry(entry, asset_paths, assets));
                break;
            }
        }
    }

    local
}

/// Copy an entry for local use, rewriting its image URLs to asset paths.
fn localize_entry(entry: &ListEntry, paths: &AssetPaths, assets: &AssetStore) -> ListEntry {
    let media_id = entry.media_id();

    let mut media = entry.media.clone();
    media.banner_image = paths.banner.as_deref().map(|p| assets.url(media_id, p));
    let cover_url = paths.cover.as_deref().map(|p| assets.url(media_id, p));
    // Every size variant points at the stored cover; the accent color is
    // not a URL and carries over untouched.
    media.cover_image = Some(CoverImage {
        extra_large: cover_url.clone(),
        large: cover_url.clone(),
        medium: cover_url,
        color: entry
            .media
            .cover_image
            .as_ref()
            .and_then(|c| c.color.clone()),
    });

    ListEntry {
        id: entry.id,
        score: entry.score,
        progress: entry.progress,
        status: entry.status,
        notes: entry.notes.clone(),
        repeat: entry.repeat,
        private: entry.private,
        started_at: entry.started_at,
        completed_at: entry.completed_at,
        media,
    }
}
