//! Pure diff computation between the remote collection and local state.
//!
//! Stateless and side-effect free; the anime and manga passes are safe to
//! run on parallel threads. Classification for each tracked media present
//! in the remote collection, in order:
//!
//! 1. not tracked -> omitted
//! 2. no snapshot -> [`DiffKind::Missing`]
//! 3. reference key matches the inventory -> [`DiffKind::UpToDate`]
//! 4. otherwise -> [`DiffKind::MetadataStale`], carrying the prior snapshot
//!
//! Each pass also reports which snapshots should be pruned: tracked media
//! whose snapshot exists but which no longer appear in the remote
//! collection.

use std::collections::HashMap;

use crate::models::{
    AnimeSnapshot, ChapterContainer, ListEntry, LocalFile, MangaSnapshot, MediaCollection,
    TrackedMedia,
};
use crate::refkey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    UpToDate,
    Missing,
    MetadataStale,
}

#[derive(Debug, Clone)]
pub struct AnimeDiff {
    pub kind: DiffKind,
    pub entry: ListEntry,
    /// Present for `MetadataStale` only.
    pub snapshot: Option<AnimeSnapshot>,
}

#[derive(Debug, Clone)]
pub struct MangaDiff {
    pub kind: DiffKind,
    pub entry: ListEntry,
    pub snapshot: Option<MangaSnapshot>,
}

/// Result of one diff pass: per-media diffs plus the prune directive.
#[derive(Debug)]
pub struct DiffOutcome<D> {
    pub diffs: HashMap<i32, D>,
    /// Media ids whose snapshot should be removed.
    pub prune: Vec<i32>,
}

impl<D> Default for DiffOutcome<D> {
    fn default() -> Self {
        Self {
            diffs: HashMap::new(),
            prune: Vec::new(),
        }
    }
}

pub struct AnimeDiffRequest<'a> {
    pub collection: &'a MediaCollection,
    pub tracked: &'a HashMap<i32, TrackedMedia>,
    pub snapshots: &'a HashMap<i32, AnimeSnapshot>,
    pub local_files: &'a [LocalFile],
}

pub struct MangaDiffRequest<'a> {
    pub collection: &'a MediaCollection,
    pub tracked: &'a HashMap<i32, TrackedMedia>,
    pub snapshots: &'a HashMap<i32, MangaSnapshot>,
    pub chapter_containers: &'a [ChapterContainer],
}

pub fn anime_diffs(req: AnimeDiffRequest<'_>) -> DiffOutcome<AnimeDiff> {
    let mut outcome = DiffOutcome::default();

    for entry in req.collection.entries() {
        let media_id = entry.media_id();
        if !req.tracked.contains_key(&media_id) {
            continue;
        }

        let diff = match req.snapshots.get(&media_id) {
            None => AnimeDiff {
                kind: DiffKind::Missing,
                entry: entry.clone(),
                snapshot: None,
            },
            Some(snapshot) => {
                let current = refkey::anime_reference_key(media_id, req.local_files);
                if current == snapshot.reference_key {
                    AnimeDiff {
                        kind: DiffKind::UpToDate,
                        entry: entry.clone(),
                        snapshot: None,
                    }
                } else {
                    AnimeDiff {
                        kind: DiffKind::MetadataStale,
                        entry: entry.clone(),
                        snapshot: Some(snapshot.clone()),
                    }
                }
            }
        };
        outcome.diffs.insert(media_id, diff);
    }

    for media_id in req.snapshots.keys() {
        if req.tracked.contains_key(media_id) && !req.collection.contains(*media_id) {
            outcome.prune.push(*media_id);
        }
    }
    outcome.prune.sort_unstable();

    outcome
}

pub fn manga_diffs(req: MangaDiffRequest<'_>) -> DiffOutcome<MangaDiff> {
    let mut outcome = DiffOutcome::default();

    for entry in req.collection.entries() {
        let media_id = entry.media_id();
        if !req.tracked.contains_key(&media_id) {
            continue;
        }

        let diff = match req.snapshots.get(&media_id) {
            None => MangaDiff {
                kind: DiffKind::Missing,
                entry: entry.clone(),
                snapshot: None,
            },
            Some(snapshot) => {
                let current = refkey::manga_reference_key(media_id, req.chapter_containers);
                if current == snapshot.reference_key {
                    MangaDiff {
                        kind: DiffKind::UpToDate,
                        entry: entry.clone(),
                        snapshot: None,
                    }
                } else {
                    MangaDiff {
                        kind: DiffKind::MetadataStale,
                        entry: entry.clone(),
                        snapshot: Some(snapshot.clone()),
                    }
                }
            }
        };
        outcome.diffs.insert(media_id, diff);
    }

    for media_id in req.snapshots.keys() {
        if req.tracked.contains_key(media_id) && !req.collection.contains(*media_id) {
            outcome.prune.push(*media_id);
        }
    }
    outcome.prune.sort_unstable();

    outcome
}
