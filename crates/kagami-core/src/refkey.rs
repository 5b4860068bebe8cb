//! Reference keys: content-addressed fingerprints of an entity's local
//! dependencies.
//!
//! Equal keys mean the snapshot's metadata is still valid for the current
//! inventory. Inputs are sorted before hashing so the key is stable across
//! process restarts and input ordering.

use crate::models::{ChapterContainer, LocalFile};

/// Fingerprint of the local files belonging to an anime.
///
/// Hashes the sorted `(path, episode_number)` tuples of every file matched
/// to `media_id`.
pub fn anime_reference_key(media_id: i32, local_files: &[LocalFile]) -> String {
    let mut deps: Vec<(&str, Option<u32>)> = local_files
        .iter()
        .filter(|f| f.media_id == media_id)
        .map(|f| (f.path.as_str(), f.episode_number))
        .collect();
    deps.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    hasher.update(&media_id.to_le_bytes());
    for (path, episode) in deps {
        update_str(&mut hasher, path);
        match episode {
            Some(ep) => hasher.update(&ep.to_le_bytes()),
            None => hasher.update(&[0xff; 4]),
        };
    }
    hasher.finalize().to_hex().to_string()
}

/// Fingerprint of the chapter containers belonging to a manga.
///
/// Hashes the containers matched to `media_id`, sorted by provider, each as
/// `(provider, chapter_ids)` with the chapter id order preserved.
pub fn manga_reference_key(media_id: i32, containers: &[ChapterContainer]) -> String {
    let mut deps: Vec<&ChapterContainer> = containers
        .iter()
        .filter(|c| c.media_id == media_id)
        .collect();
    deps.sort_unstable_by(|a, b| a.provider.cmp(&b.provider));

    let mut hasher = blake3::Hasher::new();
    hasher.update(&media_id.to_le_bytes());
    for container in deps {
        update_str(&mut hasher, &container.provider);
        for chapter_id in &container.chapter_ids {
            update_str(&mut hasher, chapter_id);
        }
    }
    hasher.finalize().to_hex().to_string()
}

// Length-prefixed so adjacent fields cannot alias.
fn update_str(hasher: &mut blake3::Hasher, s: &str) {
    hasher.update(&(s.len() as u64).to_le_bytes());
    hasher.update(s.as_bytes());
}
