//! Per-entity snapshot records persisted by the sync engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ChapterContainer;

/// Episode-level metadata from the external metadata provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeMetadata {
    pub title: Option<String>,
    pub image: Option<String>,
    pub air_date: Option<String>,
}

/// Metadata for an anime, keyed by episode key ("1", "2", "S1", ...).
///
/// `BTreeMap` keeps serialization deterministic so re-persisting an
/// unchanged snapshot is byte-identical.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeMetadata {
    pub episode_count: Option<u32>,
    #[serde(default)]
    pub episodes: BTreeMap<String, EpisodeMetadata>,
}

impl AnimeMetadata {
    /// Episode keys mapped to their image URL, skipping imageless episodes.
    pub fn episode_image_urls(&self) -> BTreeMap<String, String> {
        self.episodes
            .iter()
            .filter_map(|(key, ep)| {
                let image = ep.image.as_deref()?;
                if image.is_empty() {
                    return None;
                }
                Some((key.clone(), image.to_string()))
            })
            .collect()
    }
}

/// Local record for a tracked, present-on-disk anime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnimeSnapshot {
    pub media_id: i32,
    pub metadata: AnimeMetadata,
    pub banner_image_path: Option<String>,
    pub cover_image_path: Option<String>,
    /// Episode key -> filename inside the media's asset directory.
    pub episode_image_paths: BTreeMap<String, String>,
    pub reference_key: String,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Local record for a tracked manga with downloaded chapters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MangaSnapshot {
    pub media_id: i32,
    pub chapter_containers: Vec<ChapterContainer>,
    pub banner_image_path: Option<String>,
    pub cover_image_path: Option<String>,
    pub reference_key: String,
    pub synced_at: Option<DateTime<Utc>>,
}
