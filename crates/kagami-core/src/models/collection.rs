//! Remote collection tree, in the tracker's list-of-lists shape.
//!
//! A collection holds one list per watch/read status, plus user-defined
//! custom lists (status = null). Entries embed their media object directly.
//! These types are `Clone`-deep by construction; the engine clones before
//! editing anything it did not build itself.

use serde::{Deserialize, Serialize};

/// List status on the remote tracker. A list without one is a custom list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaListStatus {
    Current,
    Planning,
    Completed,
    Dropped,
    Paused,
    Repeating,
}

/// A possibly partial calendar date, as reported by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzyDate {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub day: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaTitle {
    pub romaji: Option<String>,
    pub english: Option<String>,
    pub native: Option<String>,
}

impl MediaTitle {
    /// Returns the best available display title.
    pub fn preferred(&self) -> &str {
        self.romaji
            .as_deref()
            .or(self.english.as_deref())
            .or(self.native.as_deref())
            .unwrap_or("Unknown")
    }
}

/// Cover image size variants plus the tracker's accent color.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverImage {
    pub extra_large: Option<String>,
    pub large: Option<String>,
    pub medium: Option<String>,
    pub color: Option<String>,
}

/// The media object embedded in a list entry.
///
/// Deliberately flat: no relations graph is carried, so cloning an entry
/// can never pull in sibling or parent media.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Media {
    pub id: i32,
    pub title: MediaTitle,
    pub cover_image: Option<CoverImage>,
    pub banner_image: Option<String>,
    pub episodes: Option<u32>,
    pub chapters: Option<u32>,
    pub format: Option<String>,
    pub status: Option<String>,
    #[serde(default)]
    pub synonyms: Vec<String>,
}

impl Media {
    /// Best available cover URL, largest variant first.
    pub fn cover_url(&self) -> Option<&str> {
        let cover = self.cover_image.as_ref()?;
        cover
            .extra_large
            .as_deref()
            .or(cover.large.as_deref())
            .or(cover.medium.as_deref())
    }
}

/// One entry in a remote or local list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub id: i64,
    pub score: Option<f64>,
    pub progress: Option<u32>,
    pub status: Option<MediaListStatus>,
    pub notes: Option<String>,
    pub repeat: Option<u32>,
    pub private: Option<bool>,
    pub started_at: Option<FuzzyDate>,
    pub completed_at: Option<FuzzyDate>,
    pub media: Media,
}

impl ListEntry {
    pub fn media_id(&self) -> i32 {
        self.media.id
    }
}

/// One status list inside a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionList {
    pub status: Option<MediaListStatus>,
    pub name: Option<String>,
    pub is_custom_list: Option<bool>,
    #[serde(default)]
    pub entries: Vec<ListEntry>,
}

impl CollectionList {
    /// Custom lists have no status and are excluded from local mirroring.
    pub fn is_custom(&self) -> bool {
        self.status.is_none()
    }
}

/// An anime or manga collection: an ordered list of status lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaCollection {
    pub lists: Vec<CollectionList>,
}

impl MediaCollection {
    /// Iterate entries of non-custom lists, in list order.
    pub fn entries(&self) -> impl Iterator<Item = &ListEntry> {
        self.lists
            .iter()
            .filter(|l| !l.is_custom())
            .flat_map(|l| l.entries.iter())
    }

    /// Find a media's entry in the first non-custom list holding it.
    pub fn entry_for(&self, media_id: i32) -> Option<&ListEntry> {
        self.entries().find(|e| e.media_id() == media_id)
    }

    /// Whether any non-custom list holds an entry for the media.
    pub fn contains(&self, media_id: i32) -> bool {
        self.entry_for(media_id).is_some()
    }
}
