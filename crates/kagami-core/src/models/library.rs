//! Local dependency inventory: the scanned video files and downloaded
//! chapter containers the broader server hands to the engine, plus the
//! tracked-media records the engine owns.

use serde::{Deserialize, Serialize};

/// Which kind of media a tracked record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Anime,
    Manga,
}

impl MediaKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MediaKind::Anime => "anime",
            MediaKind::Manga => "manga",
        }
    }
}

/// A media the user has elected to keep available locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedMedia {
    pub media_id: i32,
    pub kind: MediaKind,
}

/// Classification of a scanned video file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalFileKind {
    Main,
    Special,
    Nc,
}

/// A scanned video file already matched to a media by the library scanner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalFile {
    pub path: String,
    pub media_id: i32,
    pub episode_number: Option<u32>,
    pub kind: LocalFileKind,
}

/// Downloaded chapters for one manga from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterContainer {
    pub media_id: i32,
    pub provider: String,
    pub chapter_ids: Vec<String>,
}
