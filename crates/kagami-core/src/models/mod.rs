mod collection;
mod library;
mod snapshot;

pub use collection::{
    CollectionList, CoverImage, FuzzyDate, ListEntry, Media, MediaCollection, MediaListStatus,
    MediaTitle,
};
pub use library::{ChapterContainer, LocalFile, LocalFileKind, MediaKind, TrackedMedia};
pub use snapshot::{AnimeMetadata, AnimeSnapshot, EpisodeMetadata, MangaSnapshot};
