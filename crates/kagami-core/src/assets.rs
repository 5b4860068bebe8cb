//! Filesystem store for downloaded media assets.
//!
//! Layout: `<root>/<mediaId>/<logicalName>`, with logical names like
//! `cover.jpg`, `banner.jpg`, or `episode-3.jpg`. The host process serves
//! the root under `/assets`.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::KagamiError;

#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding all assets for one media.
    pub fn media_dir(&self, media_id: i32) -> PathBuf {
        self.root.join(media_id.to_string())
    }

    /// Write an asset, creating the media directory as needed.
    /// Returns the logical name for storing in a snapshot.
    pub fn write(
        &self,
        media_id: i32,
        logical_name: &str,
        bytes: &[u8],
    ) -> Result<String, KagamiError> {
        let dir = self.media_dir(media_id);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(logical_name), bytes)?;
        Ok(logical_name.to_string())
    }

    /// Remove every asset for the media. Missing directories are fine.
    pub fn delete_media(&self, media_id: i32) -> Result<(), KagamiError> {
        match std::fs::remove_dir_all(self.media_dir(media_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// URL under which the host process serves the asset.
    pub fn url(&self, media_id: i32, logical_name: &str) -> String {
        format!("/assets/{media_id}/{logical_name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_and_delete_media_assets() {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::new(dir.path());

        let name = store.write(101, "cover.jpg", b"image bytes").unwrap();
        assert_eq!(name, "cover.jpg");
        assert!(store.media_dir(101).join("cover.jpg").is_file());

        store.write(101, "banner.jpg", b"more bytes").unwrap();
        store.delete_media(101).unwrap();
        assert!(!store.media_dir(101).exists());

        // Deleting again is a no-op.
        store.delete_media(101).unwrap();
    }

    #[test]
    fn url_layout() {
        let store = AssetStore::new("/tmp/assets");
        assert_eq!(store.url(101, "episode-3.jpg"), "/assets/101/episode-3.jpg");
    }
}
