//! External metadata provider seam.
//!
//! The engine only needs one thing from the metadata side: per-episode
//! titles and image URLs for an anime. The provider is a trait so the host
//! can wire in its own client and tests can stub failures.

use std::future::Future;

use kagami_core::models::AnimeMetadata;
use reqwest::Client;

use crate::error::EngineError;

/// Source of anime metadata (episode titles, images, counts).
pub trait MetadataProvider: Send + Sync + 'static {
    fn anime_metadata(
        &self,
        media_id: i32,
    ) -> impl Future<Output = Result<AnimeMetadata, EngineError>> + Send;
}

/// Provider backed by an HTTP mapping endpoint returning the
/// [`AnimeMetadata`] wire shape keyed by tracker id.
pub struct HttpMetadataProvider {
    http: Client,
    base_url: String,
}

impl HttpMetadataProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl MetadataProvider for HttpMetadataProvider {
    async fn anime_metadata(&self, media_id: i32) -> Result<AnimeMetadata, EngineError> {
        let url = format!(
            "{}/mappings?anilist_id={media_id}",
            self.base_url.trim_end_matches('/')
        );
        let resp = self.http.get(&url).send().await?.error_for_status()?;
        let metadata = resp.json::<AnimeMetadata>().await?;
        Ok(metadata)
    }
}
