//! Local synchronization engine.
//!
//! Maintains a durable, offline-capable mirror of the subset of the user's
//! remote anime/manga collection the user has chosen to track. One
//! [`SyncEngine`] per server: `synchronize` diffs the remote collections
//! against local state and enqueues per-entity jobs; two workers drain the
//! queues; every drain triggers a single rebuild of the tracked-only local
//! collections.

mod builder;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod metadata;
mod syncer;

pub use config::EngineConfig;
pub use download::{DownloadOutcome, HttpImageFetcher, ImageDownloader, ImageFetcher};
pub use engine::{SyncEngine, SynchronizeRequest};
pub use error::EngineError;
pub use metadata::{HttpMetadataProvider, MetadataProvider};
