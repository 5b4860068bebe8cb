use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration, provided by the host server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the engine's SQLite database.
    pub db_path: PathBuf,
    /// Root directory for downloaded assets, served under `/assets`.
    pub assets_dir: PathBuf,
    /// Concurrent downloads per image batch.
    pub image_concurrency: usize,
    /// How long `shutdown` waits for the queues to drain.
    pub shutdown_timeout_secs: u64,
}

impl EngineConfig {
    /// Conventional layout inside a data directory.
    pub fn for_data_dir(data_dir: &Path) -> Self {
        Self {
            db_path: data_dir.join("kagami.db"),
            assets_dir: data_dir.join("assets"),
            image_concurrency: 4,
            shutdown_timeout_secs: 30,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
