//! SQLite-backed store for tracked sets, snapshots, and local collections.
//!
//! Snapshot and collection payloads are self-describing JSON blobs; the
//! schema only indexes by media id. The connection is mutex-wrapped so the
//! engine's workers and manager can share one store.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::KagamiError;
use crate::models::{AnimeSnapshot, MangaSnapshot, MediaCollection, MediaKind};

const SCHEMA_V1: &str = include_str!("../../../migrations/001_initial.sql");

/// Persistent store for the sync engine.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, KagamiError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, KagamiError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Tracked sets ────────────────────────────────────────────

    /// Add a media to the tracked set. Idempotent.
    pub fn add_tracked(&self, media_id: i32, kind: MediaKind) -> Result<(), KagamiError> {
        let sql = match kind {
            MediaKind::Anime => "INSERT OR IGNORE INTO tracked_anime (media_id) VALUES (?1)",
            MediaKind::Manga => "INSERT OR IGNORE INTO tracked_manga (media_id) VALUES (?1)",
        };
        self.lock().execute(sql, params![media_id])?;
        Ok(())
    }

    /// Remove a media from the tracked set. Idempotent.
    pub fn remove_tracked(&self, media_id: i32, kind: MediaKind) -> Result<(), KagamiError> {
        let sql = match kind {
            MediaKind::Anime => "DELETE FROM tracked_anime WHERE media_id = ?1",
            MediaKind::Manga => "DELETE FROM tracked_manga WHERE media_id = ?1",
        };
        self.lock().execute(sql, params![media_id])?;
        Ok(())
    }

    /// All tracked media ids of one kind, ascending.
    pub fn tracked_ids(&self, kind: MediaKind) -> Result<Vec<i32>, KagamiError> {
        let sql = match kind {
            MediaKind::Anime => "SELECT media_id FROM tracked_anime ORDER BY media_id",
            MediaKind::Manga => "SELECT media_id FROM tracked_manga ORDER BY media_id",
        };
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i32>, _>>()?;
        Ok(ids)
    }

    pub fn is_tracked(&self, media_id: i32, kind: MediaKind) -> Result<bool, KagamiError> {
        let sql = match kind {
            MediaKind::Anime => "SELECT COUNT(*) FROM tracked_anime WHERE media_id = ?1",
            MediaKind::Manga => "SELECT COUNT(*) FROM tracked_manga WHERE media_id = ?1",
        };
        let count: i32 = self.lock().query_row(sql, params![media_id], |row| row.get(0))?;
        Ok(count > 0)
    }

    // ── Anime snapshots ─────────────────────────────────────────

    /// Insert or replace the snapshot for its media id.
    pub fn save_anime_snapshot(&self, snapshot: &AnimeSnapshot) -> Result<(), KagamiError> {
        let payload = serde_json::to_vec(snapshot)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO anime_snapshot (media_id, payload) VALUES (?1, ?2)",
            params![snapshot.media_id, payload],
        )?;
        Ok(())
    }

    pub fn get_anime_snapshot(&self, media_id: i32) -> Result<Option<AnimeSnapshot>, KagamiError> {
        let payload: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT payload FROM anime_snapshot WHERE media_id = ?1",
                params![media_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All anime snapshots, keyed by media id. Undecodable rows are skipped.
    pub fn all_anime_snapshots(&self) -> Result<HashMap<i32, AnimeSnapshot>, KagamiError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT payload FROM anime_snapshot")?;
        let snapshots = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|bytes| {
                serde_json::from_slice::<AnimeSnapshot>(&bytes)
                    .map_err(|e| tracing::warn!(error = %e, "storage: skipping undecodable anime snapshot"))
                    .ok()
            })
            .map(|s| (s.media_id, s))
            .collect();
        Ok(snapshots)
    }

    pub fn delete_anime_snapshot(&self, media_id: i32) -> Result<(), KagamiError> {
        self.lock().execute(
            "DELETE FROM anime_snapshot WHERE media_id = ?1",
            params![media_id],
        )?;
        Ok(())
    }

    // ── Manga snapshots ─────────────────────────────────────────

    pub fn save_manga_snapshot(&self, snapshot: &MangaSnapshot) -> Result<(), KagamiError> {
        let payload = serde_json::to_vec(snapshot)?;
        self.lock().execute(
            "INSERT OR REPLACE INTO manga_snapshot (media_id, payload) VALUES (?1, ?2)",
            params![snapshot.media_id, payload],
        )?;
        Ok(())
    }

    pub fn get_manga_snapshot(&self, media_id: i32) -> Result<Option<MangaSnapshot>, KagamiError> {
        let payload: Option<Vec<u8>> = self
            .lock()
            .query_row(
                "SELECT payload FROM manga_snapshot WHERE media_id = ?1",
                params![media_id],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn all_manga_snapshots(&self) -> Result<HashMap<i32, MangaSnapshot>, KagamiError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT payload FROM manga_snapshot")?;
        let snapshots = stmt
            .query_map([], |row| row.get::<_, Vec<u8>>(0))?
            .filter_map(|r| r.ok())
            .filter_map(|bytes| {
                serde_json::from_slice::<MangaSnapshot>(&bytes)
                    .map_err(|e| tracing::warn!(error = %e, "storage: skipping undecodable manga snapshot"))
                    .ok()
            })
            .map(|s| (s.media_id, s))
            .collect();
        Ok(snapshots)
    }

    pub fn delete_manga_snapshot(&self, media_id: i32) -> Result<(), KagamiError> {
        self.lock().execute(
            "DELETE FROM manga_snapshot WHERE media_id = ?1",
            params![media_id],
        )?;
        Ok(())
    }

    // ── Local collections ───────────────────────────────────────

    /// Replace both local collections in one transaction.
    pub fn save_local_collections(
        &self,
        anime: &MediaCollection,
        manga: &MediaCollection,
    ) -> Result<(), KagamiError> {
        let anime_payload = serde_json::to_vec(anime)?;
        let manga_payload = serde_json::to_vec(manga)?;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO local_anime_collection (id, payload) VALUES (1, ?1)",
            params![anime_payload],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO local_manga_collection (id, payload) VALUES (1, ?1)",
            params![manga_payload],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn local_anime_collection(&self) -> Result<Option<MediaCollection>, KagamiError> {
        self.local_collection("local_anime_collection")
    }

    pub fn local_manga_collection(&self) -> Result<Option<MediaCollection>, KagamiError> {
        self.local_collection("local_manga_collection")
    }

    fn local_collection(&self, table: &str) -> Result<Option<MediaCollection>, KagamiError> {
        let payload: Option<Vec<u8>> = self
            .lock()
            .query_row(
                &format!("SELECT payload FROM {table} WHERE id = 1"),
                [],
                |row| row.get(0),
            )
            .optional()?;
        match payload {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ── Migrations ──────────────────────────────────────────────────

/// Run schema migrations using `PRAGMA user_version` for version tracking.
fn run_migrations(conn: &Connection) -> Result<(), KagamiError> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChapterContainer, CollectionList, MediaListStatus};
    use std::collections::BTreeMap;

    fn anime_snapshot(media_id: i32) -> AnimeSnapshot {
        AnimeSnapshot {
            media_id,
            banner_image_path: Some("banner.jpg".into()),
            cover_image_path: Some("cover.jpg".into()),
            episode_image_paths: BTreeMap::from([("1".to_string(), "ep-1.jpg".to_string())]),
            reference_key: "abc123".into(),
            ..AnimeSnapshot::default()
        }
    }

    #[test]
    fn tracked_set_is_idempotent() {
        let db = Storage::open_memory().unwrap();

        db.add_tracked(101, MediaKind::Anime).unwrap();
        db.add_tracked(101, MediaKind::Anime).unwrap();
        assert_eq!(db.tracked_ids(MediaKind::Anime).unwrap(), vec![101]);
        assert!(db.tracked_ids(MediaKind::Manga).unwrap().is_empty());

        db.remove_tracked(101, MediaKind::Anime).unwrap();
        db.remove_tracked(101, MediaKind::Anime).unwrap();
        assert!(!db.is_tracked(101, MediaKind::Anime).unwrap());
    }

    #[test]
    fn anime_snapshot_roundtrip() {
        let db = Storage::open_memory().unwrap();
        let snapshot = anime_snapshot(101);

        db.save_anime_snapshot(&snapshot).unwrap();
        let fetched = db.get_anime_snapshot(101).unwrap().unwrap();
        assert_eq!(fetched, snapshot);

        // Overwrite keeps a single row.
        let mut updated = snapshot.clone();
        updated.reference_key = "def456".into();
        db.save_anime_snapshot(&updated).unwrap();
        assert_eq!(db.all_anime_snapshots().unwrap().len(), 1);
        assert_eq!(
            db.get_anime_snapshot(101).unwrap().unwrap().reference_key,
            "def456"
        );

        db.delete_anime_snapshot(101).unwrap();
        assert!(db.get_anime_snapshot(101).unwrap().is_none());
    }

    #[test]
    fn manga_snapshot_roundtrip() {
        let db = Storage::open_memory().unwrap();
        let snapshot = MangaSnapshot {
            media_id: 7,
            chapter_containers: vec![ChapterContainer {
                media_id: 7,
                provider: "alpha".into(),
                chapter_ids: vec!["c1".into(), "c2".into()],
            }],
            reference_key: "k".into(),
            ..MangaSnapshot::default()
        };

        db.save_manga_snapshot(&snapshot).unwrap();
        assert_eq!(db.get_manga_snapshot(7).unwrap().unwrap(), snapshot);

        db.delete_manga_snapshot(7).unwrap();
        assert!(db.all_manga_snapshots().unwrap().is_empty());
    }

    #[test]
    fn local_collections_replace_atomically() {
        let db = Storage::open_memory().unwrap();
        assert!(db.local_anime_collection().unwrap().is_none());

        let anime = MediaCollection {
            lists: vec![CollectionList {
                status: Some(MediaListStatus::Current),
                name: Some("Watching".into()),
                is_custom_list: Some(false),
                entries: vec![],
            }],
        };
        let manga = MediaCollection::default();

        db.save_local_collections(&anime, &manga).unwrap();
        assert_eq!(db.local_anime_collection().unwrap().unwrap(), anime);
        assert_eq!(db.local_manga_collection().unwrap().unwrap(), manga);

        // Second save replaces the singleton rows.
        let empty = MediaCollection::default();
        db.save_local_collections(&empty, &empty).unwrap();
        assert_eq!(db.local_anime_collection().unwrap().unwrap(), empty);
    }
}
