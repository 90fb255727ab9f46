//! Resume positions and folder history
//!
//! `PositionStore` wraps the pool and exposes the persistence the
//! playback engine needs: per-track resume positions, the last played
//! track per folder, and the recent/pinned folder list.

use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::Result;

/// Unpinned entries kept in the recent folder list
pub const MAX_RECENT_FOLDERS: u32 = 10;

/// One entry of the recent folder list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentFolder {
    pub folder: PathBuf,
    pub pinned: bool,
}

/// SQLite-backed store for playback resume state
#[derive(Clone)]
pub struct PositionStore {
    db: SqlitePool,
}

impl PositionStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// The underlying pool, for settings access alongside positions
    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Save the resume position for a track (upsert)
    pub async fn save_position(&self, track: &Path, position_ms: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO track_positions (path, position_ms, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(path) DO UPDATE SET
                 position_ms = excluded.position_ms,
                 updated_at = excluded.updated_at",
        )
        .bind(path_str(track))
        .bind(position_ms as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Load the resume position for a track, if one was saved
    pub async fn load_position(&self, track: &Path) -> Result<Option<u64>> {
        let position: Option<i64> =
            sqlx::query_scalar("SELECT position_ms FROM track_positions WHERE path = ?")
                .bind(path_str(track))
                .fetch_optional(&self.db)
                .await?;
        Ok(position.map(|ms| ms.max(0) as u64))
    }

    /// Forget the resume position for a track (e.g. after it finished)
    pub async fn clear_position(&self, track: &Path) -> Result<()> {
        sqlx::query("DELETE FROM track_positions WHERE path = ?")
            .bind(path_str(track))
            .execute(&self.db)
            .await?;
        Ok(())
    }

    /// Remember which track was current in a folder
    pub async fn save_last_track(&self, folder: &Path, track: &Path) -> Result<()> {
        sqlx::query(
            "INSERT INTO folder_state (folder, track_path, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(folder) DO UPDATE SET
                 track_path = excluded.track_path,
                 updated_at = excluded.updated_at",
        )
        .bind(path_str(folder))
        .bind(path_str(track))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// The track that was current when this folder was last played
    pub async fn load_last_track(&self, folder: &Path) -> Result<Option<PathBuf>> {
        let track: Option<String> =
            sqlx::query_scalar("SELECT track_path FROM folder_state WHERE folder = ?")
                .bind(path_str(folder))
                .fetch_optional(&self.db)
                .await?
                .flatten();
        Ok(track.map(PathBuf::from))
    }

    /// Record a folder as most recently opened and prune the unpinned
    /// tail past the cap. Pinned state is preserved across touches.
    pub async fn touch_recent_folder(&self, folder: &Path) -> Result<()> {
        sqlx::query(
            "INSERT INTO recent_folders (folder, pinned, last_opened_at) VALUES (?, 0, ?)
             ON CONFLICT(folder) DO UPDATE SET last_opened_at = excluded.last_opened_at",
        )
        .bind(path_str(folder))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        sqlx::query(
            "DELETE FROM recent_folders WHERE pinned = 0 AND folder NOT IN (
                 SELECT folder FROM recent_folders WHERE pinned = 0
                 ORDER BY last_opened_at DESC LIMIT ?
             )",
        )
        .bind(MAX_RECENT_FOLDERS)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Pin or unpin a folder. Pinning a folder not yet in the list adds it.
    pub async fn set_folder_pinned(&self, folder: &Path, pinned: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO recent_folders (folder, pinned, last_opened_at) VALUES (?, ?, ?)
             ON CONFLICT(folder) DO UPDATE SET pinned = excluded.pinned",
        )
        .bind(path_str(folder))
        .bind(pinned)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Recent folders, most recently opened first
    pub async fn recent_folders(&self) -> Result<Vec<RecentFolder>> {
        let rows: Vec<(String, bool)> = sqlx::query_as(
            "SELECT folder, pinned FROM recent_folders ORDER BY last_opened_at DESC",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(folder, pinned)| RecentFolder {
                folder: PathBuf::from(folder),
                pinned,
            })
            .collect())
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
