//! Database open, schema creation, and settings defaults

use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::settings::{
    DEFAULT_CROSSFADE_MS, DEFAULT_POSITION_INTERVAL_MS, DEFAULT_VOLUME,
};
use crate::error::Result;

/// Open (creating if needed) the player database and bring the schema
/// and settings defaults up to date.
pub async fn open_database(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    ensure_schema(&pool).await?;
    init_settings_defaults(&pool).await?;
    info!("Database ready at {}", path.display());
    Ok(pool)
}

/// Create all tables if they do not exist. Idempotent.
pub async fn ensure_schema(db: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS track_positions (
            path TEXT PRIMARY KEY,
            position_ms INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS folder_state (
            folder TEXT PRIMARY KEY,
            track_path TEXT,
            updated_at TEXT NOT NULL
        )",
    )
    .execute(db)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS recent_folders (
            folder TEXT PRIMARY KEY,
            pinned INTEGER NOT NULL DEFAULT 0,
            last_opened_at TEXT NOT NULL
        )",
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Seed default settings for any key not already present.
///
/// Existing values are never overwritten, so user changes survive
/// restarts and re-runs.
pub async fn init_settings_defaults(db: &SqlitePool) -> Result<()> {
    let defaults: Vec<(&str, String)> = vec![
        ("volume", DEFAULT_VOLUME.to_string()),
        ("crossfade_ms", DEFAULT_CROSSFADE_MS.to_string()),
        ("eq_preset", "flat".to_string()),
        ("repeat_mode", "off".to_string()),
        ("shuffle", "false".to_string()),
        ("normalize", "true".to_string()),
        ("auto_resume", "true".to_string()),
        (
            "position_interval_ms",
            DEFAULT_POSITION_INTERVAL_MS.to_string(),
        ),
    ];

    for (key, value) in defaults {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM settings WHERE key = ?)")
                .bind(key)
                .fetch_one(db)
                .await?;

        if !exists {
            sqlx::query("INSERT INTO settings (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(&value)
                .execute(db)
                .await?;
            debug!("Seeded default setting {} = {}", key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::settings::{get_setting, set_setting};

    async fn setup_test_db() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let db = setup_test_db().await;
        ensure_schema(&db).await.unwrap();
        ensure_schema(&db).await.unwrap();
    }

    #[tokio::test]
    async fn test_defaults_are_seeded() {
        let db = setup_test_db().await;
        init_settings_defaults(&db).await.unwrap();

        let volume: Option<f32> = get_setting(&db, "volume").await.unwrap();
        assert_eq!(volume, Some(DEFAULT_VOLUME));

        let repeat: Option<String> = get_setting(&db, "repeat_mode").await.unwrap();
        assert_eq!(repeat.as_deref(), Some("off"));
    }

    #[tokio::test]
    async fn test_defaults_do_not_overwrite_user_values() {
        let db = setup_test_db().await;
        init_settings_defaults(&db).await.unwrap();

        set_setting(&db, "volume", 0.25).await.unwrap();
        init_settings_defaults(&db).await.unwrap();

        let volume: Option<f32> = get_setting(&db, "volume").await.unwrap();
        assert_eq!(volume, Some(0.25));
    }
}
