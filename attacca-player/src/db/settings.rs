//! Key-value settings storage
//!
//! Generic string-keyed get/set over the `settings` table, plus typed
//! accessors that clamp ranges and fall back to (and seed) defaults
//! when a key is missing.

use std::str::FromStr;

use sqlx::SqlitePool;
use tracing::warn;

use attacca_common::{EqPreset, RepeatMode};

use crate::error::{Error, Result};

pub const DEFAULT_VOLUME: f32 = 0.8;
pub const DEFAULT_CROSSFADE_MS: u64 = 3000;
pub const MAX_CROSSFADE_MS: u64 = 10_000;
pub const DEFAULT_POSITION_INTERVAL_MS: u64 = 250;
pub const MIN_POSITION_INTERVAL_MS: u64 = 100;
pub const MAX_POSITION_INTERVAL_MS: u64 = 5_000;

/// Read a setting, parsed into the requested type.
///
/// Returns `Ok(None)` when the key is absent; a present-but-unparseable
/// value is a `Config` error.
pub async fn get_setting<T: FromStr>(db: &SqlitePool, key: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;

    match value {
        Some(s) => {
            let parsed = s.parse::<T>().map_err(|_| {
                Error::Config(format!(
                    "Failed to parse setting '{}': invalid value '{}'",
                    key, s
                ))
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Write a setting (insert or update).
pub async fn set_setting<T: ToString>(db: &SqlitePool, key: &str, value: T) -> Result<()> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;
    Ok(())
}

/// Master volume in [0.0, 1.0]; missing key seeds the default.
pub async fn get_volume(db: &SqlitePool) -> Result<f32> {
    match get_setting::<f32>(db, "volume").await? {
        Some(v) => Ok(v.clamp(0.0, 1.0)),
        None => {
            set_setting(db, "volume", DEFAULT_VOLUME).await?;
            Ok(DEFAULT_VOLUME)
        }
    }
}

pub async fn set_volume(db: &SqlitePool, volume: f32) -> Result<()> {
    set_setting(db, "volume", volume.clamp(0.0, 1.0)).await
}

/// Crossfade duration in ms, clamped to [0, 10000].
pub async fn get_crossfade_ms(db: &SqlitePool) -> Result<u64> {
    match get_setting::<u64>(db, "crossfade_ms").await? {
        Some(ms) => Ok(ms.min(MAX_CROSSFADE_MS)),
        None => {
            set_setting(db, "crossfade_ms", DEFAULT_CROSSFADE_MS).await?;
            Ok(DEFAULT_CROSSFADE_MS)
        }
    }
}

pub async fn set_crossfade_ms(db: &SqlitePool, ms: u64) -> Result<()> {
    set_setting(db, "crossfade_ms", ms.min(MAX_CROSSFADE_MS)).await
}

/// Position event interval in ms, clamped to [100, 5000].
pub async fn get_position_interval_ms(db: &SqlitePool) -> Result<u64> {
    match get_setting::<u64>(db, "position_interval_ms").await? {
        Some(ms) => Ok(ms.clamp(MIN_POSITION_INTERVAL_MS, MAX_POSITION_INTERVAL_MS)),
        None => {
            set_setting(db, "position_interval_ms", DEFAULT_POSITION_INTERVAL_MS).await?;
            Ok(DEFAULT_POSITION_INTERVAL_MS)
        }
    }
}

pub async fn set_position_interval_ms(db: &SqlitePool, ms: u64) -> Result<()> {
    set_setting(
        db,
        "position_interval_ms",
        ms.clamp(MIN_POSITION_INTERVAL_MS, MAX_POSITION_INTERVAL_MS),
    )
    .await
}

/// Repeat mode; an unknown stored value falls back to Off with a warning.
pub async fn get_repeat_mode(db: &SqlitePool) -> Result<RepeatMode> {
    match get_setting::<String>(db, "repeat_mode").await? {
        Some(s) => match RepeatMode::from_str(&s) {
            Some(mode) => Ok(mode),
            None => {
                warn!("Unknown repeat_mode '{}', using off", s);
                Ok(RepeatMode::Off)
            }
        },
        None => {
            set_setting(db, "repeat_mode", RepeatMode::Off.as_str()).await?;
            Ok(RepeatMode::Off)
        }
    }
}

pub async fn set_repeat_mode(db: &SqlitePool, mode: RepeatMode) -> Result<()> {
    set_setting(db, "repeat_mode", mode.as_str()).await
}

/// EQ preset; an unknown stored value falls back to flat with a warning.
pub async fn get_eq_preset(db: &SqlitePool) -> Result<EqPreset> {
    match get_setting::<String>(db, "eq_preset").await? {
        Some(s) => match EqPreset::from_str(&s) {
            Some(preset) => Ok(preset),
            None => {
                warn!("Unknown eq_preset '{}', using flat", s);
                Ok(EqPreset::Flat)
            }
        },
        None => {
            set_setting(db, "eq_preset", EqPreset::Flat.as_str()).await?;
            Ok(EqPreset::Flat)
        }
    }
}

pub async fn set_eq_preset(db: &SqlitePool, preset: EqPreset) -> Result<()> {
    set_setting(db, "eq_preset", preset.as_str()).await
}

pub async fn get_shuffle(db: &SqlitePool) -> Result<bool> {
    match get_setting::<bool>(db, "shuffle").await? {
        Some(v) => Ok(v),
        None => {
            set_setting(db, "shuffle", false).await?;
            Ok(false)
        }
    }
}

pub async fn set_shuffle(db: &SqlitePool, shuffle: bool) -> Result<()> {
    set_setting(db, "shuffle", shuffle).await
}

/// ReplayGain normalization toggle.
pub async fn get_normalize(db: &SqlitePool) -> Result<bool> {
    match get_setting::<bool>(db, "normalize").await? {
        Some(v) => Ok(v),
        None => {
            set_setting(db, "normalize", true).await?;
            Ok(true)
        }
    }
}

pub async fn set_normalize(db: &SqlitePool, normalize: bool) -> Result<()> {
    set_setting(db, "normalize", normalize).await
}

/// Whether play resumes from the persisted per-track position.
pub async fn get_auto_resume(db: &SqlitePool) -> Result<bool> {
    match get_setting::<bool>(db, "auto_resume").await? {
        Some(v) => Ok(v),
        None => {
            set_setting(db, "auto_resume", true).await?;
            Ok(true)
        }
    }
}

pub async fn set_auto_resume(db: &SqlitePool, auto_resume: bool) -> Result<()> {
    set_setting(db, "auto_resume", auto_resume).await
}

/// Folder to reopen when the player starts without one. Never seeded.
pub async fn get_last_folder(db: &SqlitePool) -> Result<Option<String>> {
    get_setting::<String>(db, "last_folder").await
}

pub async fn set_last_folder(db: &SqlitePool, folder: &str) -> Result<()> {
    set_setting(db, "last_folder", folder).await
}
