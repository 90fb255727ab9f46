//! Audio metadata extraction
//!
//! Reads tags, stream properties, and embedded art from audio files using
//! lofty. Extraction is a pure function of the file contents; missing tags
//! fall back to filename-derived placeholders rather than failing.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use lofty::error::ErrorKind;
use lofty::file::TaggedFileExt;
use lofty::prelude::*;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use thiserror::Error;

use attacca_common::{EmbeddedArt, Track};

/// Metadata extraction errors
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Failed to open or parse the audio file
    #[error("Failed to read file: {0}")]
    ReadError(String),

    /// Container not recognized by any known format reader
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// I/O error (file read)
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Metadata extractor
///
/// Stateless; the struct exists so call sites read like the other library
/// services.
pub struct MetadataExtractor;

impl MetadataExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract a [`Track`] from an audio file.
    ///
    /// `mtime` is the modification time the scanner observed at listing
    /// time, carried into the track so cache keys and the track agree on
    /// which file version they describe.
    pub fn extract(&self, path: &Path, mtime: SystemTime) -> Result<Track, MetadataError> {
        let tagged_file = Probe::open(path)
            .map_err(|e| read_error(path, e))?
            .read()
            .map_err(|e| read_error(path, e))?;

        let properties = tagged_file.properties();
        let duration_ms = properties.duration().as_millis() as u64;
        let sample_rate = properties.sample_rate();
        let channels = properties.channels();

        let tag = tagged_file.primary_tag().or_else(|| tagged_file.first_tag());

        let (title, artist, album, track_number, year, art, replay_gain_db) =
            if let Some(tag) = tag {
                (
                    tag.title().map(|s| s.to_string()),
                    tag.artist().map(|s| s.to_string()),
                    tag.album().map(|s| s.to_string()),
                    tag.track(),
                    tag.year(),
                    first_picture(tag),
                    replay_gain(tag),
                )
            } else {
                (None, None, None, None, None, None, None)
            };

        let title = title.unwrap_or_else(|| file_stem_title(path));

        tracing::debug!(
            file = %path.display(),
            title = %title,
            artist = ?artist,
            duration_ms,
            "Extracted metadata"
        );

        Ok(Track {
            path: path.to_path_buf(),
            duration_ms,
            title,
            artist: artist.unwrap_or_else(|| "Unknown Artist".to_string()),
            album: album.unwrap_or_else(|| "Unknown Album".to_string()),
            track_number,
            year,
            sample_rate,
            channels,
            art,
            replay_gain_db,
            mtime,
        })
    }
}

impl Default for MetadataExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn read_error(path: &Path, e: lofty::error::LoftyError) -> MetadataError {
    match e.kind() {
        ErrorKind::UnknownFormat => {
            MetadataError::UnsupportedFormat(path.display().to_string())
        }
        _ => MetadataError::ReadError(e.to_string()),
    }
}

/// First embedded picture, any type, as cover art
fn first_picture(tag: &Tag) -> Option<EmbeddedArt> {
    tag.pictures().iter().find_map(|pic| {
        let data = pic.data();
        if data.is_empty() {
            return None;
        }
        let mime_type = pic
            .mime_type()
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Some(EmbeddedArt {
            mime_type,
            data: Arc::from(data),
        })
    })
}

/// Track gain from the standard ReplayGain tag item ("-6.5 dB" style)
fn replay_gain(tag: &Tag) -> Option<f32> {
    let raw = tag.get_string(&ItemKey::ReplayGainTrackGain)?;
    raw.split_whitespace().next()?.parse::<f32>().ok()
}

fn file_stem_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
