//! Core shared types: track model and playback enums

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

/// A single audio file with extracted metadata.
///
/// Identity is the absolute path. A `Track` is immutable once constructed;
/// when the file's modification time changes, a new `Track` is derived and
/// the old one is superseded (never mutated in place).
#[derive(Debug, Clone)]
pub struct Track {
    /// Absolute path to the audio file (track identity)
    pub path: PathBuf,

    /// Total duration in milliseconds (0 when the container did not report one)
    pub duration_ms: u64,

    /// Title from tags, falling back to the file stem
    pub title: String,

    /// Artist from tags, falling back to "Unknown Artist"
    pub artist: String,

    /// Album from tags, falling back to "Unknown Album"
    pub album: String,

    /// Track number within the album, when tagged
    pub track_number: Option<u32>,

    /// Release year, when tagged
    pub year: Option<u32>,

    /// Native sample rate reported by the container
    pub sample_rate: Option<u32>,

    /// Native channel count reported by the container
    pub channels: Option<u8>,

    /// First embedded picture, when present (best-effort)
    pub art: Option<EmbeddedArt>,

    /// ReplayGain track gain in dB, when tagged
    pub replay_gain_db: Option<f32>,

    /// File modification time at extraction (cache key component)
    pub mtime: SystemTime,
}

impl Track {
    /// Linear amplitude multiplier derived from the ReplayGain tag.
    ///
    /// Returns 1.0 when the track carries no gain tag.
    pub fn replay_gain_factor(&self) -> f32 {
        match self.replay_gain_db {
            Some(db) => 10f32.powf(db / 20.0),
            None => 1.0,
        }
    }
}

/// Embedded album art extracted from a tag.
///
/// The byte payload sits behind an `Arc` so cloning a `Track` (and the
/// index that holds it) stays cheap.
#[derive(Clone)]
pub struct EmbeddedArt {
    /// MIME type as reported by the tag (e.g. "image/jpeg")
    pub mime_type: String,

    /// Raw image bytes
    pub data: Arc<[u8]>,
}

impl std::fmt::Debug for EmbeddedArt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedArt")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Playback controller state machine states.
///
/// `Stopped` is the terminal error state; it is reachable from any state on
/// a fatal decode error and left only by an explicit play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PlaybackState {
    /// No track loaded
    Idle,
    /// Audio flowing
    Playing,
    /// Position held, output silent
    Paused,
    /// Crossfade or gapless handoff in progress
    Transitioning,
    /// Fatal playback error; requires explicit play to recover
    Stopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl PlaybackState {
    /// Terminal states accept no state-independent parameter changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PlaybackState::Stopped { .. })
    }

    /// True while the engine is producing (or handing off) audio.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackState::Playing | PlaybackState::Transitioning
        )
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackState::Idle => write!(f, "Idle"),
            PlaybackState::Playing => write!(f, "Playing"),
            PlaybackState::Paused => write!(f, "Paused"),
            PlaybackState::Transitioning => write!(f, "Transitioning"),
            PlaybackState::Stopped { error: None } => write!(f, "Stopped"),
            PlaybackState::Stopped { error: Some(e) } => write!(f, "Stopped ({})", e),
        }
    }
}

/// Repeat policy consumed by the track queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    /// Stop after a single pass
    Off,
    /// Pin the current track
    One,
    /// Wrap to a new pass at the end
    All,
}

impl RepeatMode {
    /// Parse from the persisted settings string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(RepeatMode::Off),
            "one" => Some(RepeatMode::One),
            "all" => Some(RepeatMode::All),
            _ => None,
        }
    }

    /// Canonical settings string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RepeatMode::Off => "off",
            RepeatMode::One => "one",
            RepeatMode::All => "all",
        }
    }
}

impl Default for RepeatMode {
    fn default() -> Self {
        RepeatMode::Off
    }
}

impl std::fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Equalizer presets: fixed band→gain tables applied to the mixed output.
///
/// The gain tables themselves live with the DSP code; this enum is the
/// persisted/displayed identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EqPreset {
    Flat,
    BassBoost,
    TrebleBoost,
    Vocal,
    Soft,
}

impl EqPreset {
    /// Parse from the persisted settings string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "flat" => Some(EqPreset::Flat),
            "bass_boost" | "bass boost" => Some(EqPreset::BassBoost),
            "treble_boost" | "treble boost" => Some(EqPreset::TrebleBoost),
            "vocal" => Some(EqPreset::Vocal),
            "soft" => Some(EqPreset::Soft),
            _ => None,
        }
    }

    /// Canonical settings string.
    pub fn as_str(&self) -> &'static str {
        match self {
            EqPreset::Flat => "flat",
            EqPreset::BassBoost => "bass_boost",
            EqPreset::TrebleBoost => "treble_boost",
            EqPreset::Vocal => "vocal",
            EqPreset::Soft => "soft",
        }
    }

    /// Human-readable display name.
    pub fn display_name(&self) -> &'static str {
        match self {
            EqPreset::Flat => "Flat",
            EqPreset::BassBoost => "Bass Boost",
            EqPreset::TrebleBoost => "Treble Boost",
            EqPreset::Vocal => "Vocal",
            EqPreset::Soft => "Soft",
        }
    }

    /// All presets, for validation and UI listing.
    pub fn all_variants() -> &'static [EqPreset] {
        &[
            EqPreset::Flat,
            EqPreset::BassBoost,
            EqPreset::TrebleBoost,
            EqPreset::Vocal,
            EqPreset::Soft,
        ]
    }
}

impl Default for EqPreset {
    fn default() -> Self {
        EqPreset::Flat
    }
}

impl std::fmt::Display for EqPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How one track handed off to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// Timed overlap with linear cross-mix
    Crossfade,
    /// Back-to-back, no gap and no overlap
    Gapless,
}

impl std::fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransitionKind::Crossfade => write!(f, "crossfade"),
            TransitionKind::Gapless => write!(f, "gapless"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_gain_factor() {
        let mut track = Track {
            path: PathBuf::from("/music/a.mp3"),
            duration_ms: 1000,
            title: "a".to_string(),
            artist: "Unknown Artist".to_string(),
            album: "Unknown Album".to_string(),
            track_number: None,
            year: None,
            sample_rate: None,
            channels: None,
            art: None,
            replay_gain_db: None,
            mtime: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(track.replay_gain_factor(), 1.0);

        track.replay_gain_db = Some(-6.0);
        let factor = track.replay_gain_factor();
        assert!((factor - 0.5012).abs() < 0.001, "got {}", factor);

        track.replay_gain_db = Some(0.0);
        assert_eq!(track.replay_gain_factor(), 1.0);
    }

    #[test]
    fn test_repeat_mode_round_trip() {
        for mode in [RepeatMode::Off, RepeatMode::One, RepeatMode::All] {
            assert_eq!(RepeatMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(RepeatMode::from_str("ALL"), Some(RepeatMode::All));
        assert_eq!(RepeatMode::from_str("bogus"), None);
        assert_eq!(RepeatMode::default(), RepeatMode::Off);
    }

    #[test]
    fn test_eq_preset_round_trip() {
        for preset in EqPreset::all_variants() {
            assert_eq!(EqPreset::from_str(preset.as_str()), Some(*preset));
        }
        assert_eq!(EqPreset::from_str("Bass Boost"), Some(EqPreset::BassBoost));
        assert_eq!(EqPreset::from_str("nope"), None);
        assert_eq!(EqPreset::default(), EqPreset::Flat);
    }

    #[test]
    fn test_playback_state_serde_shape() {
        let json = serde_json::to_string(&PlaybackState::Playing).unwrap();
        assert_eq!(json, r#"{"state":"playing"}"#);

        let json = serde_json::to_string(&PlaybackState::Stopped {
            error: Some("decode failed".to_string()),
        })
        .unwrap();
        assert!(json.contains(r#""state":"stopped""#));
        assert!(json.contains("decode failed"));

        let json = serde_json::to_string(&PlaybackState::Stopped { error: None }).unwrap();
        assert_eq!(json, r#"{"state":"stopped"}"#);
    }

    #[test]
    fn test_playback_state_predicates() {
        assert!(PlaybackState::Stopped { error: None }.is_terminal());
        assert!(!PlaybackState::Paused.is_terminal());
        assert!(PlaybackState::Playing.is_active());
        assert!(PlaybackState::Transitioning.is_active());
        assert!(!PlaybackState::Idle.is_active());
    }

    #[test]
    fn test_embedded_art_debug_hides_payload() {
        let art = EmbeddedArt {
            mime_type: "image/png".to_string(),
            data: Arc::from(vec![0u8; 4096].into_boxed_slice()),
        };
        let rendered = format!("{:?}", art);
        assert!(rendered.contains("image/png"));
        assert!(rendered.contains("4096"));
        assert!(!rendered.contains("0, 0, 0"));
    }
}
