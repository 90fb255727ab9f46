//! Event types for the player notification channel
//!
//! The controller broadcasts `PlayerEvent`s to every subscriber (UI layers,
//! loggers). Delivery is at-least-once per live subscriber with ordering
//! preserved; a subscriber that falls behind observes a lag error from the
//! channel rather than reordered events.
//!
//! Paths are carried as display strings so every event serializes cleanly.

use crate::types::{EqPreset, PlaybackState, RepeatMode, TransitionKind};
use serde::{Deserialize, Serialize};

/// Player event types
///
/// Events are broadcast by the playback controller and can be serialized
/// for transport to out-of-process UIs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PlayerEvent {
    /// Playback state machine transitioned
    StateChanged {
        old_state: PlaybackState,
        new_state: PlaybackState,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track became the current track and began producing audio
    TrackStarted {
        path: String,
        title: String,
        artist: String,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// The current track stopped producing audio
    TrackFinished {
        path: String,
        /// false when the track was skipped rather than played out
        completed: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Periodic position tick for the current track
    PositionChanged {
        path: String,
        position_ms: u64,
        duration_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A crossfade or gapless handoff began
    TransitionStarted {
        from_path: String,
        to_path: String,
        kind: TransitionKind,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Queue shape or policy changed (reshuffle, repeat/shuffle toggle, rebind)
    QueueChanged {
        track_count: usize,
        shuffle: bool,
        repeat: RepeatMode,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Volume or mute changed
    VolumeChanged {
        volume: f32,
        muted: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Equalizer preset changed
    EqPresetChanged {
        preset: EqPreset,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Crossfade duration changed
    CrossfadeChanged {
        crossfade_ms: u64,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Folder scan began
    ScanStarted {
        root: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Folder scan finished (possibly served from cache)
    ScanCompleted {
        root: String,
        track_count: usize,
        warning_count: usize,
        /// true when the unchanged folder was served from the cached index
        from_cache: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A file was skipped during a scan
    ScanWarning {
        path: String,
        reason: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A track failed to decode
    TrackFailed {
        path: String,
        error: String,
        /// true when the failure stopped playback (current track),
        /// false when a prefetched track was recorded for skipping
        fatal: bool,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PlayerEvent {
    /// Get event type as string for filtering
    pub fn event_type(&self) -> &str {
        match self {
            PlayerEvent::StateChanged { .. } => "StateChanged",
            PlayerEvent::TrackStarted { .. } => "TrackStarted",
            PlayerEvent::TrackFinished { .. } => "TrackFinished",
            PlayerEvent::PositionChanged { .. } => "PositionChanged",
            PlayerEvent::TransitionStarted { .. } => "TransitionStarted",
            PlayerEvent::QueueChanged { .. } => "QueueChanged",
            PlayerEvent::VolumeChanged { .. } => "VolumeChanged",
            PlayerEvent::EqPresetChanged { .. } => "EqPresetChanged",
            PlayerEvent::CrossfadeChanged { .. } => "CrossfadeChanged",
            PlayerEvent::ScanStarted { .. } => "ScanStarted",
            PlayerEvent::ScanCompleted { .. } => "ScanCompleted",
            PlayerEvent::ScanWarning { .. } => "ScanWarning",
            PlayerEvent::TrackFailed { .. } => "TrackFailed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = PlayerEvent::TrackStarted {
            path: "/music/a.mp3".to_string(),
            title: "a".to_string(),
            artist: "Unknown Artist".to_string(),
            duration_ms: 180_000,
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"TrackStarted""#));
        assert!(json.contains(r#""duration_ms":180000"#));

        let back: PlayerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), "TrackStarted");
    }

    #[test]
    fn test_state_changed_round_trip() {
        let event = PlayerEvent::StateChanged {
            old_state: PlaybackState::Playing,
            new_state: PlaybackState::Stopped {
                error: Some("device lost".to_string()),
            },
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: PlayerEvent = serde_json::from_str(&json).unwrap();
        match back {
            PlayerEvent::StateChanged { new_state, .. } => {
                assert_eq!(
                    new_state,
                    PlaybackState::Stopped {
                        error: Some("device lost".to_string())
                    }
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = PlayerEvent::VolumeChanged {
            volume: 0.8,
            muted: false,
            timestamp: chrono::Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(&format!(r#""type":"{}""#, event.event_type())));
    }
}
