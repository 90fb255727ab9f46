//! Shared playback state
//!
//! Session parameters and the event channel, shared between the engine
//! (the only writer), the CLI surface, and event subscribers. Readers
//! take immutable [`PlayerSnapshot`] copies rather than holding locks.

use std::path::PathBuf;

use tokio::sync::{broadcast, RwLock};

use attacca_common::{EqPreset, PlayerEvent, PlaybackState, RepeatMode};

/// Currently playing track, as readers see it
#[derive(Debug, Clone)]
pub struct CurrentTrack {
    pub path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Consumed position in milliseconds (updated by the engine loop)
    pub position_ms: u64,
    pub duration_ms: u64,
}

/// Immutable copy of the session for display and inspection
#[derive(Debug, Clone)]
pub struct PlayerSnapshot {
    pub state: PlaybackState,
    pub current: Option<CurrentTrack>,
    pub volume: f32,
    pub muted: bool,
    pub shuffle: bool,
    pub repeat: RepeatMode,
    pub crossfade_ms: u64,
    pub eq_preset: EqPreset,
    pub normalize: bool,
    pub folder: Option<PathBuf>,
    pub track_count: usize,
}

/// Shared state accessible by all components
///
/// RwLock per field: reads are frequent, writes rare and engine-only.
pub struct SharedState {
    pub playback_state: RwLock<PlaybackState>,
    pub current_track: RwLock<Option<CurrentTrack>>,
    pub volume: RwLock<f32>,
    pub muted: RwLock<bool>,
    pub shuffle: RwLock<bool>,
    pub repeat: RwLock<RepeatMode>,
    pub crossfade_ms: RwLock<u64>,
    pub eq_preset: RwLock<EqPreset>,
    pub normalize: RwLock<bool>,
    pub folder: RwLock<Option<PathBuf>>,
    pub track_count: RwLock<usize>,

    /// Event broadcaster for UI layers and loggers
    pub event_tx: broadcast::Sender<PlayerEvent>,
}

impl SharedState {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            playback_state: RwLock::new(PlaybackState::Idle),
            current_track: RwLock::new(None),
            volume: RwLock::new(0.8),
            muted: RwLock::new(false),
            shuffle: RwLock::new(false),
            repeat: RwLock::new(RepeatMode::Off),
            crossfade_ms: RwLock::new(3000),
            eq_preset: RwLock::new(EqPreset::Flat),
            normalize: RwLock::new(true),
            folder: RwLock::new(None),
            track_count: RwLock::new(0),
            event_tx,
        }
    }

    /// Broadcast an event to all subscribers. No receivers is fine.
    pub fn broadcast_event(&self, event: PlayerEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn get_playback_state(&self) -> PlaybackState {
        self.playback_state.read().await.clone()
    }

    /// Move the state machine, broadcasting the transition. Writing the
    /// same state twice emits nothing.
    pub async fn set_playback_state(&self, new_state: PlaybackState) {
        let mut guard = self.playback_state.write().await;
        if *guard == new_state {
            return;
        }
        let old_state = std::mem::replace(&mut *guard, new_state.clone());
        drop(guard);
        self.broadcast_event(PlayerEvent::StateChanged {
            old_state,
            new_state,
            timestamp: chrono::Utc::now(),
        });
    }

    pub async fn get_current_track(&self) -> Option<CurrentTrack> {
        self.current_track.read().await.clone()
    }

    pub async fn set_current_track(&self, track: Option<CurrentTrack>) {
        *self.current_track.write().await = track;
    }

    /// Update only the position of the current track, if one is set
    pub async fn set_position_ms(&self, position_ms: u64) {
        if let Some(current) = self.current_track.write().await.as_mut() {
            current.position_ms = position_ms;
        }
    }

    pub async fn get_volume(&self) -> f32 {
        *self.volume.read().await
    }

    pub async fn set_volume(&self, volume: f32) {
        *self.volume.write().await = volume.clamp(0.0, 1.0);
    }

    /// Assemble an immutable copy of the whole session
    pub async fn snapshot(&self) -> PlayerSnapshot {
        PlayerSnapshot {
            state: self.playback_state.read().await.clone(),
            current: self.current_track.read().await.clone(),
            volume: *self.volume.read().await,
            muted: *self.muted.read().await,
            shuffle: *self.shuffle.read().await,
            repeat: *self.repeat.read().await,
            crossfade_ms: *self.crossfade_ms.read().await,
            eq_preset: *self.eq_preset.read().await,
            normalize: *self.normalize.read().await,
            folder: self.folder.read().await.clone(),
            track_count: *self.track_count.read().await,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_transition_broadcasts_once() {
        let state = SharedState::new();
        let mut rx = state.subscribe_events();

        state.set_playback_state(PlaybackState::Playing).await;
        // Same state again is not a transition
        state.set_playback_state(PlaybackState::Playing).await;
        state.set_playback_state(PlaybackState::Paused).await;

        match rx.try_recv().unwrap() {
            PlayerEvent::StateChanged {
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(old_state, PlaybackState::Idle);
                assert_eq!(new_state, PlaybackState::Playing);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.try_recv().unwrap() {
            PlayerEvent::StateChanged { new_state, .. } => {
                assert_eq!(new_state, PlaybackState::Paused);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_volume_clamped() {
        let state = SharedState::new();
        assert_eq!(state.get_volume().await, 0.8);

        state.set_volume(1.5).await;
        assert_eq!(state.get_volume().await, 1.0);

        state.set_volume(-0.1).await;
        assert_eq!(state.get_volume().await, 0.0);
    }

    #[tokio::test]
    async fn test_position_updates_current_track_only() {
        let state = SharedState::new();

        // No current track: position write is a no-op
        state.set_position_ms(5000).await;
        assert!(state.get_current_track().await.is_none());

        state
            .set_current_track(Some(CurrentTrack {
                path: PathBuf::from("/music/a.mp3"),
                title: "a".to_string(),
                artist: "Unknown Artist".to_string(),
                album: "Unknown Album".to_string(),
                position_ms: 0,
                duration_ms: 60_000,
            }))
            .await;
        state.set_position_ms(5000).await;
        assert_eq!(state.get_current_track().await.unwrap().position_ms, 5000);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_session() {
        let state = SharedState::new();
        *state.shuffle.write().await = true;
        *state.crossfade_ms.write().await = 1500;
        state.set_volume(0.4).await;

        let snap = state.snapshot().await;
        assert_eq!(snap.state, PlaybackState::Idle);
        assert!(snap.shuffle);
        assert_eq!(snap.crossfade_ms, 1500);
        assert_eq!(snap.volume, 0.4);
        assert!(snap.current.is_none());
    }
}
