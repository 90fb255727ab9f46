//! Playback engine: the controller that ties queue, mixer, decode
//! streams, and audio output together.
//!
//! Two background tasks drive playback once `start` is called:
//!
//! - A fill task (10ms) pulls mixed frames out of the [`FrameMixer`]
//!   and keeps the playout ring topped up for the device callback.
//! - A coordination task (100ms) consumes the mixer's finished and
//!   promoted signals, advances the queue, stages prefetched streams,
//!   triggers crossfades, and persists positions.
//!
//! `AudioOutput` is not `Send` (cpal streams hold thread-affine device
//! handles), so the output lives on a dedicated OS thread that only
//! keeps the stream alive and reports device errors through a shared
//! flag. The realtime callback itself never takes a lock; it pops from
//! the ring or emits silence.
//!
//! Control methods (`play`, `pause`, `seek`, ...) are async and safe to
//! call from any task. Lock order where two locks are needed: queue
//! before mixer, and neither is held across a decode wait.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sqlx::SqlitePool;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use attacca_common::{
    EqPreset, PlaybackState, PlayerEvent, RepeatMode, Track, TransitionKind,
};
use attacca_library::{Library, LibraryIndex};

use crate::audio::{AudioOutput, STANDARD_SAMPLE_RATE};
use crate::db::{settings, PositionStore, RecentFolder};
use crate::error::{Error, Result};
use crate::playback::mixer::{FinishedStream, FrameMixer, RESUME_FADE_FRAMES};
use crate::playback::queue::TrackQueue;
use crate::playback::ring_buffer::{PlayoutConsumer, PlayoutRing};
use crate::playback::stream::DecodeStream;
use crate::state::{CurrentTrack, PlayerSnapshot, SharedState};

/// Coordination loop period
const COORDINATION_INTERVAL_MS: u64 = 100;

/// Playout ring fill period
const FILL_INTERVAL_MS: u64 = 10;

/// How far ahead of the crossfade window the next stream is staged
const PREFETCH_LEAD_MS: u64 = 5_000;

/// Periodic resume-position persistence while playing
const POSITION_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on waiting for a fresh stream to buffer its first audio
const STREAM_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Playback controller
///
/// Cheap to hand around: background tasks run on a handle-clone of the
/// engine, and all fields are shared.
pub struct PlaybackEngine {
    db: SqlitePool,
    store: PositionStore,
    state: Arc<SharedState>,
    library: Arc<Library>,
    queue: Arc<RwLock<Option<TrackQueue>>>,
    mixer: Arc<RwLock<FrameMixer>>,
    running: Arc<RwLock<bool>>,
    /// Underrun classification flag shared with the playout ring
    audio_expected: Arc<AtomicBool>,
    /// Raised by the audio thread when the device fails
    device_error: Arc<AtomicBool>,
    /// True between a crossfade starting and its promotion settling
    crossfade_announced: Arc<AtomicBool>,
    /// Master volume, shared with the realtime callback
    volume: Arc<Mutex<f32>>,
    muted: Arc<AtomicBool>,
    /// Staged track whose decode failed; skipped until the queue moves
    prefetch_failed: Arc<Mutex<Option<PathBuf>>>,
    auto_resume: bool,
    position_interval_ms: u64,
    device_name: Option<String>,
}

impl PlaybackEngine {
    /// Create the engine, loading persisted settings and seeding the
    /// shared state with them.
    pub async fn new(
        db: SqlitePool,
        state: Arc<SharedState>,
        library: Arc<Library>,
        device_name: Option<String>,
    ) -> Result<Self> {
        let (volume, crossfade_ms, interval_ms, repeat, eq_preset, shuffle, normalize, auto_resume) = tokio::join!(
            settings::get_volume(&db),
            settings::get_crossfade_ms(&db),
            settings::get_position_interval_ms(&db),
            settings::get_repeat_mode(&db),
            settings::get_eq_preset(&db),
            settings::get_shuffle(&db),
            settings::get_normalize(&db),
            settings::get_auto_resume(&db),
        );
        let volume = volume?;
        let crossfade_ms = crossfade_ms?;
        let position_interval_ms = interval_ms?;
        let repeat = repeat?;
        let eq_preset = eq_preset?;
        let shuffle = shuffle?;
        let normalize = normalize?;
        let auto_resume = auto_resume?;

        // Seed the shared state so subscribers see persisted settings
        // before anything plays.
        *state.volume.write().await = volume;
        *state.crossfade_ms.write().await = crossfade_ms;
        *state.repeat.write().await = repeat;
        *state.eq_preset.write().await = eq_preset;
        *state.shuffle.write().await = shuffle;
        *state.normalize.write().await = normalize;

        let mixer = FrameMixer::new(eq_preset)?;

        info!(
            "Engine settings: volume={:.2}, crossfade={}ms, shuffle={}, repeat={}, eq={}",
            volume,
            crossfade_ms,
            shuffle,
            repeat.as_str(),
            eq_preset.as_str()
        );

        Ok(Self {
            store: PositionStore::new(db.clone()),
            db,
            state,
            library,
            queue: Arc::new(RwLock::new(None)),
            mixer: Arc::new(RwLock::new(mixer)),
            running: Arc::new(RwLock::new(false)),
            audio_expected: Arc::new(AtomicBool::new(false)),
            device_error: Arc::new(AtomicBool::new(false)),
            crossfade_announced: Arc::new(AtomicBool::new(false)),
            volume: Arc::new(Mutex::new(volume)),
            muted: Arc::new(AtomicBool::new(false)),
            prefetch_failed: Arc::new(Mutex::new(None)),
            auto_resume,
            position_interval_ms,
            device_name,
        })
    }

    /// Start the background tasks and open the audio device.
    pub async fn start(&self) -> Result<()> {
        let consumer = self.start_pipeline().await?;
        self.spawn_output_thread(consumer);
        Ok(())
    }

    /// Start the fill and coordination tasks and return the playout
    /// consumer.
    ///
    /// Split out of `start` so tests (and alternate sinks) can drain
    /// the ring without a real audio device.
    pub async fn start_pipeline(&self) -> Result<PlayoutConsumer> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(Error::InvalidState(
                    "Playback engine already started".to_string(),
                ));
            }
            *running = true;
        }

        let ring = PlayoutRing::new(None, Arc::clone(&self.audio_expected));
        let (mut producer, consumer) = ring.split();

        let mixer = Arc::clone(&self.mixer);
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(FILL_INTERVAL_MS));
            loop {
                tick.tick().await;
                if !*running.read().await {
                    break;
                }
                let mut mixer = mixer.write().await;
                while producer.needs_frames() {
                    match mixer.next_frame() {
                        Some(frame) => {
                            if !producer.push(frame) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            debug!("Ring fill task exited");
        });

        let engine = self.clone_handles();
        tokio::spawn(async move {
            engine.coordination_loop().await;
        });

        info!("Playback engine started");
        Ok(consumer)
    }

    fn clone_handles(&self) -> Self {
        Self {
            db: self.db.clone(),
            store: self.store.clone(),
            state: Arc::clone(&self.state),
            library: Arc::clone(&self.library),
            queue: Arc::clone(&self.queue),
            mixer: Arc::clone(&self.mixer),
            running: Arc::clone(&self.running),
            audio_expected: Arc::clone(&self.audio_expected),
            device_error: Arc::clone(&self.device_error),
            crossfade_announced: Arc::clone(&self.crossfade_announced),
            volume: Arc::clone(&self.volume),
            muted: Arc::clone(&self.muted),
            prefetch_failed: Arc::clone(&self.prefetch_failed),
            auto_resume: self.auto_resume,
            position_interval_ms: self.position_interval_ms,
            device_name: self.device_name.clone(),
        }
    }

    /// Spawn the OS thread that owns the audio output.
    ///
    /// The thread opens the device, installs the ring-draining
    /// callback, then sleeps, polling for device errors and shutdown.
    fn spawn_output_thread(&self, mut consumer: PlayoutConsumer) {
        let device_name = self.device_name.clone();
        let volume = Arc::clone(&self.volume);
        let muted = Arc::clone(&self.muted);
        let running = Arc::clone(&self.running);
        let device_error = Arc::clone(&self.device_error);
        let rt = tokio::runtime::Handle::current();

        let spawned = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                let mut output =
                    match AudioOutput::new_with_volume(device_name.as_deref(), volume, muted) {
                        Ok(output) => output,
                        Err(e) => {
                            error!("Failed to open audio output: {}", e);
                            device_error.store(true, Ordering::Relaxed);
                            return;
                        }
                    };

                if let Err(e) = output.start(move || consumer.pop().unwrap_or_default()) {
                    error!("Failed to start audio stream: {}", e);
                    device_error.store(true, Ordering::Relaxed);
                    return;
                }

                loop {
                    std::thread::sleep(Duration::from_millis(500));
                    if output.has_error() {
                        device_error.store(true, Ordering::Relaxed);
                    }
                    let stopped = rt.block_on(async { !*running.read().await });
                    if stopped {
                        break;
                    }
                }
                output.stop();
                debug!("Audio output thread exited");
            });

        if let Err(e) = spawned {
            error!("Failed to spawn audio output thread: {}", e);
            self.device_error.store(true, Ordering::Relaxed);
        }
    }

    async fn coordination_loop(self) {
        let mut tick = tokio::time::interval(Duration::from_millis(COORDINATION_INTERVAL_MS));
        let mut last_persist = Instant::now();
        let mut last_position_event = Instant::now();

        loop {
            tick.tick().await;
            if !*self.running.read().await {
                break;
            }

            if self.device_error.swap(false, Ordering::Relaxed) {
                self.enter_stopped("audio device error").await;
                continue;
            }

            if !self.drain_mixer_signals().await {
                continue;
            }

            if !self.state.get_playback_state().await.is_active() {
                continue;
            }

            if self.mixer.read().await.is_idle() {
                self.advance_after_end().await;
                continue;
            }

            self.maintain_transition().await;

            let position = {
                let mixer = self.mixer.read().await;
                mixer
                    .current_track()
                    .map(|t| (t, mixer.position_ms().unwrap_or(0)))
            };
            if let Some((track, position_ms)) = position {
                self.state.set_position_ms(position_ms).await;

                if last_position_event.elapsed()
                    >= Duration::from_millis(self.position_interval_ms)
                {
                    last_position_event = Instant::now();
                    self.state.broadcast_event(PlayerEvent::PositionChanged {
                        path: track.path.display().to_string(),
                        position_ms,
                        duration_ms: track.duration_ms,
                        timestamp: chrono::Utc::now(),
                    });
                }

                let playing =
                    self.state.get_playback_state().await == PlaybackState::Playing;
                if playing && last_persist.elapsed() >= POSITION_PERSIST_INTERVAL {
                    last_persist = Instant::now();
                    self.persist_position(&track.path, position_ms).await;
                }
            }
        }
        debug!("Coordination loop exited");
    }

    /// Consume the mixer's finished and promoted signals.
    ///
    /// Returns false when a finished record was a decode failure and
    /// playback stopped.
    async fn drain_mixer_signals(&self) -> bool {
        let (finished, promoted) = {
            let mut mixer = self.mixer.write().await;
            (mixer.take_finished(), mixer.take_promoted())
        };

        let mut ended: Option<PathBuf> = None;
        for done in &finished {
            if self.handle_finished(done).await {
                ended = Some(done.track.path.clone());
            } else {
                return false;
            }
        }

        if let Some(track) = promoted {
            self.handle_promoted(track, ended).await;
        }
        true
    }

    /// Process one finished-stream record. Returns false when the
    /// record carried a decode error and playback entered Stopped.
    async fn handle_finished(&self, done: &FinishedStream) -> bool {
        let path = done.track.path.display().to_string();
        if let Some(decode_error) = &done.error {
            self.state.broadcast_event(PlayerEvent::TrackFailed {
                path,
                error: decode_error.clone(),
                fatal: true,
                timestamp: chrono::Utc::now(),
            });
            self.enter_stopped(&format!("Decode failed: {}", decode_error))
                .await;
            return false;
        }

        self.state.broadcast_event(PlayerEvent::TrackFinished {
            path,
            completed: true,
            timestamp: chrono::Utc::now(),
        });
        // A completed track starts from the top next time.
        if let Err(e) = self.store.clear_position(&done.track.path).await {
            warn!("Failed to clear saved position: {}", e);
        }
        true
    }

    /// The mixer handed playback to the staged stream on its own;
    /// commit the queue movement and announce the new current track.
    async fn handle_promoted(&self, track: Arc<Track>, ended: Option<PathBuf>) {
        {
            let mut queue = self.queue.write().await;
            if let Some(queue) = queue.as_mut() {
                let advanced = queue.advance();
                if advanced.as_ref().map(|t| &t.path) != Some(&track.path) {
                    // The queue changed after this stream was staged;
                    // re-point the cursor at what is actually playing.
                    if let Some(position) = queue.index().position_of(&track.path) {
                        queue.select(position);
                    }
                }
            }
        }

        let position_ms = self.mixer.read().await.position_ms().unwrap_or(0);

        // Crossfades announce themselves when the fade starts; a
        // gapless join is only observable here.
        let announced = self.crossfade_announced.swap(false, Ordering::Relaxed);
        if !announced {
            let from = match ended {
                Some(path) => Some(path),
                None => self.state.get_current_track().await.map(|c| c.path),
            };
            if let Some(from) = from {
                self.state.broadcast_event(PlayerEvent::TransitionStarted {
                    from_path: from.display().to_string(),
                    to_path: track.path.display().to_string(),
                    kind: TransitionKind::Gapless,
                    timestamp: chrono::Utc::now(),
                });
            }
        }

        self.audio_expected.store(true, Ordering::Relaxed);
        self.set_now_playing(&track, position_ms).await;
        self.state.set_playback_state(PlaybackState::Playing).await;
    }

    /// The current stream ended with nothing staged. Walk the queue
    /// until a track starts or the queue runs out.
    async fn advance_after_end(&self) {
        let mut failures = 0usize;
        loop {
            let (next, queue_len) = {
                let mut queue = self.queue.write().await;
                match queue.as_mut() {
                    Some(queue) => (queue.advance(), queue.len()),
                    None => (None, 0),
                }
            };
            let Some(track) = next else {
                debug!("Queue finished, returning to idle");
                self.audio_expected.store(false, Ordering::Relaxed);
                self.state.set_current_track(None).await;
                self.state.set_playback_state(PlaybackState::Idle).await;
                return;
            };

            match self.open_ready_stream(&track, 0).await {
                Ok(stream) => {
                    self.mixer.write().await.start(stream);
                    self.audio_expected.store(true, Ordering::Relaxed);
                    self.set_now_playing(&track, 0).await;
                    self.state.set_playback_state(PlaybackState::Playing).await;
                    return;
                }
                Err(e) => {
                    warn!("Skipping unplayable track {}: {}", track.path.display(), e);
                    self.state.broadcast_event(PlayerEvent::TrackFailed {
                        path: track.path.display().to_string(),
                        error: e.to_string(),
                        fatal: false,
                        timestamp: chrono::Utc::now(),
                    });
                    failures += 1;
                    if failures >= queue_len.max(1) {
                        self.enter_stopped("every queued track failed to decode").await;
                        return;
                    }
                }
            }
        }
    }

    /// Stage the next stream inside the prefetch window and begin the
    /// crossfade once the current tail fits the fade.
    async fn maintain_transition(&self) {
        let (remaining, crossfading, has_pending, pending_error) = {
            let mixer = self.mixer.read().await;
            let pending_error = mixer
                .pending_ref()
                .and_then(|p| p.error().map(|e| (p.track().path.clone(), e)));
            (
                mixer.remaining_ms(),
                mixer.is_crossfading(),
                mixer.has_pending(),
                pending_error,
            )
        };

        if crossfading {
            return;
        }

        // A staged stream that failed to decode is recorded and
        // skipped; the queue moves past it at the next handoff.
        if let Some((path, decode_error)) = pending_error {
            self.mixer.write().await.clear_pending();
            warn!(
                "Prefetched track failed to decode, will skip: {}: {}",
                path.display(),
                decode_error
            );
            self.state.broadcast_event(PlayerEvent::TrackFailed {
                path: path.display().to_string(),
                error: decode_error,
                fatal: false,
                timestamp: chrono::Utc::now(),
            });
            *self.prefetch_failed.lock().unwrap() = Some(path);
            return;
        }

        let crossfade_ms = *self.state.crossfade_ms.read().await;

        if !has_pending {
            // Tracks without a known duration stage immediately; the
            // gapless join at end of stream covers them.
            let window = crossfade_ms + PREFETCH_LEAD_MS;
            let inside_window = remaining.map(|ms| ms <= window).unwrap_or(true);
            if inside_window {
                let next = {
                    let mut queue = self.queue.write().await;
                    queue.as_mut().and_then(|q| q.peek_next())
                };
                if let Some(next) = next {
                    let skip = self
                        .prefetch_failed
                        .lock()
                        .unwrap()
                        .as_ref()
                        .map(|p| *p == next.path)
                        .unwrap_or(false);
                    if !skip {
                        debug!("Prefetching next track: {}", next.path.display());
                        let gain = self.stream_gain(&next).await;
                        let stream = DecodeStream::spawn(Arc::clone(&next), 0, gain);
                        self.mixer.write().await.stage(stream);
                    }
                }
            }
        }

        if crossfade_ms == 0 {
            return;
        }
        let repeat = {
            let queue = self.queue.read().await;
            queue
                .as_ref()
                .map(|q| q.repeat_mode())
                .unwrap_or(RepeatMode::Off)
        };
        if repeat == RepeatMode::One {
            // Repeat-one restarts join gaplessly instead of
            // overlapping a track with itself.
            return;
        }
        let Some(remaining) = remaining else {
            return;
        };
        if remaining > crossfade_ms {
            return;
        }

        let fade_frames = (crossfade_ms * STANDARD_SAMPLE_RATE as u64 / 1000) as usize;
        let begun = {
            let mut mixer = self.mixer.write().await;
            let from = mixer.current_track().map(|t| t.path.clone());
            let to = mixer.pending_ref().map(|p| p.track().path.clone());
            if mixer.begin_crossfade(fade_frames).is_ok() {
                from.zip(to)
            } else {
                // Staged stream not ready yet; retry next tick, or let
                // the end-of-stream join take over.
                None
            }
        };

        if let Some((from, to)) = begun {
            self.crossfade_announced.store(true, Ordering::Relaxed);
            self.state
                .set_playback_state(PlaybackState::Transitioning)
                .await;
            self.state.broadcast_event(PlayerEvent::TransitionStarted {
                from_path: from.display().to_string(),
                to_path: to.display().to_string(),
                kind: TransitionKind::Crossfade,
                timestamp: chrono::Utc::now(),
            });
        }
    }

    /// Start playback: resume from pause, or start the queue's current
    /// track, optionally from its saved position.
    pub async fn play(&self) -> Result<()> {
        info!("Play command received");
        let state = self.state.get_playback_state().await;
        match state {
            PlaybackState::Playing | PlaybackState::Transitioning => Ok(()),
            PlaybackState::Paused => {
                self.audio_expected.store(true, Ordering::Relaxed);
                let resumed_state = {
                    let mut mixer = self.mixer.write().await;
                    mixer.resume(RESUME_FADE_FRAMES);
                    if mixer.is_crossfading() {
                        PlaybackState::Transitioning
                    } else {
                        PlaybackState::Playing
                    }
                };
                self.state.set_playback_state(resumed_state).await;
                Ok(())
            }
            PlaybackState::Idle | PlaybackState::Stopped { .. } => {
                let track = {
                    let mut queue = self.queue.write().await;
                    let queue = queue.as_mut().ok_or_else(|| {
                        Error::InvalidState("No folder activated".to_string())
                    })?;
                    match queue.current() {
                        Some(track) => Some(track),
                        None => queue.advance(),
                    }
                };
                let Some(track) = track else {
                    return Err(Error::InvalidState("Queue is empty".to_string()));
                };

                let start_ms = if self.auto_resume {
                    self.resume_position(&track).await
                } else {
                    0
                };
                self.start_track(&track, start_ms).await
            }
        }
    }

    /// Pause playback, persisting the current position.
    pub async fn pause(&self) -> Result<()> {
        info!("Pause command received");
        let state = self.state.get_playback_state().await;
        match state {
            PlaybackState::Playing | PlaybackState::Transitioning => {
                self.mixer.write().await.pause();
                self.audio_expected.store(false, Ordering::Relaxed);
                self.flush_position().await;
                self.state.set_playback_state(PlaybackState::Paused).await;
                Ok(())
            }
            PlaybackState::Paused => Ok(()),
            other => Err(Error::InvalidState(format!(
                "Cannot pause while {:?}",
                other
            ))),
        }
    }

    /// Stop playback and unload the current track, keeping its resume
    /// position.
    pub async fn stop(&self) -> Result<()> {
        info!("Stop command received");
        let state = self.state.get_playback_state().await;
        if state.is_terminal() {
            return Err(Error::InvalidState("Player is stopped".to_string()));
        }
        if state == PlaybackState::Idle {
            return Ok(());
        }

        self.crossfade_announced.store(false, Ordering::Relaxed);
        self.audio_expected.store(false, Ordering::Relaxed);
        let departed = self.mixer.write().await.stop();
        if let Some(done) = departed {
            self.persist_position(&done.track.path, done.position_ms).await;
            self.state.broadcast_event(PlayerEvent::TrackFinished {
                path: done.track.path.display().to_string(),
                completed: false,
                timestamp: chrono::Utc::now(),
            });
        }
        self.state.set_current_track(None).await;
        self.state.set_playback_state(PlaybackState::Idle).await;
        Ok(())
    }

    /// Skip to the next track in play order.
    pub async fn next(&self) -> Result<()> {
        info!("Next command received");
        if self.state.get_playback_state().await.is_terminal() {
            return Err(Error::InvalidState("Player is stopped".to_string()));
        }
        let track = {
            let mut queue = self.queue.write().await;
            let queue = queue
                .as_mut()
                .ok_or_else(|| Error::InvalidState("No folder activated".to_string()))?;
            queue.advance()
        };
        match track {
            Some(track) => self.start_track(&track, 0).await,
            None => {
                debug!("Next at end of queue, nothing to do");
                Ok(())
            }
        }
    }

    /// Step back through recently played tracks, or restart the
    /// current one when there is no history to walk into.
    pub async fn previous(&self) -> Result<()> {
        info!("Previous command received");
        if self.state.get_playback_state().await.is_terminal() {
            return Err(Error::InvalidState("Player is stopped".to_string()));
        }
        let track = {
            let mut queue = self.queue.write().await;
            let queue = queue
                .as_mut()
                .ok_or_else(|| Error::InvalidState("No folder activated".to_string()))?;
            queue.retreat()
        };
        match track {
            Some(track) => self.start_track(&track, 0).await,
            None => {
                if self.mixer.read().await.current_track().is_some() {
                    self.seek(0).await
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Seek within the current track. Positions past the end clamp to
    /// the duration, which plays the track out.
    pub async fn seek(&self, position_ms: u64) -> Result<()> {
        let state = self.state.get_playback_state().await;
        if !matches!(
            state,
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Transitioning
        ) {
            return Err(Error::InvalidState(format!(
                "Cannot seek while {:?}",
                state
            )));
        }

        if state == PlaybackState::Transitioning {
            // Settle the handoff first so the seek applies to the
            // track that is about to be current.
            self.mixer.write().await.finish_transition();
            self.drain_mixer_signals().await;
            if self.state.get_playback_state().await.is_terminal() {
                return Err(Error::InvalidState(
                    "Playback stopped before the seek could apply".to_string(),
                ));
            }
        }

        let Some(track) = self.mixer.read().await.current_track() else {
            return Err(Error::InvalidState("No track is loaded".to_string()));
        };

        let clamped = if track.duration_ms > 0 {
            position_ms.min(track.duration_ms)
        } else {
            position_ms
        };

        match self.open_ready_stream(&track, clamped).await {
            Ok(stream) => {
                {
                    let mut mixer = self.mixer.write().await;
                    // The departed stream is the same track at the old
                    // position; a seek emits no track-change events.
                    let _ = mixer.start(stream);
                }
                self.persist_position(&track.path, clamped).await;
                self.state.set_position_ms(clamped).await;
                self.state.broadcast_event(PlayerEvent::PositionChanged {
                    path: track.path.display().to_string(),
                    position_ms: clamped,
                    duration_ms: track.duration_ms,
                    timestamp: chrono::Utc::now(),
                });
                debug!("Seeked to {}ms in {}", clamped, track.path.display());
                Ok(())
            }
            Err(e) => {
                self.state.broadcast_event(PlayerEvent::TrackFailed {
                    path: track.path.display().to_string(),
                    error: e.to_string(),
                    fatal: true,
                    timestamp: chrono::Utc::now(),
                });
                self.enter_stopped(&format!("Seek failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Jump to a track by its library index position.
    pub async fn select(&self, position: usize) -> Result<()> {
        info!("Select command received: position {}", position);
        if self.state.get_playback_state().await.is_terminal() {
            return Err(Error::InvalidState("Player is stopped".to_string()));
        }
        let track = {
            let mut queue = self.queue.write().await;
            let queue = queue
                .as_mut()
                .ok_or_else(|| Error::InvalidState("No folder activated".to_string()))?;
            queue.select(position)
        };
        let Some(track) = track else {
            return Err(Error::Playback(format!(
                "No track at library position {}",
                position
            )));
        };
        self.start_track(&track, 0).await
    }

    /// Set master volume (clamped to [0.0, 1.0]) and persist it.
    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.guard_not_terminal().await?;
        let clamped = volume.clamp(0.0, 1.0);
        *self.volume.lock().unwrap() = clamped;
        self.state.set_volume(clamped).await;
        if let Err(e) = settings::set_volume(&self.db, clamped).await {
            warn!("Failed to persist volume: {}", e);
        }
        self.state.broadcast_event(PlayerEvent::VolumeChanged {
            volume: clamped,
            muted: self.muted.load(Ordering::Relaxed),
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Toggle mute. The stored volume is untouched, and mute does not
    /// survive a restart.
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.guard_not_terminal().await?;
        let muted = !self.muted.load(Ordering::Relaxed);
        self.muted.store(muted, Ordering::Relaxed);
        *self.state.muted.write().await = muted;
        self.state.broadcast_event(PlayerEvent::VolumeChanged {
            volume: self.state.get_volume().await,
            muted,
            timestamp: chrono::Utc::now(),
        });
        info!("Mute {}", if muted { "on" } else { "off" });
        Ok(muted)
    }

    /// Enable or disable shuffle. The current track keeps playing.
    pub async fn set_shuffle(&self, shuffle: bool) -> Result<()> {
        self.guard_not_terminal().await?;
        {
            let mut queue = self.queue.write().await;
            if let Some(queue) = queue.as_mut() {
                queue.set_shuffle(shuffle);
            }
        }
        // The staged next stream may no longer match the new order.
        self.mixer.write().await.clear_pending();
        *self.state.shuffle.write().await = shuffle;
        if let Err(e) = settings::set_shuffle(&self.db, shuffle).await {
            warn!("Failed to persist shuffle: {}", e);
        }
        self.emit_queue_changed().await;
        Ok(())
    }

    /// Set the repeat mode.
    pub async fn set_repeat(&self, repeat: RepeatMode) -> Result<()> {
        self.guard_not_terminal().await?;
        {
            let mut queue = self.queue.write().await;
            if let Some(queue) = queue.as_mut() {
                queue.set_repeat(repeat);
            }
        }
        self.mixer.write().await.clear_pending();
        *self.state.repeat.write().await = repeat;
        if let Err(e) = settings::set_repeat_mode(&self.db, repeat).await {
            warn!("Failed to persist repeat mode: {}", e);
        }
        self.emit_queue_changed().await;
        Ok(())
    }

    /// Deal a fresh shuffle order. No-op outside shuffle mode.
    pub async fn reshuffle(&self) -> Result<()> {
        self.guard_not_terminal().await?;
        {
            let mut queue = self.queue.write().await;
            if let Some(queue) = queue.as_mut() {
                queue.reshuffle();
            }
        }
        self.mixer.write().await.clear_pending();
        self.emit_queue_changed().await;
        Ok(())
    }

    /// Set the crossfade duration. Zero disables overlapping; handoffs
    /// become gapless joins.
    pub async fn set_crossfade_ms(&self, crossfade_ms: u64) -> Result<()> {
        self.guard_not_terminal().await?;
        let clamped = crossfade_ms.min(settings::MAX_CROSSFADE_MS);
        *self.state.crossfade_ms.write().await = clamped;
        if let Err(e) = settings::set_crossfade_ms(&self.db, clamped).await {
            warn!("Failed to persist crossfade duration: {}", e);
        }
        self.state.broadcast_event(PlayerEvent::CrossfadeChanged {
            crossfade_ms: clamped,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Switch equalizer presets. Applies to audio already in flight.
    pub async fn set_eq_preset(&self, preset: EqPreset) -> Result<()> {
        self.guard_not_terminal().await?;
        self.mixer.write().await.set_eq_preset(preset)?;
        *self.state.eq_preset.write().await = preset;
        if let Err(e) = settings::set_eq_preset(&self.db, preset).await {
            warn!("Failed to persist equalizer preset: {}", e);
        }
        self.state.broadcast_event(PlayerEvent::EqPresetChanged {
            preset,
            timestamp: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Enable or disable ReplayGain normalization for streams opened
    /// from now on.
    pub async fn set_normalize(&self, normalize: bool) -> Result<()> {
        self.guard_not_terminal().await?;
        *self.state.normalize.write().await = normalize;
        if let Err(e) = settings::set_normalize(&self.db, normalize).await {
            warn!("Failed to persist normalization: {}", e);
        }
        Ok(())
    }

    /// Activate a music folder: scan it (served from cache when
    /// unchanged), bind the queue to the new index, and restore the
    /// last played track as the cursor.
    ///
    /// Activating a different folder unloads current playback first.
    /// Activating from Stopped recovers the player to Idle.
    pub async fn activate_folder(&self, root: &Path) -> Result<Arc<LibraryIndex>> {
        info!("Activating folder {}", root.display());
        self.state.broadcast_event(PlayerEvent::ScanStarted {
            root: root.display().to_string(),
            timestamp: chrono::Utc::now(),
        });

        let previous = self.library.current().await;
        let index = self.library.activate(root).await.map_err(Error::Library)?;
        let from_cache = previous
            .as_ref()
            .map(|p| Arc::ptr_eq(p, &index))
            .unwrap_or(false);

        for warning in &index.warnings {
            self.state.broadcast_event(PlayerEvent::ScanWarning {
                path: warning.path.display().to_string(),
                reason: warning.reason.clone(),
                timestamp: chrono::Utc::now(),
            });
        }
        self.state.broadcast_event(PlayerEvent::ScanCompleted {
            root: index.root.display().to_string(),
            track_count: index.len(),
            warning_count: index.warnings.len(),
            from_cache,
            timestamp: chrono::Utc::now(),
        });

        let same_root =
            self.state.folder.read().await.as_deref() == Some(index.root.as_path());

        if !same_root {
            self.crossfade_announced.store(false, Ordering::Relaxed);
            self.audio_expected.store(false, Ordering::Relaxed);
            let departed = self.mixer.write().await.stop();
            if let Some(done) = departed {
                self.persist_position(&done.track.path, done.position_ms).await;
                self.state.broadcast_event(PlayerEvent::TrackFinished {
                    path: done.track.path.display().to_string(),
                    completed: false,
                    timestamp: chrono::Utc::now(),
                });
            }
            self.state.set_current_track(None).await;
        }

        {
            let mut queue = self.queue.write().await;
            match queue.as_mut() {
                Some(existing) if same_root => existing.rebind(Arc::clone(&index)),
                _ => {
                    let shuffle = *self.state.shuffle.read().await;
                    let repeat = *self.state.repeat.read().await;
                    *queue = Some(TrackQueue::new(Arc::clone(&index), shuffle, repeat));
                }
            }
        }
        if same_root {
            // The staged prefetch may point at a file the rescan
            // dropped.
            self.mixer.write().await.clear_pending();
        }

        match self.store.load_last_track(&index.root).await {
            Ok(Some(last)) => {
                if let Some(position) = index.position_of(&last) {
                    let mut queue = self.queue.write().await;
                    if let Some(queue) = queue.as_mut() {
                        queue.select(position);
                        debug!("Restored last track: {}", last.display());
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load last track: {}", e),
        }

        *self.state.folder.write().await = Some(index.root.clone());
        *self.state.track_count.write().await = index.len();

        if let Err(e) =
            settings::set_last_folder(&self.db, &index.root.display().to_string()).await
        {
            warn!("Failed to persist last folder: {}", e);
        }
        if let Err(e) = self.store.touch_recent_folder(&index.root).await {
            warn!("Failed to record recent folder: {}", e);
        }

        self.emit_queue_changed().await;

        let state = self.state.get_playback_state().await;
        if state.is_terminal() || (!same_root && state != PlaybackState::Idle) {
            self.state.set_playback_state(PlaybackState::Idle).await;
        }

        Ok(index)
    }

    /// Rescan the active folder and rebind the queue to the fresh
    /// index. Playback continues undisturbed.
    pub async fn refresh_folder(&self) -> Result<Arc<LibraryIndex>> {
        let root = self
            .state
            .folder
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("No folder activated".to_string()))?;

        info!("Refreshing folder {}", root.display());
        self.state.broadcast_event(PlayerEvent::ScanStarted {
            root: root.display().to_string(),
            timestamp: chrono::Utc::now(),
        });

        let index = self.library.refresh(&root).await.map_err(Error::Library)?;

        for warning in &index.warnings {
            self.state.broadcast_event(PlayerEvent::ScanWarning {
                path: warning.path.display().to_string(),
                reason: warning.reason.clone(),
                timestamp: chrono::Utc::now(),
            });
        }
        self.state.broadcast_event(PlayerEvent::ScanCompleted {
            root: index.root.display().to_string(),
            track_count: index.len(),
            warning_count: index.warnings.len(),
            from_cache: false,
            timestamp: chrono::Utc::now(),
        });

        {
            let mut queue = self.queue.write().await;
            match queue.as_mut() {
                Some(queue) => queue.rebind(Arc::clone(&index)),
                None => {
                    let shuffle = *self.state.shuffle.read().await;
                    let repeat = *self.state.repeat.read().await;
                    *queue = Some(TrackQueue::new(Arc::clone(&index), shuffle, repeat));
                }
            }
        }
        self.mixer.write().await.clear_pending();
        *self.state.track_count.write().await = index.len();
        self.emit_queue_changed().await;

        Ok(index)
    }

    /// Recently activated folders, pinned entries first.
    pub async fn recent_folders(&self) -> Result<Vec<RecentFolder>> {
        self.store.recent_folders().await
    }

    /// Pin or unpin a folder in the recent list.
    pub async fn pin_folder(&self, folder: &Path, pinned: bool) -> Result<()> {
        self.store.set_folder_pinned(folder, pinned).await
    }

    pub async fn snapshot(&self) -> PlayerSnapshot {
        self.state.snapshot().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PlayerEvent> {
        self.state.subscribe_events()
    }

    /// Flush persistence and wind the background tasks down.
    pub async fn shutdown(&self) {
        info!("Shutting down playback engine");
        self.flush_position().await;
        self.audio_expected.store(false, Ordering::Relaxed);
        self.mixer.write().await.stop();
        *self.running.write().await = false;
    }

    /// Hard-switch playback to `track` at `start_ms`.
    async fn start_track(&self, track: &Arc<Track>, start_ms: u64) -> Result<()> {
        self.crossfade_announced.store(false, Ordering::Relaxed);
        match self.open_ready_stream(track, start_ms).await {
            Ok(stream) => {
                let departed = {
                    let mut mixer = self.mixer.write().await;
                    let departed = mixer.start(stream);
                    if mixer.is_paused() {
                        mixer.resume(0);
                    }
                    departed
                };
                if let Some(done) = departed {
                    self.persist_position(&done.track.path, done.position_ms).await;
                    self.state.broadcast_event(PlayerEvent::TrackFinished {
                        path: done.track.path.display().to_string(),
                        completed: false,
                        timestamp: chrono::Utc::now(),
                    });
                }
                self.audio_expected.store(true, Ordering::Relaxed);
                self.set_now_playing(track, start_ms).await;
                self.state.set_playback_state(PlaybackState::Playing).await;
                Ok(())
            }
            Err(e) => {
                self.state.broadcast_event(PlayerEvent::TrackFailed {
                    path: track.path.display().to_string(),
                    error: e.to_string(),
                    fatal: true,
                    timestamp: chrono::Utc::now(),
                });
                self.enter_stopped(&format!("Decode failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Spawn a decode stream and wait until it has audio to give.
    async fn open_ready_stream(&self, track: &Arc<Track>, start_ms: u64) -> Result<DecodeStream> {
        let gain = self.stream_gain(track).await;
        let stream = DecodeStream::spawn(Arc::clone(track), start_ms, gain);
        match tokio::time::timeout(STREAM_READY_TIMEOUT, stream.wait_ready()).await {
            Ok(()) => {}
            Err(_) => {
                stream.cancel();
                return Err(Error::Decode(format!(
                    "Timed out waiting for {} to buffer",
                    track.path.display()
                )));
            }
        }
        if let Some(decode_error) = stream.error() {
            return Err(Error::Decode(decode_error));
        }
        Ok(stream)
    }

    async fn stream_gain(&self, track: &Track) -> f32 {
        if *self.state.normalize.read().await {
            track.replay_gain_factor()
        } else {
            1.0
        }
    }

    /// Saved resume position for a track, clamped into its duration.
    async fn resume_position(&self, track: &Track) -> u64 {
        match self.store.load_position(&track.path).await {
            Ok(Some(position)) if track.duration_ms == 0 || position < track.duration_ms => {
                debug!(
                    "Resuming {} at {}ms",
                    track.path.display(),
                    position
                );
                position
            }
            Ok(_) => 0,
            Err(e) => {
                warn!("Failed to load saved position: {}", e);
                0
            }
        }
    }

    /// Record a new current track: shared state, events, last-track
    /// persistence.
    async fn set_now_playing(&self, track: &Arc<Track>, position_ms: u64) {
        *self.prefetch_failed.lock().unwrap() = None;
        self.state
            .set_current_track(Some(CurrentTrack {
                path: track.path.clone(),
                title: track.title.clone(),
                artist: track.artist.clone(),
                album: track.album.clone(),
                position_ms,
                duration_ms: track.duration_ms,
            }))
            .await;
        self.state.broadcast_event(PlayerEvent::TrackStarted {
            path: track.path.display().to_string(),
            title: track.title.clone(),
            artist: track.artist.clone(),
            duration_ms: track.duration_ms,
            timestamp: chrono::Utc::now(),
        });
        let folder = self.state.folder.read().await.clone();
        if let Some(folder) = folder {
            if let Err(e) = self.store.save_last_track(&folder, &track.path).await {
                warn!("Failed to persist last track: {}", e);
            }
        }
        info!("Now playing: {} - {}", track.artist, track.title);
    }

    async fn persist_position(&self, path: &Path, position_ms: u64) {
        if let Err(e) = self.store.save_position(path, position_ms).await {
            warn!("Failed to persist playback position: {}", e);
        }
    }

    /// Persist the live position right now (pause/stop/shutdown edges).
    async fn flush_position(&self) {
        let position = {
            let mixer = self.mixer.read().await;
            mixer
                .current_track()
                .map(|t| (t.path.clone(), mixer.position_ms().unwrap_or(0)))
        };
        if let Some((path, position_ms)) = position {
            self.persist_position(&path, position_ms).await;
        }
    }

    /// Unload playback and enter the terminal error state.
    async fn enter_stopped(&self, reason: &str) {
        error!("Stopping playback: {}", reason);
        self.audio_expected.store(false, Ordering::Relaxed);
        self.crossfade_announced.store(false, Ordering::Relaxed);
        let departed = self.mixer.write().await.stop();
        if let Some(done) = departed {
            self.persist_position(&done.track.path, done.position_ms).await;
            self.state.broadcast_event(PlayerEvent::TrackFinished {
                path: done.track.path.display().to_string(),
                completed: false,
                timestamp: chrono::Utc::now(),
            });
        }
        self.state
            .set_playback_state(PlaybackState::Stopped {
                error: Some(reason.to_string()),
            })
            .await;
    }

    async fn guard_not_terminal(&self) -> Result<()> {
        if self.state.get_playback_state().await.is_terminal() {
            return Err(Error::InvalidState(
                "Player is stopped; play or activate a folder to recover".to_string(),
            ));
        }
        Ok(())
    }

    async fn emit_queue_changed(&self) {
        let queue_info = {
            let queue = self.queue.read().await;
            queue
                .as_ref()
                .map(|q| (q.len(), q.shuffle_enabled(), q.repeat_mode()))
        };
        let (track_count, shuffle, repeat) = match queue_info {
            Some(info) => info,
            None => (
                0,
                *self.state.shuffle.read().await,
                *self.state.repeat.read().await,
            ),
        };
        self.state.broadcast_event(PlayerEvent::QueueChanged {
            track_count,
            shuffle,
            repeat,
            timestamp: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_database;
    use std::fs;
    use tempfile::TempDir;

    async fn engine_fixture() -> (PlaybackEngine, TempDir, SqlitePool, Arc<SharedState>) {
        let dir = TempDir::new().unwrap();
        let db = open_database(&dir.path().join("player.db")).await.unwrap();
        let state = Arc::new(SharedState::new());
        let library = Arc::new(Library::new());
        let engine = PlaybackEngine::new(db.clone(), Arc::clone(&state), library, None)
            .await
            .unwrap();
        (engine, dir, db, state)
    }

    fn write_wav(path: &Path, amplitude: f32, seconds: f32) {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        let frames = (44_100.0 * seconds) as u32;
        let sample = (amplitude * i16::MAX as f32) as i16;
        for _ in 0..frames {
            writer.write_sample(sample).unwrap();
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn make_folder(dir: &TempDir, tracks: &[(&str, f32)]) -> PathBuf {
        let music = dir.path().join("music");
        fs::create_dir(&music).unwrap();
        for (name, seconds) in tracks {
            write_wav(&music.join(name), 0.4, *seconds);
        }
        music
    }

    /// Pop 441 frames per 10ms tick, matching real-time consumption at
    /// 44.1kHz, so wall-clock sleeps line up with playback progress.
    fn spawn_drainer(mut consumer: PlayoutConsumer) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(10));
            loop {
                tick.tick().await;
                for _ in 0..441 {
                    if consumer.pop().is_none() {
                        break;
                    }
                }
            }
        })
    }

    fn drain_events(rx: &mut broadcast::Receiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn wait_for_state(state: &SharedState, want: PlaybackState, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        while Instant::now() < deadline {
            if state.get_playback_state().await == want {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn activate_builds_queue_and_seeds_state() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 0.3), ("b.wav", 0.3)]);
        let mut events = state.subscribe_events();

        let index = engine.activate_folder(&music).await.unwrap();
        assert_eq!(index.len(), 2);

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.track_count, 2);
        assert_eq!(snapshot.folder, Some(index.root.clone()));
        assert_eq!(snapshot.state, PlaybackState::Idle);

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::ScanCompleted {
                track_count: 2,
                from_cache: false,
                ..
            }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::QueueChanged { track_count: 2, .. })));
    }

    #[tokio::test]
    async fn play_without_folder_or_tracks_is_rejected() {
        let (engine, dir, _db, _state) = engine_fixture().await;
        assert!(matches!(engine.play().await, Err(Error::InvalidState(_))));

        let music = dir.path().join("empty");
        fs::create_dir(&music).unwrap();
        engine.activate_folder(&music).await.unwrap();
        assert!(matches!(engine.play().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn play_walks_the_queue_and_emits_lifecycle_events() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 0.3), ("b.wav", 0.3)]);
        engine.set_crossfade_ms(0).await.unwrap();
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);
        let mut events = state.subscribe_events();

        engine.play().await.unwrap();
        assert_eq!(state.get_playback_state().await, PlaybackState::Playing);

        // a plays out, b joins gaplessly, then the queue exhausts.
        assert!(wait_for_state(&state, PlaybackState::Idle, 3_000).await);

        let events = drain_events(&mut events);
        let started: Vec<&String> = events
            .iter()
            .filter_map(|e| match e {
                PlayerEvent::TrackStarted { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(started.len(), 2);
        assert!(started[0].ends_with("a.wav"));
        assert!(started[1].ends_with("b.wav"));

        let completed = events
            .iter()
            .filter(|e| matches!(e, PlayerEvent::TrackFinished { completed: true, .. }))
            .count();
        assert_eq!(completed, 2);

        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::TransitionStarted {
                kind: TransitionKind::Gapless,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn pause_freezes_position_and_resume_continues() {
        let (engine, dir, db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 2.0)]);
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        engine.pause().await.unwrap();
        assert_eq!(state.get_playback_state().await, PlaybackState::Paused);
        let current = state.get_current_track().await.unwrap();
        let paused_at = current.position_ms;

        // Pause persists the position immediately.
        let store = PositionStore::new(db.clone());
        let saved = store.load_position(&current.path).await.unwrap().unwrap();
        assert!(saved > 0 && saved < 2_000);

        // Nothing moves while paused.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let frozen = state.get_current_track().await.unwrap().position_ms;
        assert_eq!(frozen, paused_at);

        engine.play().await.unwrap();
        assert_eq!(state.get_playback_state().await, PlaybackState::Playing);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let moved = state.get_current_track().await.unwrap().position_ms;
        assert!(moved > paused_at);
    }

    #[tokio::test]
    async fn seek_clamps_to_duration() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 1.0)]);
        engine.set_crossfade_ms(0).await.unwrap();
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        engine.seek(500).await.unwrap();
        let position = state.get_current_track().await.unwrap().position_ms;
        assert!(position >= 500 && position < 1_000, "position {}", position);

        // Past the end clamps to the duration, which plays the track
        // out.
        let mut events = state.subscribe_events();
        engine.seek(60_000).await.unwrap();
        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::PositionChanged {
                position_ms,
                duration_ms,
                ..
            } if position_ms == duration_ms
        )));
        assert!(wait_for_state(&state, PlaybackState::Idle, 2_000).await);
    }

    #[tokio::test]
    async fn next_and_previous_hard_switch() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 1.0), ("b.wav", 1.0)]);
        engine.set_crossfade_ms(0).await.unwrap();
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);
        let mut events = state.subscribe_events();

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        engine.next().await.unwrap();
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("b.wav"));
        let events_so_far = drain_events(&mut events);
        assert!(events_so_far.iter().any(|e| matches!(
            e,
            PlayerEvent::TrackFinished {
                completed: false,
                ..
            }
        )));

        tokio::time::sleep(Duration::from_millis(150)).await;
        engine.previous().await.unwrap();
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("a.wav"));
        assert!(current.position_ms < 500);
    }

    #[tokio::test]
    async fn natural_completion_clears_saved_position() {
        let (engine, dir, db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 1.0), ("b.wav", 1.0)]);
        engine.set_crossfade_ms(0).await.unwrap();
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Force a position flush partway through a.
        engine.pause().await.unwrap();
        let track_a = state.get_current_track().await.unwrap().path;
        let store = PositionStore::new(db.clone());
        assert!(store.load_position(&track_a).await.unwrap().is_some());
        engine.play().await.unwrap();

        // Let a finish naturally and b take over.
        tokio::time::sleep(Duration::from_millis(1_200)).await;
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("b.wav"));
        assert!(store.load_position(&track_a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_keeps_resume_position_and_play_resumes() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 2.0)]);
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        engine.stop().await.unwrap();
        assert_eq!(state.get_playback_state().await, PlaybackState::Idle);
        assert!(state.get_current_track().await.is_none());

        engine.play().await.unwrap();
        let resumed = state.get_current_track().await.unwrap().position_ms;
        assert!(resumed >= 100, "expected a resumed position, got {}", resumed);
    }

    #[tokio::test]
    async fn failed_current_track_stops_with_error() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 2.0)]);
        let index = engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);
        let mut events = state.subscribe_events();

        // Break the file after the index was built so the decode open
        // fails.
        fs::write(&index.tracks[0].path, b"no longer a wav").unwrap();

        assert!(matches!(engine.play().await, Err(Error::Decode(_))));
        assert!(matches!(
            state.get_playback_state().await,
            PlaybackState::Stopped { error: Some(_) }
        ));
        let events = drain_events(&mut events);
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::TrackFailed { fatal: true, .. })));

        // Terminal state rejects everything but recovery paths.
        assert!(engine.set_volume(0.5).await.is_err());
        assert!(engine.next().await.is_err());
        assert!(engine.pause().await.is_err());
        assert!(engine.stop().await.is_err());
        assert!(engine.seek(0).await.is_err());

        // Re-activating the folder recovers to Idle.
        engine.activate_folder(&music).await.unwrap();
        assert_eq!(state.get_playback_state().await, PlaybackState::Idle);
    }

    #[tokio::test]
    async fn crossfade_enters_transitioning_then_settles() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 1.2), ("b.wav", 1.2)]);
        engine.activate_folder(&music).await.unwrap();
        engine.set_crossfade_ms(400).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);
        let mut events = state.subscribe_events();

        engine.play().await.unwrap();

        assert!(
            wait_for_state(&state, PlaybackState::Transitioning, 3_000).await,
            "crossfade never started"
        );
        assert!(wait_for_state(&state, PlaybackState::Playing, 3_000).await);
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("b.wav"));

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::TransitionStarted {
                kind: TransitionKind::Crossfade,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn repeat_one_restarts_the_same_track() {
        let (engine, dir, _db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 0.4), ("b.wav", 0.4)]);
        engine.activate_folder(&music).await.unwrap();
        engine.set_repeat(RepeatMode::One).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);
        let mut events = state.subscribe_events();

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(state.get_playback_state().await, PlaybackState::Playing);
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("a.wav"));

        let events = drain_events(&mut events);
        let restarts = events
            .iter()
            .filter(|e| matches!(e, PlayerEvent::TrackStarted { path, .. } if path.ends_with("a.wav")))
            .count();
        assert!(restarts >= 2, "expected repeated starts, got {}", restarts);
        assert!(!events
            .iter()
            .any(|e| matches!(e, PlayerEvent::TrackStarted { path, .. } if path.ends_with("b.wav"))));
        // Repeat-one never overlaps a track with itself.
        assert!(!events.iter().any(|e| matches!(
            e,
            PlayerEvent::TransitionStarted {
                kind: TransitionKind::Crossfade,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn volume_and_mute_reach_state_and_database() {
        let (engine, _dir, db, state) = engine_fixture().await;
        let mut events = state.subscribe_events();

        engine.set_volume(0.3).await.unwrap();
        assert!((state.get_volume().await - 0.3).abs() < f32::EPSILON);
        assert!((settings::get_volume(&db).await.unwrap() - 0.3).abs() < f32::EPSILON);

        engine.set_volume(1.7).await.unwrap();
        assert!((state.get_volume().await - 1.0).abs() < f32::EPSILON);

        assert!(engine.toggle_mute().await.unwrap());
        let snapshot = state.snapshot().await;
        assert!(snapshot.muted);
        // Mute leaves the stored volume alone.
        assert!((snapshot.volume - 1.0).abs() < f32::EPSILON);
        assert!(!engine.toggle_mute().await.unwrap());

        let events = drain_events(&mut events);
        let volume_events = events
            .iter()
            .filter(|e| matches!(e, PlayerEvent::VolumeChanged { .. }))
            .count();
        assert_eq!(volume_events, 4);
    }

    #[tokio::test]
    async fn queue_policy_setters_persist_and_announce() {
        let (engine, dir, db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 0.3), ("b.wav", 0.3), ("c.wav", 0.3)]);
        engine.activate_folder(&music).await.unwrap();
        let mut events = state.subscribe_events();

        engine.set_shuffle(true).await.unwrap();
        assert!(state.snapshot().await.shuffle);
        assert!(settings::get_shuffle(&db).await.unwrap());

        engine.set_repeat(RepeatMode::All).await.unwrap();
        assert_eq!(
            settings::get_repeat_mode(&db).await.unwrap(),
            RepeatMode::All
        );

        engine.set_crossfade_ms(25_000).await.unwrap();
        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.crossfade_ms, settings::MAX_CROSSFADE_MS);
        assert_eq!(
            settings::get_crossfade_ms(&db).await.unwrap(),
            settings::MAX_CROSSFADE_MS
        );

        engine.set_eq_preset(EqPreset::BassBoost).await.unwrap();
        assert_eq!(state.snapshot().await.eq_preset, EqPreset::BassBoost);

        let events = drain_events(&mut events);
        assert!(events.iter().any(|e| matches!(
            e,
            PlayerEvent::QueueChanged { shuffle: true, repeat: RepeatMode::All, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::CrossfadeChanged { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, PlayerEvent::EqPresetChanged { .. })));
    }

    #[tokio::test]
    async fn device_error_stops_playback_and_persists_position() {
        let (engine, dir, db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 2.0)]);
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let track = state.get_current_track().await.unwrap().path;

        // What the audio thread does when the stream dies.
        engine.device_error.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if state.get_playback_state().await.is_terminal() {
                break;
            }
            assert!(Instant::now() < deadline, "device error never stopped playback");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        match state.get_playback_state().await {
            PlaybackState::Stopped { error: Some(message) } => {
                assert!(message.contains("device"), "message: {}", message);
            }
            other => panic!("unexpected state: {:?}", other),
        }

        let store = PositionStore::new(db.clone());
        assert!(store.load_position(&track).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn shutdown_flushes_position() {
        let (engine, dir, db, state) = engine_fixture().await;
        let music = make_folder(&dir, &[("a.wav", 2.0)]);
        engine.activate_folder(&music).await.unwrap();
        let consumer = engine.start_pipeline().await.unwrap();
        let _drainer = spawn_drainer(consumer);

        engine.play().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let track = state.get_current_track().await.unwrap().path;

        engine.shutdown().await;

        let store = PositionStore::new(db.clone());
        let saved = store.load_position(&track).await.unwrap().unwrap();
        assert!(saved > 0);
    }

    #[tokio::test]
    async fn resume_survives_engine_restart() {
        let dir = TempDir::new().unwrap();
        let music = make_folder(&dir, &[("a.wav", 2.0), ("b.wav", 2.0)]);
        let db_path = dir.path().join("player.db");

        let saved = {
            let db = open_database(&db_path).await.unwrap();
            let state = Arc::new(SharedState::new());
            let engine = PlaybackEngine::new(
                db.clone(),
                Arc::clone(&state),
                Arc::new(Library::new()),
                None,
            )
            .await
            .unwrap();
            engine.set_crossfade_ms(0).await.unwrap();
            engine.activate_folder(&music).await.unwrap();
            let consumer = engine.start_pipeline().await.unwrap();
            let _drainer = spawn_drainer(consumer);

            engine.play().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            engine.pause().await.unwrap();
            engine.shutdown().await;

            let track = state.get_current_track().await.unwrap().path;
            assert!(track.ends_with("a.wav"));
            let store = PositionStore::new(db);
            store.load_position(&track).await.unwrap().unwrap()
        };
        assert!(saved > 0 && saved < 2_000);

        // Fresh engine on the same database: the folder reopens on the
        // same track at the persisted position. The pipeline stays down
        // so the position cannot move between play and the read.
        let db = open_database(&db_path).await.unwrap();
        let state = Arc::new(SharedState::new());
        let engine = PlaybackEngine::new(
            db,
            Arc::clone(&state),
            Arc::new(Library::new()),
            None,
        )
        .await
        .unwrap();
        engine.activate_folder(&music).await.unwrap();

        engine.play().await.unwrap();
        let current = state.get_current_track().await.unwrap();
        assert!(current.path.ends_with("a.wav"));
        assert_eq!(current.position_ms, saved);
    }
}
