//! Per-track decode streams
//!
//! Every track being played or prefetched gets a dedicated decode
//! thread: open, seek, decode, resample to 44.1kHz, apply ReplayGain,
//! push into an SPSC ring. The mixer pops frames on the other side.
//!
//! The thread parks briefly when the ring is full and checks the cancel
//! flag at every chunk boundary, so teardown is prompt without joining.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ringbuf::{traits::*, HeapRb};
use tokio::sync::watch;
use tracing::{debug, warn};

use attacca_common::Track;

use crate::audio::decode::AudioDecoder;
use crate::audio::resampler::StreamResampler;
use crate::audio::types::{AudioFrame, STANDARD_SAMPLE_RATE};

/// Per-stream ring capacity (~5s at 44.1kHz)
pub const STREAM_BUFFER_FRAMES: usize = 5 * STANDARD_SAMPLE_RATE as usize;

/// Buffered frames required before a stream reports ready (~250ms)
const READY_MIN_FRAMES: usize = STANDARD_SAMPLE_RATE as usize / 4;

/// Producer park time when the ring is full
const BACKPRESSURE_SLEEP: Duration = Duration::from_millis(5);

/// State shared between a decode thread and its `DecodeStream`
struct StreamShared {
    /// Settled: enough frames buffered, EOF reached, or failed
    ready: AtomicBool,
    /// Decode thread has pushed its last frame and exited
    finished: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<String>>,
    ready_tx: watch::Sender<bool>,
}

impl StreamShared {
    fn mark_ready(&self) {
        if !self.ready.swap(true, Ordering::AcqRel) {
            let _ = self.ready_tx.send(true);
        }
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
        // A stream that ends before reaching the ready threshold (very
        // short track, or a failure) still has to settle any waiter
        self.mark_ready();
    }

    fn fail(&self, message: String) {
        *self.error.lock().unwrap() = Some(message);
        self.mark_finished();
    }
}

/// Handle to one decoding track: the mixer-side consumer plus thread
/// state
pub struct DecodeStream {
    track: Arc<Track>,
    start_ms: u64,
    shared: Arc<StreamShared>,
    /// Direct (non-caching) consumer: the caching wrapper is `!Sync`,
    /// and this handle lives inside the shared `FrameMixer`
    consumer: ringbuf::Cons<Arc<ringbuf::HeapRb<AudioFrame>>>,
    ready_rx: watch::Receiver<bool>,
    frames_popped: u64,
}

impl DecodeStream {
    /// Spawn a decode thread for `track` starting at `start_ms`.
    /// `gain` is the linear ReplayGain factor (1.0 = untouched).
    pub fn spawn(track: Arc<Track>, start_ms: u64, gain: f32) -> Self {
        Self::spawn_with_buffer(track, start_ms, gain, STREAM_BUFFER_FRAMES)
    }

    /// As `spawn`, with an explicit ring capacity
    pub fn spawn_with_buffer(
        track: Arc<Track>,
        start_ms: u64,
        gain: f32,
        buffer_frames: usize,
    ) -> Self {
        let rb = Arc::new(HeapRb::<AudioFrame>::new(buffer_frames));
        let producer = ringbuf::CachingProd::new(Arc::clone(&rb));
        let consumer = ringbuf::Cons::new(rb);
        let (ready_tx, ready_rx) = watch::channel(false);

        let shared = Arc::new(StreamShared {
            ready: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            ready_tx,
        });

        // A ring smaller than the nominal threshold must still become
        // ready, or short buffers would never settle
        let ready_threshold = READY_MIN_FRAMES.min(buffer_frames / 2).max(1);

        let thread_shared = Arc::clone(&shared);
        let thread_track = Arc::clone(&track);
        let name = track
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "track".to_string());

        let spawn_result = std::thread::Builder::new()
            .name(format!("decode-{}", name))
            .spawn(move || {
                run_decode(
                    thread_track,
                    start_ms,
                    gain,
                    ready_threshold,
                    producer,
                    thread_shared,
                );
            });

        if let Err(e) = spawn_result {
            shared.fail(format!("Failed to spawn decode thread: {}", e));
        }

        Self {
            track,
            start_ms,
            shared,
            consumer,
            ready_rx,
            frames_popped: 0,
        }
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    /// Current playback position of this stream, derived from frames
    /// actually consumed by the mixer
    pub fn position_ms(&self) -> u64 {
        self.start_ms + self.frames_popped * 1000 / STANDARD_SAMPLE_RATE as u64
    }

    /// Milliseconds left until the end of the track, by tag duration.
    /// None when the container reported no duration.
    pub fn remaining_ms(&self) -> Option<u64> {
        if self.track.duration_ms == 0 {
            return None;
        }
        Some(self.track.duration_ms.saturating_sub(self.position_ms()))
    }

    /// True once enough frames are buffered to mix from (also set at
    /// EOF and on failure; check `error` after waiting)
    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Wait until the stream settles: ready, finished, or failed
    pub async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    /// True once the decode thread has exited
    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// True when no frame will ever be produced again
    pub fn is_exhausted(&self) -> bool {
        self.is_finished() && self.consumer.is_empty()
    }

    pub fn error(&self) -> Option<String> {
        self.shared.error.lock().unwrap().clone()
    }

    pub fn buffered_frames(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Pop the next frame. None is a stall (decode behind) unless
    /// `is_exhausted` also holds.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        let frame = self.consumer.try_pop();
        if frame.is_some() {
            self.frames_popped += 1;
        }
        frame
    }

    /// Ask the decode thread to stop at the next chunk boundary
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for DecodeStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Decode thread body
fn run_decode(
    track: Arc<Track>,
    start_ms: u64,
    gain: f32,
    ready_threshold: usize,
    mut producer: ringbuf::HeapProd<AudioFrame>,
    shared: Arc<StreamShared>,
) {
    let mut decoder = match AudioDecoder::open(&track.path, start_ms) {
        Ok(d) => d,
        Err(e) => {
            shared.fail(e.to_string());
            return;
        }
    };

    let mut resampler = match StreamResampler::new(decoder.sample_rate()) {
        Ok(r) => r,
        Err(e) => {
            shared.fail(e.to_string());
            return;
        }
    };

    debug!(
        "Decoding {} from {}ms ({}Hz, gain {:.3})",
        track.path.display(),
        start_ms,
        decoder.sample_rate(),
        gain
    );

    // Frames resampled but not yet pushed into the ring
    let mut outbox: VecDeque<AudioFrame> = VecDeque::new();

    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            debug!("Decode cancelled for {}", track.path.display());
            shared.mark_finished();
            return;
        }

        // Drain the outbox first; park when the ring is full
        while let Some(frame) = outbox.front() {
            if producer.try_push(*frame).is_ok() {
                outbox.pop_front();
            } else {
                break;
            }
        }
        if !shared.ready.load(Ordering::Relaxed) && producer.occupied_len() >= ready_threshold {
            shared.mark_ready();
        }
        if !outbox.is_empty() {
            std::thread::sleep(BACKPRESSURE_SLEEP);
            continue;
        }

        match decoder.next_chunk() {
            Ok(Some(frames)) => match resampler.process(&frames) {
                Ok(resampled) => push_gained(&mut outbox, resampled, gain),
                Err(e) => {
                    warn!("Decode stream failed: {}", e);
                    shared.fail(e.to_string());
                    return;
                }
            },
            Ok(None) => {
                match resampler.flush() {
                    Ok(tail) => push_gained(&mut outbox, tail, gain),
                    Err(e) => {
                        shared.fail(e.to_string());
                        return;
                    }
                }
                // Push the tail out before finishing
                while let Some(frame) = outbox.front() {
                    if shared.cancelled.load(Ordering::Acquire) {
                        break;
                    }
                    if producer.try_push(*frame).is_ok() {
                        outbox.pop_front();
                    } else {
                        std::thread::sleep(BACKPRESSURE_SLEEP);
                    }
                }
                debug!("Decode finished for {}", track.path.display());
                shared.mark_finished();
                return;
            }
            Err(e) => {
                warn!("Decode stream failed: {}", e);
                shared.fail(e.to_string());
                return;
            }
        }
    }
}

fn push_gained(outbox: &mut VecDeque<AudioFrame>, frames: Vec<AudioFrame>, gain: f32) {
    if gain == 1.0 {
        outbox.extend(frames);
    } else {
        outbox.extend(frames.into_iter().map(|mut f| {
            f.apply_volume(gain);
            f
        }));
    }
}
