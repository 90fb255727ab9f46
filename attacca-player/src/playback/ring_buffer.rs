//! Lock-free playout ring between the fill loop and the audio callback
//!
//! Single-producer single-consumer: the engine's fill loop pushes mixed
//! frames, the realtime callback pops them. The callback never blocks;
//! an empty buffer reads as silence and is counted as an underrun.
//!
//! Underruns are classified before logging: while the buffer has never
//! been primed, or while no audio is expected (paused, idle, empty
//! queue), they are normal and logged at trace. During active playback
//! they mean the decode side is not keeping up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::{traits::*, HeapRb};
use tracing::{debug, trace, warn};

use crate::audio::types::AudioFrame;

/// Default capacity in frames (~186ms at 44.1kHz)
pub const DEFAULT_PLAYOUT_FRAMES: usize = 8192;

/// Fill target band for the producer side
const TARGET_FILL_MIN: f32 = 0.50;
const TARGET_FILL_MAX: f32 = 0.75;

/// Lock-free ring buffer carrying mixed frames to the output callback
pub struct PlayoutRing {
    buffer: HeapRb<AudioFrame>,
    underruns: Arc<AtomicU64>,
    overruns: Arc<AtomicU64>,
    /// Set once the buffer first reaches its target band; startup
    /// underruns before that are expected
    primed: Arc<AtomicBool>,
    /// Managed by the engine: true while playback should be audible
    audio_expected: Arc<AtomicBool>,
}

impl PlayoutRing {
    pub fn new(capacity: Option<usize>, audio_expected: Arc<AtomicBool>) -> Self {
        let capacity = capacity.unwrap_or(DEFAULT_PLAYOUT_FRAMES);
        debug!("Creating playout ring with capacity {} frames", capacity);

        Self {
            buffer: HeapRb::new(capacity),
            underruns: Arc::new(AtomicU64::new(0)),
            overruns: Arc::new(AtomicU64::new(0)),
            primed: Arc::new(AtomicBool::new(false)),
            audio_expected,
        }
    }

    /// Split into the producer half (fill loop) and consumer half
    /// (audio callback)
    pub fn split(self) -> (PlayoutProducer, PlayoutConsumer) {
        let (prod, cons) = self.buffer.split();

        let producer = PlayoutProducer {
            producer: prod,
            overruns: Arc::clone(&self.overruns),
            primed: Arc::clone(&self.primed),
        };

        let consumer = PlayoutConsumer {
            consumer: cons,
            underruns: Arc::clone(&self.underruns),
            primed: Arc::clone(&self.primed),
            audio_expected: Arc::clone(&self.audio_expected),
        };

        (producer, consumer)
    }
}

/// Producer half, owned by the engine fill loop
pub struct PlayoutProducer {
    producer: ringbuf::HeapProd<AudioFrame>,
    overruns: Arc<AtomicU64>,
    primed: Arc<AtomicBool>,
}

impl PlayoutProducer {
    /// Push one frame. Returns false (and counts an overrun) when full.
    pub fn push(&mut self, frame: AudioFrame) -> bool {
        match self.producer.try_push(frame) {
            Ok(_) => {
                if !self.primed.load(Ordering::Relaxed) && self.is_fill_optimal() {
                    self.primed.store(true, Ordering::Release);
                    debug!("Playout ring primed");
                }
                true
            }
            Err(_) => {
                let count = self.overruns.fetch_add(1, Ordering::Relaxed) + 1;
                if count % 1000 == 0 {
                    warn!("Playout ring overrun (total: {})", count);
                }
                false
            }
        }
    }

    pub fn occupied_len(&self) -> usize {
        self.producer.occupied_len()
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity().into()
    }

    /// Free slots available for push
    pub fn vacant_len(&self) -> usize {
        self.capacity() - self.occupied_len()
    }

    /// True when fill is inside the target band
    pub fn is_fill_optimal(&self) -> bool {
        let occupied = self.occupied_len();
        let capacity = self.capacity();
        let min = (capacity as f32 * TARGET_FILL_MIN) as usize;
        let max = (capacity as f32 * TARGET_FILL_MAX) as usize;
        occupied >= min && occupied <= max
    }

    /// True when fill has dropped below the target minimum
    pub fn needs_frames(&self) -> bool {
        let occupied = self.occupied_len();
        let min = (self.capacity() as f32 * TARGET_FILL_MIN) as usize;
        occupied < min
    }
}

/// Consumer half, owned by the audio callback
pub struct PlayoutConsumer {
    consumer: ringbuf::HeapCons<AudioFrame>,
    underruns: Arc<AtomicU64>,
    primed: Arc<AtomicBool>,
    audio_expected: Arc<AtomicBool>,
}

impl PlayoutConsumer {
    /// Pop one frame; None means underrun and the caller should output
    /// silence.
    pub fn pop(&mut self) -> Option<AudioFrame> {
        match self.consumer.try_pop() {
            Some(frame) => Some(frame),
            None => {
                let count = self.underruns.fetch_add(1, Ordering::Relaxed) + 1;
                // Log every 1000th occurrence to avoid spamming from the
                // realtime thread
                if count % 1000 == 0 {
                    let primed = self.primed.load(Ordering::Acquire);
                    let expected = self.audio_expected.load(Ordering::Acquire);
                    if !primed {
                        trace!("Playout underrun during startup (total: {})", count);
                    } else if !expected {
                        trace!("Playout underrun while paused/idle (total: {})", count);
                    } else {
                        warn!(
                            "Playout underrun during active playback (total: {}), \
                             decode is not keeping up",
                            count
                        );
                    }
                }
                None
            }
        }
    }

    pub fn occupied_len(&self) -> usize {
        self.consumer.occupied_len()
    }

    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}
