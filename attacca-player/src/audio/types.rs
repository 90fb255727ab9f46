//! Core audio types
//!
//! All audio in the playback chain is stereo f32 at 44.1kHz. Decoded
//! sources are converted to this format immediately after decode, so
//! everything downstream (resampler output, mixer, equalizer, output
//! device) works with a single frame type.

/// Standard sample rate for the playback chain (Hz)
pub const STANDARD_SAMPLE_RATE: u32 = 44100;

/// A single stereo audio frame (two f32 samples)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioFrame {
    pub left: f32,
    pub right: f32,
}

impl AudioFrame {
    /// Create a new audio frame
    pub fn new(left: f32, right: f32) -> Self {
        Self { left, right }
    }

    /// Create a silent frame
    pub fn silence() -> Self {
        Self {
            left: 0.0,
            right: 0.0,
        }
    }

    /// Create a frame from a mono sample (duplicate to both channels)
    pub fn from_mono(sample: f32) -> Self {
        Self {
            left: sample,
            right: sample,
        }
    }

    /// Apply a volume multiplier to both channels
    pub fn apply_volume(&mut self, volume: f32) {
        self.left *= volume;
        self.right *= volume;
    }

    /// Clamp both channels to the valid [-1.0, 1.0] range
    pub fn clamp(&mut self) {
        self.left = self.left.clamp(-1.0, 1.0);
        self.right = self.right.clamp(-1.0, 1.0);
    }

    /// Mix another frame into this one (simple addition)
    pub fn mix(&mut self, other: &AudioFrame) {
        self.left += other.left;
        self.right += other.right;
    }
}

impl Default for AudioFrame {
    fn default() -> Self {
        Self::silence()
    }
}
