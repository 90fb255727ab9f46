//! Sample rate conversion to the standard playback rate
//!
//! Wraps rubato's `FastFixedIn` behind a streaming interface: decoded
//! frames are buffered until a full fixed-size chunk is available, then
//! resampled to 44.1kHz. Sources already at the standard rate bypass
//! rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};

use crate::audio::types::{AudioFrame, STANDARD_SAMPLE_RATE};
use crate::error::{Error, Result};

/// Fixed input chunk size fed to rubato (frames)
const CHUNK_FRAMES: usize = 1024;

/// Streaming resampler converting an arbitrary input rate to 44.1kHz stereo
pub struct StreamResampler {
    /// None when the input is already at the standard rate
    inner: Option<FastFixedIn<f32>>,
    input_rate: u32,
    /// Input frames waiting for a full chunk
    pending: Vec<AudioFrame>,
}

impl StreamResampler {
    /// Create a resampler for the given input sample rate
    pub fn new(input_rate: u32) -> Result<Self> {
        if input_rate == 0 {
            return Err(Error::Decode("Input sample rate is zero".to_string()));
        }

        let inner = if input_rate == STANDARD_SAMPLE_RATE {
            None
        } else {
            let ratio = STANDARD_SAMPLE_RATE as f64 / input_rate as f64;
            let resampler =
                FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Septic, CHUNK_FRAMES, 2)
                    .map_err(|e| {
                        Error::Decode(format!("Failed to create resampler: {}", e))
                    })?;
            Some(resampler)
        };

        Ok(Self {
            inner,
            input_rate,
            pending: Vec::with_capacity(CHUNK_FRAMES * 2),
        })
    }

    /// The input sample rate this resampler was built for
    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// True when no rate conversion is needed
    pub fn is_passthrough(&self) -> bool {
        self.inner.is_none()
    }

    /// Feed decoded frames in, get resampled frames out.
    ///
    /// Output length varies: input is held back until a full chunk is
    /// available, so a call may return nothing. Call `flush` after the
    /// last input to drain held-back frames.
    pub fn process(&mut self, frames: &[AudioFrame]) -> Result<Vec<AudioFrame>> {
        if self.inner.is_none() {
            return Ok(frames.to_vec());
        }

        self.pending.extend_from_slice(frames);

        let mut output = Vec::new();
        while self.pending.len() >= CHUNK_FRAMES {
            let chunk: Vec<AudioFrame> = self.pending.drain(..CHUNK_FRAMES).collect();
            let planar = deinterleave(&chunk);
            let resampler = self.inner.as_mut().unwrap();
            let resampled = resampler
                .process(&planar, None)
                .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;
            interleave_into(&resampled, &mut output);
        }

        Ok(output)
    }

    /// Drain any frames still buffered below a full chunk.
    ///
    /// Call exactly once, after the final `process` call for the stream.
    /// rubato pads the last short chunk with zeros internally; the output
    /// is trimmed back to the length the real input maps to, so track
    /// endings carry no padded silence.
    pub fn flush(&mut self) -> Result<Vec<AudioFrame>> {
        let Some(resampler) = self.inner.as_mut() else {
            return Ok(Vec::new());
        };
        if self.pending.is_empty() {
            return Ok(Vec::new());
        }

        let remainder: Vec<AudioFrame> = self.pending.drain(..).collect();
        let ratio = STANDARD_SAMPLE_RATE as f64 / self.input_rate as f64;
        let expected = (remainder.len() as f64 * ratio).round() as usize;

        let planar = deinterleave(&remainder);
        let resampled = resampler
            .process_partial(Some(&planar), None)
            .map_err(|e| Error::Decode(format!("Resampling failed: {}", e)))?;

        let mut output = Vec::new();
        interleave_into(&resampled, &mut output);
        output.truncate(expected);
        Ok(output)
    }
}

/// Split interleaved stereo frames into rubato's planar layout
fn deinterleave(frames: &[AudioFrame]) -> Vec<Vec<f32>> {
    let mut left = Vec::with_capacity(frames.len());
    let mut right = Vec::with_capacity(frames.len());
    for frame in frames {
        left.push(frame.left);
        right.push(frame.right);
    }
    vec![left, right]
}

/// Append rubato's planar output as interleaved stereo frames
fn interleave_into(planar: &[Vec<f32>], output: &mut Vec<AudioFrame>) {
    if planar.len() < 2 {
        return;
    }
    let frames = planar[0].len().min(planar[1].len());
    output.reserve(frames);
    for i in 0..frames {
        output.push(AudioFrame::new(planar[0][i], planar[1][i]));
    }
}
