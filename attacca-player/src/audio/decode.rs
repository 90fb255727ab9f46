//! Streaming audio decoder built on symphonia
//!
//! Decodes one file into stereo f32 frames at the source sample rate,
//! one packet at a time. Channel layout is normalized at this boundary:
//! mono is duplicated to both channels, anything above stereo keeps the
//! first two channels. Rate conversion happens downstream in the
//! resampler.

use std::fs::File;
use std::path::{Path, PathBuf};

use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use tracing::{debug, warn};

use crate::audio::types::{AudioFrame, STANDARD_SAMPLE_RATE};
use crate::error::{Error, Result};

/// Give up on a stream after this many corrupt packets in a row
const MAX_CONSECUTIVE_DECODE_ERRORS: u32 = 32;

/// Packet-at-a-time decoder for a single audio file
pub struct AudioDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    path: PathBuf,
    /// Frames to drop after a seek landed before the requested position
    pending_skip: u64,
    consecutive_errors: u32,
}

impl AudioDecoder {
    /// Open a file for decoding, optionally starting at an offset.
    ///
    /// A failed seek is logged and decoding starts from the beginning
    /// instead; an unreadable or unsupported file is an error.
    pub fn open(path: &Path, start_ms: u64) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::Decode(format!("Failed to open {}: {}", path.display(), e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| {
                Error::Decode(format!("Unsupported format in {}: {}", path.display(), e))
            })?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| {
                Error::Decode(format!("No decodable audio track in {}", path.display()))
            })?;
        let track_id = track.id;

        let sample_rate = track.codec_params.sample_rate.unwrap_or_else(|| {
            warn!(
                "No sample rate declared in {}, assuming {}Hz",
                path.display(),
                STANDARD_SAMPLE_RATE
            );
            STANDARD_SAMPLE_RATE
        });

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| {
                Error::Decode(format!(
                    "Failed to create decoder for {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let mut this = Self {
            format,
            decoder,
            track_id,
            sample_rate,
            path: path.to_path_buf(),
            pending_skip: 0,
            consecutive_errors: 0,
        };

        if start_ms > 0 {
            this.seek_to(start_ms);
        }

        Ok(this)
    }

    /// Source sample rate (Hz)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Seek to a position. On failure, logs and leaves the stream where
    /// it is so playback can continue from the current position.
    pub fn seek_to(&mut self, position_ms: u64) {
        let seconds = position_ms as f64 / 1000.0;
        let target = SeekTo::Time {
            time: Time::from(seconds),
            track_id: Some(self.track_id),
        };
        match self.format.seek(SeekMode::Accurate, target) {
            Ok(seeked) => {
                self.decoder.reset();
                // Accurate seek lands on a packet boundary at or before
                // the target; drop the lead-in frames during decode
                self.pending_skip = seeked.required_ts.saturating_sub(seeked.actual_ts);
                debug!(
                    "Seeked {} to {}ms (skipping {} frames)",
                    self.path.display(),
                    position_ms,
                    self.pending_skip
                );
            }
            Err(e) => {
                warn!(
                    "Seek to {}ms failed in {}: {}",
                    position_ms,
                    self.path.display(),
                    e
                );
            }
        }
    }

    /// Decode the next packet of audio.
    ///
    /// Returns `Ok(None)` at end of stream. Corrupt packets are skipped
    /// with a warning; a long run of them fails the stream.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<AudioFrame>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    return Err(Error::Decode(format!(
                        "Stream reset required in {}",
                        self.path.display()
                    )));
                }
                Err(e) => {
                    return Err(Error::Decode(format!(
                        "Failed to read packet from {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    self.consecutive_errors = 0;
                    let mut frames = convert_buffer(&decoded);
                    if self.pending_skip > 0 {
                        let skip = (self.pending_skip as usize).min(frames.len());
                        frames.drain(..skip);
                        self.pending_skip -= skip as u64;
                    }
                    if frames.is_empty() {
                        continue;
                    }
                    return Ok(Some(frames));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    self.consecutive_errors += 1;
                    warn!("Corrupt packet in {} ({}), skipping", self.path.display(), e);
                    if self.consecutive_errors > MAX_CONSECUTIVE_DECODE_ERRORS {
                        return Err(Error::Decode(format!(
                            "Too many corrupt packets in {}",
                            self.path.display()
                        )));
                    }
                }
                Err(e) => {
                    return Err(Error::Decode(format!(
                        "Decode failed in {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
    }
}

/// Convert a decoded buffer of any sample format to stereo f32 frames
fn convert_buffer(buffer: &AudioBufferRef) -> Vec<AudioFrame> {
    match buffer {
        AudioBufferRef::U8(buf) => frames_from(buf, |s| (s as f32 - 128.0) / 128.0),
        AudioBufferRef::U16(buf) => frames_from(buf, |s| (s as f32 - 32768.0) / 32768.0),
        AudioBufferRef::U24(buf) => {
            frames_from(buf, |s| (s.inner() as f32 - 8_388_608.0) / 8_388_608.0)
        }
        AudioBufferRef::U32(buf) => {
            frames_from(buf, |s| (s as f64 / 2_147_483_648.0 - 1.0) as f32)
        }
        AudioBufferRef::S8(buf) => frames_from(buf, |s| s as f32 / 128.0),
        AudioBufferRef::S16(buf) => frames_from(buf, |s| s as f32 / 32768.0),
        AudioBufferRef::S24(buf) => frames_from(buf, |s| s.inner() as f32 / 8_388_608.0),
        AudioBufferRef::S32(buf) => frames_from(buf, |s| (s as f64 / 2_147_483_648.0) as f32),
        AudioBufferRef::F32(buf) => frames_from(buf, |s| s),
        AudioBufferRef::F64(buf) => frames_from(buf, |s| s as f32),
    }
}

/// Interleave the first two planes (duplicating mono) through a sample
/// converter
fn frames_from<S: Copy>(buf: &AudioBuffer<S>, convert: impl Fn(S) -> f32) -> Vec<AudioFrame>
where
    S: symphonia::core::sample::Sample,
{
    let channels = buf.spec().channels.count();
    let frames = buf.frames();
    match channels {
        0 => Vec::new(),
        1 => buf.chan(0)[..frames]
            .iter()
            .map(|&s| AudioFrame::from_mono(convert(s)))
            .collect(),
        _ => {
            let left = buf.chan(0);
            let right = buf.chan(1);
            (0..frames)
                .map(|i| AudioFrame::new(convert(left[i]), convert(right[i])))
                .collect()
        }
    }
}
