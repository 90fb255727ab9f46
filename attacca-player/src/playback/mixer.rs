//! Frame mixer: single-stream playout, crossfade, and gapless handoff
//!
//! The mixer pulls frames from one or two [`DecodeStream`]s and produces
//! the output signal one frame at a time. A staged pending stream is
//! promoted in the same pull that drains the outgoing stream's last
//! frame, so back-to-back tracks join with no inserted silence and no
//! overlap. Crossfades run both streams through the complementary
//! linear pair and sum. The equalizer and the resume fade-in ramp apply
//! to the mixed output; volume and mute live in the device callback.

use std::sync::Arc;

use tracing::{debug, warn};

use attacca_common::{EqPreset, FadeCurve, Track};

use crate::audio::{AudioFrame, Equalizer, STANDARD_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::playback::stream::DecodeStream;

/// Resume fade-in ramp length after a pause (250ms)
pub const RESUME_FADE_FRAMES: usize = (STANDARD_SAMPLE_RATE / 4) as usize;

/// A stream that left the mixer, with where it stood and why it ended.
///
/// `error` is None for natural completion and for hard switches; the
/// caller knows which of those it asked for.
#[derive(Debug)]
pub struct FinishedStream {
    pub track: Arc<Track>,
    pub position_ms: u64,
    pub error: Option<String>,
}

struct ResumeFade {
    frames: usize,
    progress: usize,
    curve: FadeCurve,
}

enum MixerState {
    /// Nothing loaded
    Idle,
    /// One stream playing out
    Single { stream: DecodeStream },
    /// Outgoing and incoming overlapping under the linear pair
    Crossfading {
        outgoing: DecodeStream,
        incoming: DecodeStream,
        fade_frames: usize,
        progress: usize,
    },
}

/// Pull-based mixer over decode streams
pub struct FrameMixer {
    state: MixerState,
    /// Prefetched next stream, staged for the coming handoff
    pending: Option<DecodeStream>,
    equalizer: Equalizer,
    paused: bool,
    resume_fade: Option<ResumeFade>,
    /// Streams that ended since the last `take_finished`
    finished: Vec<FinishedStream>,
    /// Track promoted to current by an automatic handoff
    promoted: Option<Arc<Track>>,
}

impl FrameMixer {
    pub fn new(preset: EqPreset) -> Result<Self> {
        Ok(Self {
            state: MixerState::Idle,
            pending: None,
            equalizer: Equalizer::new(preset)?,
            paused: false,
            resume_fade: None,
            finished: Vec::new(),
            promoted: None,
        })
    }

    /// Hard-switch to a new stream, replacing whatever is loaded.
    ///
    /// Returns the departed current stream so the caller can flush its
    /// position. A crossfade partner and any staged pending stream are
    /// discarded.
    pub fn start(&mut self, stream: DecodeStream) -> Option<FinishedStream> {
        self.pending = None;
        // A hard switch supersedes any promotion the controller has
        // not observed yet.
        self.promoted = None;
        let departed = match std::mem::replace(&mut self.state, MixerState::Idle) {
            MixerState::Idle => None,
            MixerState::Single { stream } => Some(finished_record(stream)),
            MixerState::Crossfading { outgoing, .. } => Some(finished_record(outgoing)),
        };
        debug!(track = %stream.track().path.display(), "Mixer loading stream");
        self.state = MixerState::Single { stream };
        departed
    }

    /// Stage the prefetched next stream, replacing any previous staging
    pub fn stage(&mut self, stream: DecodeStream) {
        debug!(track = %stream.track().path.display(), "Staging next stream");
        self.pending = Some(stream);
    }

    pub fn pending_ref(&self) -> Option<&DecodeStream> {
        self.pending.as_ref()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drop the staged stream (queue changed under the prefetch)
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Begin overlapping the current stream with the staged one.
    ///
    /// The fade window shrinks to the outgoing remainder when the
    /// configured length does not fit. The staged stream must be ready;
    /// starting a fade against an unready stream would stall the
    /// outgoing audio with it.
    pub fn begin_crossfade(&mut self, fade_frames: usize) -> Result<()> {
        let Some(incoming) = self.pending.take() else {
            return Err(Error::InvalidState(
                "Cannot start crossfade: no stream staged".to_string(),
            ));
        };
        if !incoming.is_ready() {
            self.pending = Some(incoming);
            return Err(Error::InvalidState(
                "Cannot start crossfade: staged stream not ready".to_string(),
            ));
        }
        match std::mem::replace(&mut self.state, MixerState::Idle) {
            MixerState::Single { stream } => {
                let remaining = stream
                    .remaining_ms()
                    .map(|ms| (ms * STANDARD_SAMPLE_RATE as u64 / 1000) as usize);
                let fade = match remaining {
                    Some(r) => fade_frames.min(r).max(1),
                    None => fade_frames.max(1),
                };
                debug!(
                    from = %stream.track().path.display(),
                    to = %incoming.track().path.display(),
                    fade_frames = fade,
                    "Crossfade started"
                );
                self.state = MixerState::Crossfading {
                    outgoing: stream,
                    incoming,
                    fade_frames: fade,
                    progress: 0,
                };
                Ok(())
            }
            other => {
                self.state = other;
                self.pending = Some(incoming);
                Err(Error::InvalidState(
                    "Cannot start crossfade: no single stream playing".to_string(),
                ))
            }
        }
    }

    /// Complete an in-flight crossfade right now, promoting the
    /// incoming stream at full level. No-op outside a crossfade.
    pub fn finish_transition(&mut self) {
        match std::mem::replace(&mut self.state, MixerState::Idle) {
            MixerState::Crossfading {
                outgoing, incoming, ..
            } => {
                self.finished.push(finished_record(outgoing));
                self.promoted = Some(incoming.track().clone());
                self.state = MixerState::Single { stream: incoming };
            }
            other => self.state = other,
        }
    }

    /// Unload everything. Returns the departed current stream.
    pub fn stop(&mut self) -> Option<FinishedStream> {
        self.pending = None;
        self.paused = false;
        self.resume_fade = None;
        self.promoted = None;
        match std::mem::replace(&mut self.state, MixerState::Idle) {
            MixerState::Idle => None,
            MixerState::Single { stream } => Some(finished_record(stream)),
            MixerState::Crossfading { outgoing, .. } => Some(finished_record(outgoing)),
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
        self.resume_fade = None;
    }

    /// Leave pause, ramping the output up over `fade_frames`
    pub fn resume(&mut self, fade_frames: usize) {
        if !self.paused {
            return;
        }
        self.paused = false;
        if fade_frames > 0 {
            self.resume_fade = Some(ResumeFade {
                frames: fade_frames,
                progress: 0,
                curve: FadeCurve::SCurve,
            });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, MixerState::Idle)
    }

    pub fn is_crossfading(&self) -> bool {
        matches!(self.state, MixerState::Crossfading { .. })
    }

    /// The current track. During a crossfade the outgoing stream stays
    /// current until promotion.
    pub fn current_track(&self) -> Option<Arc<Track>> {
        match &self.state {
            MixerState::Idle => None,
            MixerState::Single { stream } => Some(stream.track().clone()),
            MixerState::Crossfading { outgoing, .. } => Some(outgoing.track().clone()),
        }
    }

    /// Consumed position of the current stream in milliseconds
    pub fn position_ms(&self) -> Option<u64> {
        match &self.state {
            MixerState::Idle => None,
            MixerState::Single { stream } => Some(stream.position_ms()),
            MixerState::Crossfading { outgoing, .. } => Some(outgoing.position_ms()),
        }
    }

    /// Remaining play time of the current stream; None when idle or
    /// when the container reported no duration
    pub fn remaining_ms(&self) -> Option<u64> {
        match &self.state {
            MixerState::Idle => None,
            MixerState::Single { stream } => stream.remaining_ms(),
            MixerState::Crossfading { outgoing, .. } => outgoing.remaining_ms(),
        }
    }

    /// The current stream hit a decode failure
    pub fn current_failed(&self) -> Option<String> {
        match &self.state {
            MixerState::Idle => None,
            MixerState::Single { stream } => stream.error(),
            MixerState::Crossfading { outgoing, .. } => outgoing.error(),
        }
    }

    pub fn set_eq_preset(&mut self, preset: EqPreset) -> Result<()> {
        self.equalizer.set_preset(preset)
    }

    pub fn eq_preset(&self) -> EqPreset {
        self.equalizer.preset()
    }

    /// Streams that ended since the last call
    pub fn take_finished(&mut self) -> Vec<FinishedStream> {
        std::mem::take(&mut self.finished)
    }

    /// Track promoted to current by an automatic handoff since the
    /// last call
    pub fn take_promoted(&mut self) -> Option<Arc<Track>> {
        self.promoted.take()
    }

    /// Produce the next output frame.
    ///
    /// None means no audio is available right now: the mixer is idle,
    /// or decode has fallen behind (a stall; the caller lets the ring
    /// drain to silence and position holds still). Pause returns
    /// silence frames without consuming from the streams.
    pub fn next_frame(&mut self) -> Option<AudioFrame> {
        if self.paused {
            return Some(AudioFrame::silence());
        }

        let mut frame = loop {
            match std::mem::replace(&mut self.state, MixerState::Idle) {
                MixerState::Idle => return None,

                MixerState::Single { mut stream } => match stream.pop() {
                    Some(frame) => {
                        self.state = MixerState::Single { stream };
                        break frame;
                    }
                    None if stream.is_exhausted() => {
                        let failed = stream.error().is_some();
                        self.finished.push(finished_record(stream));
                        if failed {
                            // The controller decides what happens after a
                            // decode failure; never roll into the staged
                            // stream on its own
                            return None;
                        }
                        match self.pending.take() {
                            Some(next) => {
                                // Same-pull promotion keeps the join gapless
                                self.promoted = Some(next.track().clone());
                                self.state = MixerState::Single { stream: next };
                                continue;
                            }
                            None => return None,
                        }
                    }
                    None => {
                        self.state = MixerState::Single { stream };
                        return None;
                    }
                },

                MixerState::Crossfading {
                    mut outgoing,
                    mut incoming,
                    fade_frames,
                    mut progress,
                } => {
                    if outgoing.buffered_frames() == 0 {
                        if outgoing.is_exhausted() {
                            // Outgoing ran out before the window closed
                            self.finished.push(finished_record(outgoing));
                            self.promoted = Some(incoming.track().clone());
                            self.state = MixerState::Single { stream: incoming };
                            continue;
                        }
                        self.state = MixerState::Crossfading {
                            outgoing,
                            incoming,
                            fade_frames,
                            progress,
                        };
                        return None;
                    }
                    if incoming.buffered_frames() == 0 && !incoming.is_exhausted() {
                        self.state = MixerState::Crossfading {
                            outgoing,
                            incoming,
                            fade_frames,
                            progress,
                        };
                        return None;
                    }

                    let Some(mut out_frame) = outgoing.pop() else {
                        self.state = MixerState::Crossfading {
                            outgoing,
                            incoming,
                            fade_frames,
                            progress,
                        };
                        return None;
                    };
                    // An exhausted incoming contributes silence
                    let mut in_frame = incoming.pop().unwrap_or_default();

                    let t = progress as f32 / fade_frames as f32;
                    out_frame.apply_volume(FadeCurve::Linear.fade_out(t));
                    in_frame.apply_volume(FadeCurve::Linear.fade_in(t));
                    out_frame.mix(&in_frame);
                    out_frame.clamp();

                    progress += 1;
                    if progress >= fade_frames {
                        if outgoing.buffered_frames() > 0 {
                            debug!(
                                track = %outgoing.track().path.display(),
                                dropped_frames = outgoing.buffered_frames(),
                                "Crossfade window closed before outgoing stream drained"
                            );
                        }
                        self.finished.push(finished_record(outgoing));
                        self.promoted = Some(incoming.track().clone());
                        self.state = MixerState::Single { stream: incoming };
                    } else {
                        self.state = MixerState::Crossfading {
                            outgoing,
                            incoming,
                            fade_frames,
                            progress,
                        };
                    }
                    break out_frame;
                }
            }
        };

        self.equalizer.process(&mut frame);

        if let Some(ramp) = &mut self.resume_fade {
            if ramp.progress < ramp.frames {
                let t = ramp.progress as f32 / ramp.frames as f32;
                frame.apply_volume(ramp.curve.fade_in(t));
                ramp.progress += 1;
            } else {
                self.resume_fade = None;
            }
        }

        Some(frame)
    }
}

/// Capture a stream's final record, consuming (and thereby cancelling)
/// the stream
fn finished_record(stream: DecodeStream) -> FinishedStream {
    let record = FinishedStream {
        track: stream.track().clone(),
        position_ms: stream.position_ms(),
        error: stream.error(),
    };
    if let Some(error) = &record.error {
        warn!(
            track = %record.track.path.display(),
            error = %error,
            "Stream left the mixer after a decode failure"
        );
    }
    record
}
