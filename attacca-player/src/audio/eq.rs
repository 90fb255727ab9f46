//! Five-band equalizer
//!
//! Stateful biquad filters applied to the mixed output: a low shelf at
//! 60Hz, peaking bands at 250Hz, 1kHz and 4kHz, and a high shelf at
//! 12kHz. Presets are fixed gain tables; the flat preset bypasses the
//! filter chain entirely.

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type, Q_BUTTERWORTH_F32};

use attacca_common::EqPreset;

use crate::audio::types::{AudioFrame, STANDARD_SAMPLE_RATE};
use crate::error::{Error, Result};

/// Band center/corner frequencies (Hz)
const BAND_FREQUENCIES: [f32; 5] = [60.0, 250.0, 1000.0, 4000.0, 12000.0];

/// Per-band gains in dB for each preset
fn preset_gains(preset: EqPreset) -> [f32; 5] {
    match preset {
        EqPreset::Flat => [0.0, 0.0, 0.0, 0.0, 0.0],
        EqPreset::BassBoost => [6.0, 3.5, 0.0, 0.0, 0.0],
        EqPreset::TrebleBoost => [0.0, 0.0, 0.0, 3.5, 6.0],
        EqPreset::Vocal => [-2.0, 0.0, 3.0, 2.0, -1.0],
        EqPreset::Soft => [2.0, 1.0, -1.0, -2.0, -3.0],
    }
}

/// One band's filter pair (independent state per channel)
struct Band {
    left: DirectForm1<f32>,
    right: DirectForm1<f32>,
}

/// Five-band equalizer over stereo frames
pub struct Equalizer {
    preset: EqPreset,
    bands: Vec<Band>,
    /// False when the preset is all-zero gains and processing is a no-op
    active: bool,
}

impl Equalizer {
    pub fn new(preset: EqPreset) -> Result<Self> {
        let mut eq = Self {
            preset,
            bands: Vec::new(),
            active: false,
        };
        eq.rebuild()?;
        Ok(eq)
    }

    pub fn preset(&self) -> EqPreset {
        self.preset
    }

    /// Switch presets. Filter state is reset, so the change is applied
    /// without carrying transients from the old curve.
    pub fn set_preset(&mut self, preset: EqPreset) -> Result<()> {
        if preset == self.preset {
            return Ok(());
        }
        self.preset = preset;
        self.rebuild()
    }

    /// Run one frame through the filter chain in place
    pub fn process(&mut self, frame: &mut AudioFrame) {
        if !self.active {
            return;
        }
        for band in &mut self.bands {
            frame.left = band.left.run(frame.left);
            frame.right = band.right.run(frame.right);
        }
    }

    fn rebuild(&mut self) -> Result<()> {
        let gains = preset_gains(self.preset);
        self.active = gains.iter().any(|g| *g != 0.0);
        self.bands.clear();

        if !self.active {
            return Ok(());
        }

        let fs = (STANDARD_SAMPLE_RATE as f32).hz();
        for (i, (&f0, &gain_db)) in BAND_FREQUENCIES.iter().zip(gains.iter()).enumerate() {
            let filter_type = match i {
                0 => Type::LowShelf(gain_db),
                4 => Type::HighShelf(gain_db),
                _ => Type::PeakingEQ(gain_db),
            };
            let coeffs = Coefficients::<f32>::from_params(
                filter_type,
                fs,
                f0.hz(),
                Q_BUTTERWORTH_F32,
            )
            .map_err(|e| Error::Playback(format!("Failed to build equalizer band: {:?}", e)))?;
            self.bands.push(Band {
                left: DirectForm1::<f32>::new(coeffs),
                right: DirectForm1::<f32>::new(coeffs),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, count: usize) -> Vec<AudioFrame> {
        (0..count)
            .map(|i| {
                let t = i as f32 / STANDARD_SAMPLE_RATE as f32;
                AudioFrame::from_mono((2.0 * std::f32::consts::PI * freq * t).sin() * 0.25)
            })
            .collect()
    }

    /// RMS of the left channel after discarding the filter warmup
    fn steady_rms(eq: &mut Equalizer, frames: &[AudioFrame]) -> f32 {
        let warmup = 4410;
        let mut sum = 0.0f64;
        let mut counted = 0usize;
        for (i, frame) in frames.iter().enumerate() {
            let mut f = *frame;
            eq.process(&mut f);
            if i >= warmup {
                sum += (f.left as f64) * (f.left as f64);
                counted += 1;
            }
        }
        ((sum / counted as f64) as f32).sqrt()
    }

    fn input_rms(frames: &[AudioFrame]) -> f32 {
        let warmup = 4410;
        let mut sum = 0.0f64;
        let mut counted = 0usize;
        for frame in frames.iter().skip(warmup) {
            sum += (frame.left as f64) * (frame.left as f64);
            counted += 1;
        }
        ((sum / counted as f64) as f32).sqrt()
    }

    #[test]
    fn test_flat_preset_is_bitwise_identity() {
        let mut eq = Equalizer::new(EqPreset::Flat).unwrap();
        let frames = sine(440.0, 1000);
        for frame in &frames {
            let mut f = *frame;
            eq.process(&mut f);
            assert_eq!(f, *frame);
        }
    }

    #[test]
    fn test_bass_boost_raises_low_end() {
        let frames = sine(60.0, 44100);
        let reference = input_rms(&frames);

        let mut eq = Equalizer::new(EqPreset::BassBoost).unwrap();
        let boosted = steady_rms(&mut eq, &frames);

        assert!(
            boosted > reference * 1.2,
            "60Hz RMS {} not boosted over {}",
            boosted,
            reference
        );
    }

    #[test]
    fn test_bass_boost_leaves_midrange_alone() {
        let frames = sine(1000.0, 44100);
        let reference = input_rms(&frames);

        let mut eq = Equalizer::new(EqPreset::BassBoost).unwrap();
        let processed = steady_rms(&mut eq, &frames);

        let ratio = processed / reference;
        assert!(
            ratio > 0.85 && ratio < 1.15,
            "1kHz RMS changed by factor {}",
            ratio
        );
    }

    #[test]
    fn test_treble_boost_raises_high_end() {
        let frames = sine(12000.0, 44100);
        let reference = input_rms(&frames);

        let mut eq = Equalizer::new(EqPreset::TrebleBoost).unwrap();
        let boosted = steady_rms(&mut eq, &frames);

        assert!(
            boosted > reference * 1.2,
            "12kHz RMS {} not boosted over {}",
            boosted,
            reference
        );
    }

    #[test]
    fn test_preset_change_returns_to_identity() {
        let mut eq = Equalizer::new(EqPreset::BassBoost).unwrap();
        eq.set_preset(EqPreset::Flat).unwrap();
        assert_eq!(eq.preset(), EqPreset::Flat);

        let frames = sine(60.0, 500);
        for frame in &frames {
            let mut f = *frame;
            eq.process(&mut f);
            assert_eq!(f, *frame);
        }
    }
}
