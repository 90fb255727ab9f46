//! Audio output using cpal
//!
//! Manages the output device and the realtime callback. The callback
//! pulls one frame at a time from a caller-supplied source, applies
//! master volume and mute, clamps, and converts to whatever sample
//! format the device negotiated.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig};
use tracing::{debug, error, info, warn};

use crate::audio::types::{AudioFrame, STANDARD_SAMPLE_RATE};
use crate::error::{Error, Result};

/// Audio output manager using cpal
pub struct AudioOutput {
    device: Device,
    config: StreamConfig,
    sample_format: SampleFormat,
    stream: Option<Stream>,
    /// Master volume, shared with the realtime callback
    volume: Arc<Mutex<f32>>,
    muted: Arc<AtomicBool>,
    /// Set by the stream error callback; polled by the engine
    error_flag: Arc<AtomicBool>,
    error_count: Arc<AtomicU32>,
}

impl AudioOutput {
    /// Open an output device. `device_name` of None selects the system
    /// default.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        Self::new_with_volume(
            device_name,
            Arc::new(Mutex::new(1.0)),
            Arc::new(AtomicBool::new(false)),
        )
    }

    /// As `new`, sharing externally-owned volume and mute controls.
    ///
    /// The engine keeps its own handles to these so control operations
    /// reach the realtime callback without going through this struct.
    pub fn new_with_volume(
        device_name: Option<&str>,
        volume: Arc<Mutex<f32>>,
        muted: Arc<AtomicBool>,
    ) -> Result<Self> {
        let host = cpal::default_host();

        let device = match device_name {
            Some(name) => host
                .output_devices()
                .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| {
                    Error::AudioOutput(format!("Audio device not found: {}", name))
                })?,
            None => host.default_output_device().ok_or_else(|| {
                Error::AudioOutput("No audio output device available".to_string())
            })?,
        };

        let device_label = device.name().unwrap_or_else(|_| "unknown".to_string());
        let (config, sample_format) = Self::get_best_config(&device)?;
        info!(
            "Audio output: {} ({}ch @ {}Hz, {:?})",
            device_label, config.channels, config.sample_rate.0, sample_format
        );

        Ok(Self {
            device,
            config,
            sample_format,
            stream: None,
            volume,
            muted,
            error_flag: Arc::new(AtomicBool::new(false)),
            error_count: Arc::new(AtomicU32::new(0)),
        })
    }

    /// Names of all available output devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to enumerate devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    /// Prefer stereo f32 at the standard rate; fall back to whatever
    /// the device offers by default.
    fn get_best_config(device: &Device) -> Result<(StreamConfig, SampleFormat)> {
        if let Ok(mut supported) = device.supported_output_configs() {
            if let Some(config) = supported.find(|c| {
                c.channels() == 2
                    && c.sample_format() == SampleFormat::F32
                    && c.min_sample_rate().0 <= STANDARD_SAMPLE_RATE
                    && c.max_sample_rate().0 >= STANDARD_SAMPLE_RATE
            }) {
                let config = config.with_sample_rate(cpal::SampleRate(STANDARD_SAMPLE_RATE));
                return Ok((config.config(), SampleFormat::F32));
            }
        }

        let default = device.default_output_config().map_err(|e| {
            Error::AudioOutput(format!("No usable output configuration: {}", e))
        })?;
        warn!(
            "Preferred stereo f32 @ {}Hz not available, using device default",
            STANDARD_SAMPLE_RATE
        );
        Ok((default.config(), default.sample_format()))
    }

    /// Negotiated output sample rate (Hz)
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    /// Start the output stream. `frame_source` is called once per
    /// output frame from the realtime thread.
    pub fn start<F>(&mut self, frame_source: F) -> Result<()>
    where
        F: FnMut() -> AudioFrame + Send + 'static,
    {
        if self.stream.is_some() {
            return Err(Error::InvalidState(
                "Audio stream already started".to_string(),
            ));
        }

        let source = Arc::new(Mutex::new(frame_source));
        let stream = match self.sample_format {
            SampleFormat::F32 => self.build_stream(source, |s| s)?,
            SampleFormat::I16 => self.build_stream(source, f32_to_i16)?,
            SampleFormat::U16 => self.build_stream(source, f32_to_u16)?,
            other => {
                return Err(Error::AudioOutput(format!(
                    "Unsupported sample format: {:?}",
                    other
                )));
            }
        };

        stream
            .play()
            .map_err(|e| Error::AudioOutput(format!("Failed to start audio stream: {}", e)))?;
        self.stream = Some(stream);
        debug!("Audio stream started");
        Ok(())
    }

    fn build_stream<F, T>(&self, source: Arc<Mutex<F>>, convert: fn(f32) -> T) -> Result<Stream>
    where
        F: FnMut() -> AudioFrame + Send + 'static,
        T: cpal::SizedSample + Send + 'static,
    {
        let channels = self.config.channels as usize;
        let volume = Arc::clone(&self.volume);
        let muted = Arc::clone(&self.muted);
        let error_flag = Arc::clone(&self.error_flag);
        let error_count = Arc::clone(&self.error_count);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [T], _| {
                    let gain = if muted.load(Ordering::Relaxed) {
                        0.0
                    } else {
                        *volume.lock().unwrap()
                    };
                    let mut source = source.lock().unwrap();
                    for chunk in data.chunks_mut(channels) {
                        let mut frame = (*source)();
                        frame.apply_volume(gain);
                        frame.clamp();
                        match chunk.len() {
                            0 => {}
                            1 => chunk[0] = convert((frame.left + frame.right) * 0.5),
                            _ => {
                                chunk[0] = convert(frame.left);
                                chunk[1] = convert(frame.right);
                                for sample in chunk.iter_mut().skip(2) {
                                    *sample = convert(0.0);
                                }
                            }
                        }
                    }
                },
                move |err| {
                    error!("Audio stream error: {}", err);
                    error_flag.store(true, Ordering::Relaxed);
                    error_count.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| Error::AudioOutput(format!("Failed to build audio stream: {}", e)))?;

        Ok(stream)
    }

    /// Stop and release the stream
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.pause();
            drop(stream);
            debug!("Audio stream stopped");
        }
    }

    /// Set master volume, clamped to [0.0, 1.0]
    pub fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume.clamp(0.0, 1.0);
    }

    pub fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// True once the stream has reported an error
    pub fn has_error(&self) -> bool {
        self.error_flag.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Convert a clamped f32 sample to i16
fn f32_to_i16(sample: f32) -> i16 {
    (sample * i16::MAX as f32) as i16
}

/// Convert a clamped f32 sample to u16 (unsigned, midpoint silence)
fn f32_to_u16(sample: f32) -> u16 {
    ((sample + 1.0) * 32767.5) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_devices_does_not_panic() {
        // May fail on machines without audio hardware; either outcome
        // is acceptable
        let _ = AudioOutput::list_devices();
    }

    #[test]
    fn test_i16_conversion_range() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);
    }

    #[test]
    fn test_u16_conversion_range() {
        assert_eq!(f32_to_u16(-1.0), 0);
        assert_eq!(f32_to_u16(1.0), 65535);
        let mid = f32_to_u16(0.0);
        assert!(mid == 32767 || mid == 32768);
    }

    #[test]
    fn test_missing_device_is_an_error() {
        // A nonsense device name must not fall back to the default
        let result = AudioOutput::new(Some("no-such-device-xyzzy"));
        assert!(result.is_err());
    }
}
