//! Audio processing chain: decode, resample, equalize, output

pub mod decode;
pub mod eq;
pub mod output;
pub mod resampler;
pub mod types;

pub use decode::AudioDecoder;
pub use eq::Equalizer;
pub use output::AudioOutput;
pub use resampler::StreamResampler;
pub use types::{AudioFrame, STANDARD_SAMPLE_RATE};
