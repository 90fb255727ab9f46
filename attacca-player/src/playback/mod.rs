//! Playback pipeline: queue, decode streams, mixing, playout

pub mod engine;
pub mod mixer;
pub mod queue;
pub mod ring_buffer;
pub mod stream;

pub use engine::PlaybackEngine;
pub use mixer::FrameMixer;
pub use queue::TrackQueue;
pub use ring_buffer::{PlayoutConsumer, PlayoutProducer, PlayoutRing};
pub use stream::DecodeStream;
