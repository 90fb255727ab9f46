//! # Attacca Common Library
//!
//! Shared vocabulary for the attacca playback engine:
//! - Track model and embedded art
//! - Playback, repeat, and EQ preset enums
//! - Event types (PlayerEvent enum)
//! - Fade curve definitions and calculations

pub mod events;
pub mod fade;
pub mod types;

pub use events::PlayerEvent;
pub use fade::FadeCurve;
pub use types::{EmbeddedArt, EqPreset, PlaybackState, RepeatMode, Track, TransitionKind};
