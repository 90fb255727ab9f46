//! # Attacca player (attacca-player)
//!
//! Local audio playback engine with gapless and crossfaded track
//! transitions.
//!
//! **Purpose:** Decode audio files from an activated music folder,
//! walk them in queue order, hand tracks over without silence, and
//! remember where playback left off.
//!
//! **Architecture:** Single-stream audio pipeline using symphonia +
//! rubato + cpal, with a sqlite database for settings and resume
//! positions and a folder-derived library index.

pub mod audio;
pub mod config;
pub mod db;
pub mod error;
pub mod playback;
pub mod state;

pub use error::{Error, Result};
pub use playback::PlaybackEngine;
pub use state::SharedState;
