//! SQLite persistence: settings, resume positions, folder history

pub mod init;
pub mod positions;
pub mod settings;

pub use init::open_database;
pub use positions::{PositionStore, RecentFolder, MAX_RECENT_FOLDERS};
