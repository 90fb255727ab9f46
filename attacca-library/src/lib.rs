//! # Attacca Library
//!
//! Folder-derived music library:
//! - Recursive folder scanning with magic-byte verification
//! - Tag/art extraction via lofty
//! - Metadata cache keyed by (path, mtime)
//! - Immutable, ordered library indexes with cheap change detection

pub mod cache;
pub mod index;
pub mod metadata;
pub mod scanner;

pub use cache::{CacheStats, MetadataCache};
pub use index::{Library, LibraryIndex};
pub use metadata::{MetadataError, MetadataExtractor};
pub use scanner::{FileEntry, FolderListing, FolderScanner, ScanError, ScanWarning};
