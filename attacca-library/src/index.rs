//! Library index: a folder turned into an ordered, cached track list
//!
//! An index is immutable once published; rescans produce a new index and
//! the previous one stays valid for any queue still holding it. Change
//! detection is by listing signature, so activating an unchanged folder
//! is a walk plus a hash, with zero metadata extractions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::RwLock;

use attacca_common::Track;

use crate::cache::{CacheStats, MetadataCache};
use crate::metadata::MetadataExtractor;
use crate::scanner::{FileEntry, FolderListing, FolderScanner, ScanError, ScanWarning};

/// Parallel metadata extraction width
const EXTRACT_WORKERS: usize = 4;

/// Ordered, cached view of one folder's audio files
#[derive(Debug, Clone)]
pub struct LibraryIndex {
    pub root: PathBuf,
    /// Tracks in listing order (case-insensitive path sort)
    pub tracks: Vec<Arc<Track>>,
    pub signature: String,
    pub scanned_at: DateTime<Utc>,
    pub warnings: Vec<ScanWarning>,
}

impl LibraryIndex {
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Position of a track in this index, by path identity.
    pub fn position_of(&self, path: &Path) -> Option<usize> {
        self.tracks.iter().position(|t| t.path == path)
    }
}

/// Folder scanning and index building service
pub struct Library {
    scanner: FolderScanner,
    cache: MetadataCache,
    current: RwLock<Option<Arc<LibraryIndex>>>,
}

impl Library {
    pub fn new() -> Self {
        Self {
            scanner: FolderScanner::new(),
            cache: MetadataCache::new(),
            current: RwLock::new(None),
        }
    }

    /// The most recently published index, if any.
    pub async fn current(&self) -> Option<Arc<LibraryIndex>> {
        self.current.read().await.clone()
    }

    /// Activate a folder: serve the existing index when the listing is
    /// unchanged, otherwise rebuild.
    pub async fn activate(&self, root: &Path) -> Result<Arc<LibraryIndex>, ScanError> {
        let listing = self.list(root).await?;

        let existing = self.current.read().await.clone();
        if let Some(existing) = existing {
            if existing.root == listing.root && existing.signature == listing.signature {
                tracing::debug!(
                    root = %listing.root.display(),
                    "Listing unchanged, serving existing index"
                );
                return Ok(existing);
            }
        }

        let index = self.build_index(listing).await;
        *self.current.write().await = Some(index.clone());
        Ok(index)
    }

    /// Re-enumerate the active folder and publish a fresh index.
    ///
    /// Unchanged files reuse cached metadata; only new or modified files
    /// are extracted. Removed files drop out of the new index.
    pub async fn refresh(&self, root: &Path) -> Result<Arc<LibraryIndex>, ScanError> {
        let listing = self.list(root).await?;
        let index = self.build_index(listing).await;
        *self.current.write().await = Some(index.clone());
        Ok(index)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn list(&self, root: &Path) -> Result<FolderListing, ScanError> {
        let root = root.to_path_buf();
        let scanner = self.scanner.clone();
        tokio::task::spawn_blocking(move || scanner.scan(&root))
            .await
            .map_err(|e| ScanError::TaskAborted(e.to_string()))?
    }

    async fn build_index(&self, listing: FolderListing) -> Arc<LibraryIndex> {
        let mut tracks: Vec<Option<Arc<Track>>> = vec![None; listing.entries.len()];
        let mut warnings = listing.warnings.clone();

        // Cache lookups are cheap and synchronous; only misses go to the
        // blocking pool.
        let mut pending: Vec<(usize, FileEntry)> = Vec::new();
        for (i, entry) in listing.entries.iter().enumerate() {
            match self.cache.get(&entry.path, entry.mtime) {
                Some(track) => tracks[i] = Some(track),
                None => pending.push((i, entry.clone())),
            }
        }

        let results = futures::stream::iter(pending.into_iter().map(|(i, entry)| {
            tokio::task::spawn_blocking(move || {
                let result = MetadataExtractor::new().extract(&entry.path, entry.mtime);
                (i, entry, result)
            })
        }))
        .buffer_unordered(EXTRACT_WORKERS)
        .collect::<Vec<_>>()
        .await;

        for joined in results {
            match joined {
                Ok((i, _entry, Ok(track))) => {
                    let track = Arc::new(track);
                    self.cache.insert(track.clone());
                    tracks[i] = Some(track);
                }
                Ok((_i, entry, Err(e))) => {
                    tracing::warn!(
                        file = %entry.path.display(),
                        error = %e,
                        "Metadata extraction failed, skipping file"
                    );
                    warnings.push(ScanWarning {
                        path: entry.path,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Extraction task aborted");
                    warnings.push(ScanWarning {
                        path: PathBuf::new(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        // Failed files leave holes; flattening preserves listing order
        // for the survivors.
        let tracks: Vec<Arc<Track>> = tracks.into_iter().flatten().collect();

        tracing::info!(
            root = %listing.root.display(),
            tracks = tracks.len(),
            warnings = warnings.len(),
            "Library index built"
        );

        Arc::new(LibraryIndex {
            root: listing.root,
            tracks,
            signature: listing.signature,
            scanned_at: Utc::now(),
            warnings,
        })
    }
}

impl Default for Library {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn write_wav(path: &Path, samples: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for n in 0..samples {
            writer.write_sample(((n % 80) as i16) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_becomes_warning_not_failure() {
        let dir = TempDir::new().unwrap();
        write_wav(&dir.path().join("a.wav"), 4_410);
        write_wav(&dir.path().join("b.wav"), 4_410);
        // Passes magic-byte verification, fails metadata parsing.
        fs::write(
            dir.path().join("corrupt.wav"),
            b"RIFF\x24\x00\x00\x00WAVEgarbage that is not a chunk",
        )
        .unwrap();

        let library = Library::new();
        let index = library.activate(dir.path()).await.unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.warnings.len(), 1);
        assert!(index.warnings[0].path.ends_with("corrupt.wav"));
        let names: Vec<_> = index
            .tracks
            .iter()
            .map(|t| t.title.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unchanged_folder_rescan_extracts_nothing() {
        let dir = TempDir::new().unwrap();
        write_wav(&dir.path().join("a.wav"), 4_410);
        write_wav(&dir.path().join("b.wav"), 4_410);

        let library = Library::new();
        let first = library.activate(dir.path()).await.unwrap();
        assert_eq!(library.cache_stats().extractions, 2);

        let second = library.activate(dir.path()).await.unwrap();
        assert_eq!(library.cache_stats().extractions, 2);
        assert!(Arc::ptr_eq(&first, &second));

        // An explicit refresh rebuilds the index but still serves
        // metadata from cache.
        let third = library.refresh(dir.path()).await.unwrap();
        assert_eq!(library.cache_stats().extractions, 2);
        assert!(!Arc::ptr_eq(&second, &third));
        let order: Vec<_> = third.tracks.iter().map(|t| t.title.clone()).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn modified_file_is_extracted_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 4_410);

        let library = Library::new();
        library.activate(dir.path()).await.unwrap();
        assert_eq!(library.cache_stats().extractions, 1);

        // Rewrite with different content so the mtime moves past
        // filesystem timestamp granularity.
        std::thread::sleep(Duration::from_millis(20));
        write_wav(&path, 8_820);

        let index = library.activate(dir.path()).await.unwrap();
        assert_eq!(library.cache_stats().extractions, 2);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn removed_file_drops_out_of_the_index() {
        let dir = TempDir::new().unwrap();
        write_wav(&dir.path().join("a.wav"), 4_410);
        write_wav(&dir.path().join("b.wav"), 4_410);

        let library = Library::new();
        let first = library.activate(dir.path()).await.unwrap();
        assert_eq!(first.len(), 2);

        fs::remove_file(dir.path().join("a.wav")).unwrap();
        let second = library.activate(dir.path()).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second.tracks[0].title, "b");
        // The old index is unaffected.
        assert_eq!(first.len(), 2);
    }

    #[tokio::test]
    async fn position_of_finds_tracks_by_path() {
        let dir = TempDir::new().unwrap();
        write_wav(&dir.path().join("a.wav"), 4_410);
        write_wav(&dir.path().join("b.wav"), 4_410);

        let library = Library::new();
        let index = library.activate(dir.path()).await.unwrap();

        assert_eq!(index.position_of(&index.tracks[1].path), Some(1));
        assert_eq!(index.position_of(Path::new("/missing.wav")), None);
    }
}
