//! Recursive audio file discovery
//!
//! Walks a folder tree without following symlinks, skips hidden entries,
//! filters by an extension allow-list, then verifies magic bytes so a
//! misnamed file never reaches the decoder. Per-entry failures become
//! warnings; only a missing or non-directory root aborts the scan.

use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Folder scan errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified folder does not exist
    #[error("Folder not found: {0}")]
    FolderNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a folder: {0}")]
    NotAFolder(PathBuf),

    /// Cannot access file
    #[error("File access error {0}: {1}")]
    FileAccess(PathBuf, String),

    /// Background scan task aborted
    #[error("Scan task aborted: {0}")]
    TaskAborted(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One audio file discovered by a scan
///
/// `mtime` is the modification time observed at listing time; it keys the
/// metadata cache and feeds the folder signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub mtime: SystemTime,
}

/// Per-file problem recorded during a scan instead of aborting it
#[derive(Debug, Clone)]
pub struct ScanWarning {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of enumerating a folder
#[derive(Debug, Clone)]
pub struct FolderListing {
    pub root: PathBuf,
    /// Audio files in deterministic (case-insensitive path) order
    pub entries: Vec<FileEntry>,
    pub warnings: Vec<ScanWarning>,
    /// SHA-256 over the sorted (path, mtime) pairs; equal means unchanged
    pub signature: String,
}

/// Recursive folder scanner
#[derive(Debug, Clone)]
pub struct FolderScanner {
    max_depth: Option<usize>,
}

impl FolderScanner {
    pub fn new() -> Self {
        Self { max_depth: None }
    }

    /// Enumerate the audio files under `root`.
    ///
    /// Traversal is sequential because the symlink-loop guard is mutable
    /// state; verification is a 12-byte read per candidate. Entries come
    /// back sorted case-insensitively so the ordering is stable across
    /// platforms and rescans.
    pub fn scan(&self, root: &Path) -> Result<FolderListing, ScanError> {
        if !root.exists() {
            return Err(ScanError::FolderNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(ScanError::NotAFolder(root.to_path_buf()));
        }

        let mut entries = Vec::new();
        let mut warnings = Vec::new();
        let mut symlink_visited = HashSet::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| should_descend(e, &mut symlink_visited));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    warnings.push(ScanWarning {
                        path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if !has_audio_extension(path) {
                continue;
            }

            match self.verify_magic_bytes(path) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("Not recognized as audio: {}", path.display());
                    warnings.push(ScanWarning {
                        path: path.to_path_buf(),
                        reason: "content does not match an audio format".to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Error verifying {}: {}", path.display(), e);
                    warnings.push(ScanWarning {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }

            match entry.metadata().map_err(|e| e.to_string()).and_then(|m| {
                m.modified().map_err(|e| e.to_string())
            }) {
                Ok(mtime) => entries.push(FileEntry {
                    path: path.to_path_buf(),
                    mtime,
                }),
                Err(reason) => {
                    tracing::warn!("Cannot stat {}: {}", path.display(), reason);
                    warnings.push(ScanWarning {
                        path: path.to_path_buf(),
                        reason,
                    });
                }
            }
        }

        entries.sort_by(|a, b| {
            let ka = a.path.to_string_lossy().to_lowercase();
            let kb = b.path.to_string_lossy().to_lowercase();
            ka.cmp(&kb).then_with(|| a.path.cmp(&b.path))
        });

        let signature = listing_signature(&entries);

        tracing::debug!(
            root = %root.display(),
            files = entries.len(),
            warnings = warnings.len(),
            "Folder scan complete"
        );

        Ok(FolderListing {
            root: root.to_path_buf(),
            entries,
            warnings,
            signature,
        })
    }

    /// Verify file content using magic bytes
    fn verify_magic_bytes(&self, path: &Path) -> Result<bool, ScanError> {
        let mut file = File::open(path)
            .map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;

        let mut buffer = [0u8; 12];
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ScanError::FileAccess(path.to_path_buf(), e.to_string()))?;

        if bytes_read < 4 {
            return Ok(false); // Too small to be audio
        }

        let is_audio = match &buffer[..bytes_read.min(12)] {
            // MP3
            [0xFF, 0xFB, ..] | [0xFF, 0xF3, ..] | [0xFF, 0xF2, ..] => true,
            [b'I', b'D', b'3', ..] => true, // MP3 with ID3 tag

            // FLAC
            [b'f', b'L', b'a', b'C', ..] => true,

            // OGG Vorbis
            [b'O', b'g', b'g', b'S', ..] => true,

            // M4A (MP4 container)
            [_, _, _, _, b'f', b't', b'y', b'p', ..] => true,

            // WAV
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'A', b'V', b'E'] => true,

            _ => false,
        };

        Ok(is_audio)
    }
}

impl Default for FolderScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Keep an entry out of the walk when it is hidden or a symlink loop
fn should_descend(entry: &DirEntry, symlink_visited: &mut HashSet<PathBuf>) -> bool {
    // The root itself is depth 0 and always descends, even if its own
    // name starts with a dot.
    if entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.') {
        return false;
    }

    if entry.file_type().is_symlink() {
        if let Ok(canonical) = entry.path().canonicalize() {
            if !symlink_visited.insert(canonical) {
                tracing::warn!("Symlink loop detected: {}", entry.path().display());
                return false;
            }
        }
    }

    true
}

fn has_audio_extension(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            matches!(
                ext.to_string_lossy().to_lowercase().as_str(),
                "mp3" | "wav" | "flac" | "ogg" | "m4a"
            )
        })
        .unwrap_or(false)
}

fn listing_signature(entries: &[FileEntry]) -> String {
    let mut hasher = Sha256::new();
    for entry in entries {
        hasher.update(entry.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let since_epoch = entry
            .mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default();
        hasher.update(since_epoch.as_nanos().to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}
