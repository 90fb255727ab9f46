//! Metadata cache keyed by (path, mtime)
//!
//! Entries never mutate: a changed file shows up under a new mtime, which
//! is a new key, and the old entry simply stops being consulted. Lookups
//! and inserts share one narrow mutex; values are `Arc<Track>` so a hit
//! costs a pointer clone.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use attacca_common::Track;

/// Counters for diagnostics and scan verification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Completed extractions inserted into the cache
    pub extractions: u64,
}

#[derive(Default)]
pub struct MetadataCache {
    entries: Mutex<HashMap<(PathBuf, SystemTime), Arc<Track>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    extractions: AtomicU64,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the track for this exact file version.
    pub fn get(&self, path: &Path, mtime: SystemTime) -> Option<Arc<Track>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&(path.to_path_buf(), mtime)) {
            Some(track) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(track.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Record a freshly extracted track.
    ///
    /// Idempotent upsert: re-inserting the same key overwrites with an
    /// equivalent value, so racing extractions of one file are harmless.
    pub fn insert(&self, track: Arc<Track>) {
        let key = (track.path.clone(), track.mtime);
        self.entries.lock().unwrap().insert(key, track);
        self.extractions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            extractions: self.extractions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample_track(path: &str, mtime: SystemTime) -> Arc<Track> {
        Arc::new(Track {
            path: PathBuf::from(path),
            duration_ms: 180_000,
            title: "title".to_string(),
            artist: "artist".to_string(),
            album: "album".to_string(),
            track_number: Some(1),
            year: None,
            sample_rate: Some(44_100),
            channels: Some(2),
            art: None,
            replay_gain_db: None,
            mtime,
        })
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = MetadataCache::new();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        cache.insert(sample_track("/music/a.mp3", mtime));

        assert!(cache.get(Path::new("/music/a.mp3"), mtime).is_some());
        assert!(cache.get(Path::new("/music/b.mp3"), mtime).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.extractions, 1);
    }

    #[test]
    fn changed_mtime_is_a_different_key() {
        let cache = MetadataCache::new();
        let old = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let new = old + Duration::from_secs(60);
        cache.insert(sample_track("/music/a.mp3", old));

        assert!(cache.get(Path::new("/music/a.mp3"), new).is_none());
        assert!(cache.get(Path::new("/music/a.mp3"), old).is_some());

        cache.insert(sample_track("/music/a.mp3", new));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reinsert_is_idempotent() {
        let cache = MetadataCache::new();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        cache.insert(sample_track("/music/a.mp3", mtime));
        cache.insert(sample_track("/music/a.mp3", mtime));
        assert_eq!(cache.len(), 1);
    }
}
