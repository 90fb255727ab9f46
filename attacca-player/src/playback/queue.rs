//! Track queue: ordered/shuffled cursor over a library index
//!
//! The queue owns a permutation of the index positions (`order`), a
//! cursor into it, and a bounded history of departed tracks for
//! retreat. Shuffle regenerates the permutation; repeat-all wraps the
//! cursor, regenerating the permutation at the wrap when shuffled so a
//! new pass never opens with the track that just closed the old one.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::debug;

use attacca_common::{RepeatMode, Track};
use attacca_library::LibraryIndex;

/// Retreat history bound
pub const HISTORY_LIMIT: usize = 50;

/// Ordered, optionally shuffled playback cursor over one index snapshot
pub struct TrackQueue {
    index: Arc<LibraryIndex>,
    /// Permutation of index positions defining play order
    order: Vec<usize>,
    /// Position in `order`; None before the first advance (or empty)
    cursor: Option<usize>,
    /// Departed index positions, oldest first, bounded
    history: VecDeque<usize>,
    shuffle: bool,
    repeat: RepeatMode,
    /// Wrap permutation staged by `peek_next` so the following
    /// `advance` commits the identical answer
    pending_wrap: Option<Vec<usize>>,
}

impl TrackQueue {
    pub fn new(index: Arc<LibraryIndex>, shuffle: bool, repeat: RepeatMode) -> Self {
        let order = if shuffle {
            shuffled_order(index.len(), None)
        } else {
            (0..index.len()).collect()
        };
        Self {
            index,
            order,
            cursor: None,
            history: VecDeque::new(),
            shuffle,
            repeat,
            pending_wrap: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn shuffle_enabled(&self) -> bool {
        self.shuffle
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat
    }

    pub fn index(&self) -> &Arc<LibraryIndex> {
        &self.index
    }

    /// The current track, if any
    pub fn current(&self) -> Option<Arc<Track>> {
        let pos = self.cursor?;
        self.track_at(self.order[pos])
    }

    /// Index position (into the library index) of the current track
    pub fn current_index(&self) -> Option<usize> {
        self.cursor.map(|pos| self.order[pos])
    }

    /// Move to the next track per repeat/shuffle policy.
    ///
    /// Returns None only on an empty queue, or at the end of the pass
    /// with repeat off (the cursor stays put so the current track
    /// remains current).
    pub fn advance(&mut self) -> Option<Arc<Track>> {
        if self.is_empty() {
            return None;
        }

        let Some(pos) = self.cursor else {
            // First engagement: start the pass
            self.cursor = Some(0);
            return self.track_at(self.order[0]);
        };

        if self.repeat == RepeatMode::One {
            return self.track_at(self.order[pos]);
        }

        if pos + 1 < self.order.len() {
            self.push_history(self.order[pos]);
            self.cursor = Some(pos + 1);
            return self.track_at(self.order[pos + 1]);
        }

        // End of pass
        if self.repeat != RepeatMode::All {
            return None;
        }

        let departed = self.order[pos];
        self.push_history(departed);
        if self.shuffle {
            self.order = match self.pending_wrap.take() {
                Some(staged) => staged,
                None => shuffled_order(self.index.len(), Some(departed)),
            };
            debug!("Queue wrapped with a fresh shuffle order");
        } else {
            self.pending_wrap = None;
        }
        self.cursor = Some(0);
        self.track_at(self.order[0])
    }

    /// What `advance` would return, without committing.
    ///
    /// A peek that lands on a shuffled repeat-all wrap stages the
    /// regenerated permutation, so prefetch and the later advance agree.
    pub fn peek_next(&mut self) -> Option<Arc<Track>> {
        if self.is_empty() {
            return None;
        }

        let Some(pos) = self.cursor else {
            return self.track_at(self.order[0]);
        };

        if self.repeat == RepeatMode::One {
            return self.track_at(self.order[pos]);
        }

        if pos + 1 < self.order.len() {
            return self.track_at(self.order[pos + 1]);
        }

        if self.repeat != RepeatMode::All {
            return None;
        }

        if self.shuffle {
            if self.pending_wrap.is_none() {
                self.pending_wrap =
                    Some(shuffled_order(self.index.len(), Some(self.order[pos])));
            }
            let staged = self.pending_wrap.as_ref()?;
            self.track_at(staged[0])
        } else {
            self.track_at(self.order[0])
        }
    }

    /// Step back to the previously played track.
    ///
    /// Prefers the history (exact reverse of what actually played, in
    /// both modes); with an empty history a sequential queue steps the
    /// cursor back, a shuffled one returns None.
    pub fn retreat(&mut self) -> Option<Arc<Track>> {
        if self.is_empty() {
            return None;
        }

        if self.repeat == RepeatMode::One {
            let pos = self.cursor?;
            return self.track_at(self.order[pos]);
        }

        if let Some(previous) = self.history.pop_back() {
            let pos = self.order.iter().position(|&idx| idx == previous)?;
            self.cursor = Some(pos);
            return self.track_at(previous);
        }

        if !self.shuffle {
            if let Some(pos) = self.cursor {
                if pos > 0 {
                    self.cursor = Some(pos - 1);
                    return self.track_at(self.order[pos - 1]);
                }
            }
        }

        None
    }

    /// Jump to a specific track by its index position
    pub fn select(&mut self, index_pos: usize) -> Option<Arc<Track>> {
        let pos = self.order.iter().position(|&idx| idx == index_pos)?;
        if let Some(current) = self.cursor {
            if current != pos {
                self.push_history(self.order[current]);
            }
        }
        self.cursor = Some(pos);
        self.pending_wrap = None;
        self.track_at(index_pos)
    }

    /// Toggle shuffle. The current track stays current; with shuffle on
    /// it leads a freshly shuffled remainder so the rest of the pass
    /// still visits every track.
    pub fn set_shuffle(&mut self, shuffle: bool) {
        if self.shuffle == shuffle {
            return;
        }
        self.shuffle = shuffle;
        self.pending_wrap = None;

        let current = self.current_index();
        if shuffle {
            self.order = current_first_order(self.index.len(), current);
            self.cursor = current.map(|_| 0);
        } else {
            self.order = (0..self.index.len()).collect();
            self.cursor = current;
        }
    }

    pub fn set_repeat(&mut self, repeat: RepeatMode) {
        self.repeat = repeat;
        self.pending_wrap = None;
    }

    /// Regenerate the shuffle permutation, keeping the current track
    /// current (it leads the new order).
    pub fn reshuffle(&mut self) {
        if !self.shuffle || self.is_empty() {
            return;
        }
        self.pending_wrap = None;
        let current = self.current_index();
        self.order = current_first_order(self.index.len(), current);
        self.cursor = current.map(|_| 0);
    }

    /// Swap in a refreshed index snapshot.
    ///
    /// The current track is preserved by path when it still exists; the
    /// history is cleared because its positions referred to the old
    /// index.
    pub fn rebind(&mut self, index: Arc<LibraryIndex>) {
        let current_path = self.current().map(|t| t.path.clone());
        self.index = index;
        self.history.clear();
        self.pending_wrap = None;

        let current = current_path.and_then(|p| self.index.position_of(&p));
        if self.shuffle {
            self.order = current_first_order(self.index.len(), current);
            self.cursor = current.map(|_| 0);
        } else {
            self.order = (0..self.index.len()).collect();
            self.cursor = current;
        }
    }

    fn track_at(&self, index_pos: usize) -> Option<Arc<Track>> {
        self.index.tracks.get(index_pos).cloned()
    }

    fn push_history(&mut self, index_pos: usize) {
        self.history.push_back(index_pos);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.history.len()
    }
}

/// Random permutation of 0..len. When `avoid_first` is given and the
/// queue holds more than one track, the permutation never opens with
/// that position.
fn shuffled_order(len: usize, avoid_first: Option<usize>) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = rand::thread_rng();
    order.shuffle(&mut rng);

    if len > 1 {
        if let Some(avoid) = avoid_first {
            if order[0] == avoid {
                let swap_with = 1 + rand::Rng::gen_range(&mut rng, 0..len - 1);
                order.swap(0, swap_with);
            }
        }
    }
    order
}

/// Shuffled permutation with a fixed leading position (the current
/// track keeps playing, the remainder is reshuffled behind it)
fn current_first_order(len: usize, current: Option<usize>) -> Vec<usize> {
    let Some(current) = current else {
        return shuffled_order(len, None);
    };
    let mut rest: Vec<usize> = (0..len).filter(|&i| i != current).collect();
    rest.shuffle(&mut rand::thread_rng());
    let mut order = Vec::with_capacity(len);
    order.push(current);
    order.extend(rest);
    order
}
