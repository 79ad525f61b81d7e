// Dense bit vector with lock-free concurrent set
// Used for solid-edge bitmaps and node deletion marks

use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

/// A fixed-size bit vector whose bits can be set concurrently from many
/// threads without locking. `set` is an atomic OR at word granularity, so
/// concurrent sets of the same bit are idempotent and sets of different bits
/// in the same word never lose updates.
///
/// Visibility across a parallel pass is provided by the pass's own join;
/// individual operations use relaxed ordering.
#[derive(Debug, Default)]
pub struct AtomicBitVector {
    words: Vec<AtomicU64>,
    len: usize,
}

impl AtomicBitVector {
    /// Create an empty vector. Call `reset` to size it.
    pub fn new() -> Self {
        AtomicBitVector {
            words: Vec::new(),
            len: 0,
        }
    }

    /// Create a vector of `len` zeroed bits.
    pub fn with_len(len: usize) -> Self {
        let mut v = AtomicBitVector::new();
        v.reset(len);
        v
    }

    /// Resize to `len` bits, all zero. Existing contents are discarded.
    pub fn reset(&mut self, len: usize) {
        let num_words = len.div_ceil(BITS_PER_WORD);
        self.words.clear();
        self.words.resize_with(num_words, || AtomicU64::new(0));
        self.len = len;
    }

    /// Number of bits.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `idx`.
    #[inline]
    pub fn get(&self, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        let word = self.words[idx / BITS_PER_WORD].load(Ordering::Relaxed);
        (word >> (idx % BITS_PER_WORD)) & 1 == 1
    }

    /// Set bit `idx`. Safe to call concurrently with other `get`/`set`.
    #[inline]
    pub fn set(&self, idx: usize) {
        debug_assert!(idx < self.len);
        self.words[idx / BITS_PER_WORD].fetch_or(1 << (idx % BITS_PER_WORD), Ordering::Relaxed);
    }

    /// Exchange storage with another vector. Swapping with an empty vector
    /// is the cheap way to release the backing memory.
    pub fn swap(&mut self, other: &mut AtomicBitVector) {
        std::mem::swap(&mut self.words, &mut other.words);
        std::mem::swap(&mut self.len, &mut other.len);
    }

    /// Count of set bits.
    pub fn count_ones(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}
