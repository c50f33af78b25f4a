// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-width bitmap over a window of sequence (or fragment) numbers.
//!
//! Wire layout follows RTPS `SequenceNumberSet` / `FragmentNumberSet`:
//! up to 256 bits in 8 x u32 words, bit for offset `d` stored at
//! `word[d / 32] & (1 << (31 - d % 32))` (most significant bit first).
//!
//! ```text
//! base = 10, items {10, 12, 41}
//!
//! word[0]: 1010 0000 ... 0000   offsets 0 and 2
//! word[0]: .... .... ... ...1   offset 31 -> seq 41
//! num_bits = 32
//! ```

use std::fmt;

/// Maximum number of bits in a set (RTPS v2.5 Sec.9.4.2.6).
pub const BITMAP_MAX_BITS: u32 = 256;
/// Bits per bitmap word.
pub const WORD_BITS: u32 = 32;
/// Number of words for 256 bits.
pub const BITMAP_WORDS: usize = 8;

/// Bitmap window `[base, base + 255]`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitmapRange {
    base: u64,
    num_bits: u32,
    bitmap: [u32; BITMAP_WORDS],
}

/// Missing-sequence set of ACKNACK / gap list of GAP.
pub type SequenceBitmapRange = BitmapRange;

/// Missing-fragment set of NACK_FRAG (fragment numbers start at 1).
pub type FragmentNumberSet = BitmapRange;

impl BitmapRange {
    /// Empty set with the given base.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            num_bits: 0,
            bitmap: [0; BITMAP_WORDS],
        }
    }

    /// Build from items, ignoring those outside the window.
    pub fn from_items<I>(base: u64, items: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let mut set = Self::new(base);
        for item in items {
            set.add(item);
        }
        set
    }

    /// Rebuild from wire words. `None` when `num_bits` exceeds 256, when
    /// too few words are supplied, or when bits are set beyond `num_bits`.
    pub fn from_words(base: u64, num_bits: u32, words: &[u32]) -> Option<Self> {
        if num_bits > BITMAP_MAX_BITS {
            return None;
        }
        let used = words_for(num_bits);
        if words.len() < used {
            return None;
        }
        let mut set = Self::new(base);
        set.bitmap[..used].copy_from_slice(&words[..used]);
        if num_bits % WORD_BITS != 0 && used > 0 {
            let tail_mask = u32::MAX << (WORD_BITS - num_bits % WORD_BITS);
            if set.bitmap[used - 1] & !tail_mask != 0 {
                return None;
            }
        }
        // Wire numBits may overshoot the highest set bit.
        set.recompute_num_bits();
        Some(set)
    }

    /// First number of the window.
    #[inline]
    #[must_use]
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Last number representable in the window.
    #[inline]
    #[must_use]
    pub fn max_allowed(&self) -> u64 {
        self.base.saturating_add(u64::from(BITMAP_MAX_BITS - 1))
    }

    /// Wire `numBits`: offset of the highest set item plus one.
    #[inline]
    #[must_use]
    pub fn num_bits(&self) -> u32 {
        self.num_bits
    }

    /// Words covering `num_bits` (what goes on the wire).
    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.bitmap[..words_for(self.num_bits)]
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.num_bits == 0
    }

    /// Number of items set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words().iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Reset the bitmap and move the window.
    pub fn set_base(&mut self, new_base: u64) {
        self.base = new_base;
        self.num_bits = 0;
        self.bitmap = [0; BITMAP_WORDS];
    }

    /// Move the window, keeping the items that remain representable.
    pub fn shift_base(&mut self, new_base: u64) {
        if new_base == self.base {
            return;
        }
        let previous = *self;
        self.set_base(new_base);
        previous.for_each(|item| {
            self.add(item);
        });
    }

    /// Set `item`. Returns `false` when it falls outside the window.
    pub fn add(&mut self, item: u64) -> bool {
        let Some(offset) = self.offset_of(item) else {
            return false;
        };
        let (word, mask) = position(offset);
        self.bitmap[word] |= mask;
        if offset >= self.num_bits {
            self.num_bits = offset + 1;
        }
        true
    }

    /// Set every item of `[from, to)` that falls inside the window.
    pub fn add_range(&mut self, from: u64, to: u64) {
        let start = from.max(self.base);
        let end = to.min(self.max_allowed().saturating_add(1));
        for item in start..end {
            self.add(item);
        }
    }

    /// Clear `item` if present.
    pub fn remove(&mut self, item: u64) {
        let Some(offset) = self.offset_of(item) else {
            return;
        };
        if offset >= self.num_bits {
            return;
        }
        let (word, mask) = position(offset);
        self.bitmap[word] &= !mask;
        if offset + 1 == self.num_bits {
            self.recompute_num_bits();
        }
    }

    #[must_use]
    pub fn is_set(&self, item: u64) -> bool {
        match self.offset_of(item) {
            Some(offset) if offset < self.num_bits => {
                let (word, mask) = position(offset);
                self.bitmap[word] & mask != 0
            }
            _ => false,
        }
    }

    /// Lowest item set.
    #[must_use]
    pub fn min(&self) -> Option<u64> {
        for (i, word) in self.words().iter().enumerate() {
            if *word != 0 {
                let offset = i as u32 * WORD_BITS + word.leading_zeros();
                return Some(self.base + u64::from(offset));
            }
        }
        None
    }

    /// Highest item set.
    #[must_use]
    pub fn max(&self) -> Option<u64> {
        if self.num_bits == 0 {
            None
        } else {
            Some(self.base + u64::from(self.num_bits - 1))
        }
    }

    /// Visit items in ascending order.
    ///
    /// Each word is scanned most-significant bit first, which is ascending
    /// order given the wire layout.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u64),
    {
        for (i, word) in self.words().iter().enumerate() {
            let mut bits = *word;
            while bits != 0 {
                let lz = bits.leading_zeros();
                f(self.base + u64::from(i as u32 * WORD_BITS + lz));
                bits &= !(0x8000_0000u32 >> lz);
            }
        }
    }

    /// Ascending iterator over set items.
    pub fn iter(&self) -> BitmapIter<'_> {
        BitmapIter {
            set: self,
            word: 0,
            bits: self.bitmap[0],
        }
    }

    fn offset_of(&self, item: u64) -> Option<u32> {
        if item < self.base {
            return None;
        }
        let diff = item - self.base;
        if diff >= u64::from(BITMAP_MAX_BITS) {
            return None;
        }
        Some(diff as u32)
    }

    fn recompute_num_bits(&mut self) {
        self.num_bits = 0;
        for i in (0..BITMAP_WORDS).rev() {
            let word = self.bitmap[i];
            if word != 0 {
                self.num_bits = i as u32 * WORD_BITS + (WORD_BITS - word.trailing_zeros());
                return;
            }
        }
    }
}

impl Default for BitmapRange {
    fn default() -> Self {
        Self::new(1)
    }
}

impl fmt::Debug for BitmapRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapRange")
            .field("base", &self.base)
            .field("num_bits", &self.num_bits)
            .field("items", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

/// Iterator returned by [`BitmapRange::iter`].
pub struct BitmapIter<'a> {
    set: &'a BitmapRange,
    word: usize,
    bits: u32,
}

impl Iterator for BitmapIter<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let used = words_for(self.set.num_bits);
        loop {
            if self.word >= used {
                return None;
            }
            if self.bits != 0 {
                let lz = self.bits.leading_zeros();
                self.bits &= !(0x8000_0000u32 >> lz);
                return Some(self.set.base + u64::from(self.word as u32 * WORD_BITS + lz));
            }
            self.word += 1;
            if self.word < BITMAP_WORDS {
                self.bits = self.set.bitmap[self.word];
            }
        }
    }
}

#[inline]
fn position(offset: u32) -> (usize, u32) {
    let word = (offset / WORD_BITS) as usize;
    let bit = offset % WORD_BITS;
    (word, 1u32 << (31 - bit))
}

#[inline]
fn words_for(num_bits: u32) -> usize {
    num_bits.div_ceil(WORD_BITS) as usize
}
