// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence number generation for writers
//!
//! Per-writer monotonic sequence numbering. Numbers start at 1, are never
//! reused, and keep increasing even when the history evicts or purges
//! samples. Readable without the writer lock so heartbeats and
//! `get_unacked_count` can see the last assigned number cheaply.

use std::sync::atomic::{AtomicU64, Ordering};

/// Sequence number generator (per-writer).
#[derive(Debug)]
pub struct SeqNumGenerator {
    /// Next sequence number to assign (RTPS: sequence numbers start at 1).
    next: AtomicU64,
}

impl SeqNumGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next sequence number.
    #[inline]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Number the next `next()` call will return.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Highest number handed out so far (0 before the first write).
    #[inline]
    #[must_use]
    pub fn last_assigned(&self) -> u64 {
        self.peek() - 1
    }
}

impl Default for SeqNumGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_seq_starts_at_one() {
        let gen = SeqNumGenerator::new();
        assert_eq!(gen.last_assigned(), 0);
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.last_assigned(), 2);
        assert_eq!(gen.peek(), 3);
    }

    #[test]
    fn test_seq_unique_across_threads() {
        let gen = Arc::new(SeqNumGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gen = Arc::clone(&gen);
                thread::spawn(move || (0..1000).map(|_| gen.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread should not panic"))
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 4000);
        assert_eq!(all.first(), Some(&1));
        assert_eq!(all.last(), Some(&4000));
    }
}
