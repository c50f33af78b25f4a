// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! GAP construction (writer side).
//!
//! Groups a sorted list of unavailable sequence numbers into as few GAP
//! submessages as possible: a contiguous run becomes
//! `[gap_start, gap_list.base - 1]`, and the numbers that follow within 256
//! of the list base are packed as bits.

use super::bitmap::{SequenceBitmapRange, BITMAP_MAX_BITS};
use super::messages::GapMsg;
use crate::core::guid::EntityId;

/// Build GAP submessages covering exactly `sequences`.
///
/// `sequences` must be sorted ascending; duplicates are ignored.
pub fn build_gaps(reader_id: EntityId, writer_id: EntityId, sequences: &[u64]) -> Vec<GapMsg> {
    let mut messages = Vec::new();
    let mut idx = 0usize;

    while idx < sequences.len() {
        let gap_start = sequences[idx];
        if gap_start == 0 {
            idx += 1;
            continue;
        }

        // Leading contiguous run.
        let mut run_end = gap_start;
        let mut j = idx + 1;
        while j < sequences.len() && sequences[j] <= run_end.saturating_add(1) {
            run_end = run_end.max(sequences[j]);
            j += 1;
        }

        let base = run_end.saturating_add(1);
        let window_end = base.saturating_add(u64::from(BITMAP_MAX_BITS));
        let mut gap_list = SequenceBitmapRange::new(base);
        while j < sequences.len() && sequences[j] < window_end {
            gap_list.add(sequences[j]);
            j += 1;
        }

        messages.push(GapMsg {
            reader_id,
            writer_id,
            gap_start,
            gap_list,
        });
        idx = j;
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITER: EntityId = [0, 0, 1, 0x02];
    const READER: EntityId = [0, 0, 1, 0x07];

    fn covered(gap: &GapMsg) -> Vec<u64> {
        let mut seqs: Vec<u64> = (gap.gap_start..gap.gap_list.base()).collect();
        seqs.extend(gap.gap_list.iter());
        seqs
    }

    #[test]
    fn test_build_gaps_single_run() {
        let gaps = build_gaps(READER, WRITER, &[4, 5, 6]);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].gap_start, 4);
        assert_eq!(gaps[0].gap_list.base(), 7);
        assert!(gaps[0].gap_list.is_empty());
        assert_eq!(covered(&gaps[0]), vec![4, 5, 6]);
    }

    #[test]
    fn test_build_gaps_sparse_fits_in_one() {
        let gaps = build_gaps(READER, WRITER, &[2, 3, 9, 12]);
        assert_eq!(gaps.len(), 1);
        assert_eq!(covered(&gaps[0]), vec![2, 3, 9, 12]);
        assert_eq!(gaps[0].irrelevant_count(), 4);
    }

    #[test]
    fn test_build_gaps_splits_beyond_window() {
        let gaps = build_gaps(READER, WRITER, &[1, 100, 600]);
        assert_eq!(gaps.len(), 2);
        assert_eq!(covered(&gaps[0]), vec![1, 100]);
        assert_eq!(covered(&gaps[1]), vec![600]);
    }

    #[test]
    fn test_build_gaps_empty() {
        assert!(build_gaps(READER, WRITER, &[]).is_empty());
    }
}
