// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DATA_FRAG fragmentation and reassembly.
//!
//! Writers split samples larger than `fragment_size` into one DATA_FRAG per
//! fragment. Readers collect fragments per sequence number in a
//! [`FragmentAssembler`]; partially received samples are repaired with
//! NACK_FRAG instead of a full ACKNACK request.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use super::bitmap::{FragmentNumberSet, BITMAP_MAX_BITS};
use super::change::{CacheChange, ChangeKind, KeyHash, SampleIdentity};
use super::messages::DataFragMsg;
use crate::core::guid::EntityId;

/// Number of fragments for a sample (at least 1).
#[must_use]
pub fn fragment_count(sample_size: usize, fragment_size: usize) -> u32 {
    if fragment_size == 0 {
        return 0;
    }
    let count = sample_size.div_ceil(fragment_size).max(1);
    u32::try_from(count).unwrap_or(u32::MAX)
}

/// Byte range of fragment `fragment` (1-based) inside the sample.
#[must_use]
pub fn fragment_bounds(
    fragment: u32,
    fragment_size: usize,
    sample_size: usize,
) -> Option<Range<usize>> {
    if fragment == 0 || fragment_size == 0 {
        return None;
    }
    let start = (fragment as usize - 1).checked_mul(fragment_size)?;
    if start >= sample_size {
        return None;
    }
    Some(start..(start + fragment_size).min(sample_size))
}

/// Split a change into DATA_FRAG submessages, one fragment each.
///
/// With `only`, emits just the listed fragments (NACK_FRAG repair).
pub fn split_change(
    change: &CacheChange,
    reader_id: EntityId,
    writer_id: EntityId,
    fragment_size: usize,
    only: Option<&FragmentNumberSet>,
) -> Vec<DataFragMsg> {
    let sample_size = change.payload_len();
    let Ok(wire_fragment_size) = u16::try_from(fragment_size) else {
        return Vec::new();
    };
    let Ok(wire_sample_size) = u32::try_from(sample_size) else {
        return Vec::new();
    };
    let total = fragment_count(sample_size, fragment_size);

    (1..=total)
        .filter(|n| only.map_or(true, |set| set.is_set(u64::from(*n))))
        .filter_map(|n| {
            let bounds = fragment_bounds(n, fragment_size, sample_size)?;
            Some(DataFragMsg {
                reader_id,
                writer_id,
                seq: change.sequence_number,
                fragment_start: n,
                fragments_in_submessage: 1,
                fragment_size: wire_fragment_size,
                sample_size: wire_sample_size,
                kind: change.kind,
                instance_key: change.instance_key,
                source_timestamp: change.source_timestamp,
                related_sample_id: change.related_sample_id,
                payload: Arc::from(&change.payload[bounds]),
            })
        })
        .collect()
}

/// Sample rebuilt from all of its fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledSample {
    pub seq: u64,
    pub kind: ChangeKind,
    pub instance_key: KeyHash,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    pub payload: Vec<u8>,
}

/// Result of feeding one DATA_FRAG to the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentOutcome {
    Complete(AssembledSample),
    Pending,
    /// First fragment announces a sample larger than the reader can hold.
    /// Nothing is allocated for it.
    TooLarge { size: usize, max: usize },
    /// Inconsistent with earlier fragments, duplicate, or no room.
    Dropped,
}

#[derive(Debug)]
struct PartialSample {
    sample_size: usize,
    fragment_size: usize,
    received: Vec<bool>,
    received_count: u32,
    buffer: Vec<u8>,
    kind: ChangeKind,
    instance_key: KeyHash,
    source_timestamp: SystemTime,
    related_sample_id: Option<SampleIdentity>,
    started_at: Instant,
}

impl PartialSample {
    fn total(&self) -> u32 {
        self.received.len() as u32
    }

    fn missing(&self) -> FragmentNumberSet {
        let first = self
            .received
            .iter()
            .position(|got| !got)
            .map_or(self.total() + 1, |idx| idx as u32 + 1);
        let mut set = FragmentNumberSet::new(u64::from(first));
        let window_end = first.saturating_add(BITMAP_MAX_BITS).min(self.total() + 1);
        for n in first..window_end {
            if !self.received[(n - 1) as usize] {
                set.add(u64::from(n));
            }
        }
        set
    }
}

/// Per-writer reassembly of fragmented samples.
#[derive(Debug)]
pub struct FragmentAssembler {
    pending: BTreeMap<u64, PartialSample>,
    max_pending: usize,
    max_sample_size: usize,
}

impl FragmentAssembler {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            max_sample_size: usize::MAX,
        }
    }

    /// Refuse samples whose announced size exceeds `max` bytes.
    pub fn set_max_sample_size(&mut self, max: usize) {
        self.max_sample_size = max;
    }

    #[must_use]
    pub fn max_sample_size(&self) -> usize {
        self.max_sample_size
    }

    /// Feed one DATA_FRAG.
    ///
    /// When `max_pending` partial samples are already in flight, a fragment of
    /// a lower sequence number displaces the highest pending one; otherwise
    /// it is dropped.
    pub fn insert(&mut self, frag: &DataFragMsg, now: Instant) -> FragmentOutcome {
        let fragment_size = usize::from(frag.fragment_size);
        let sample_size = frag.sample_size as usize;

        if !self.pending.contains_key(&frag.seq) {
            if sample_size > self.max_sample_size {
                return FragmentOutcome::TooLarge {
                    size: sample_size,
                    max: self.max_sample_size,
                };
            }
            if self.pending.len() >= self.max_pending {
                match self.pending.keys().next_back().copied() {
                    Some(highest) if highest > frag.seq => {
                        log::debug!(
                            "[fragment] dropping partial seq={} for lower seq={}",
                            highest,
                            frag.seq
                        );
                        self.pending.remove(&highest);
                    }
                    _ => return FragmentOutcome::Dropped,
                }
            }
            let total = fragment_count(sample_size, fragment_size) as usize;
            self.pending.insert(
                frag.seq,
                PartialSample {
                    sample_size,
                    fragment_size,
                    received: vec![false; total],
                    received_count: 0,
                    buffer: vec![0u8; sample_size],
                    kind: frag.kind,
                    instance_key: frag.instance_key,
                    source_timestamp: frag.source_timestamp,
                    related_sample_id: frag.related_sample_id,
                    started_at: now,
                },
            );
        }

        let Some(partial) = self.pending.get_mut(&frag.seq) else {
            return FragmentOutcome::Dropped;
        };
        if partial.sample_size != sample_size || partial.fragment_size != fragment_size {
            log::warn!(
                "[fragment] seq={} changed geometry mid-sample, dropping fragment",
                frag.seq
            );
            return FragmentOutcome::Dropped;
        }

        let mut offset = 0usize;
        let mut accepted = false;
        for n in frag.fragment_start..=frag.fragment_end() {
            let Some(bounds) = fragment_bounds(n, fragment_size, sample_size) else {
                break;
            };
            let len = bounds.len();
            let Some(chunk) = frag.payload.get(offset..offset + len) else {
                break;
            };
            offset += len;
            let idx = (n - 1) as usize;
            if partial.received[idx] {
                continue;
            }
            partial.buffer[bounds].copy_from_slice(chunk);
            partial.received[idx] = true;
            partial.received_count += 1;
            accepted = true;
        }

        if partial.received_count < partial.total() {
            return if accepted {
                FragmentOutcome::Pending
            } else {
                FragmentOutcome::Dropped
            };
        }

        match self.pending.remove(&frag.seq) {
            Some(done) => FragmentOutcome::Complete(AssembledSample {
                seq: frag.seq,
                kind: done.kind,
                instance_key: done.instance_key,
                source_timestamp: done.source_timestamp,
                related_sample_id: done.related_sample_id,
                payload: done.buffer,
            }),
            None => FragmentOutcome::Dropped,
        }
    }

    /// Missing fragments of a partially received sample.
    #[must_use]
    pub fn missing(&self, seq: u64) -> Option<FragmentNumberSet> {
        self.pending.get(&seq).map(PartialSample::missing)
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    /// Sequence numbers with partial data, ascending.
    pub fn pending_seqs(&self) -> impl Iterator<Item = u64> + '_ {
        self.pending.keys().copied()
    }

    /// When the oldest partial sample started.
    #[must_use]
    pub fn oldest_started(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.started_at).min()
    }

    pub fn remove(&mut self, seq: u64) {
        self.pending.remove(&seq);
    }

    /// Forget every partial sample at or below `seq`.
    pub fn discard_through(&mut self, seq: u64) {
        self.pending = self.pending.split_off(&seq.saturating_add(1));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::GUID;

    const WRITER: EntityId = [0, 0, 1, 0x02];
    const READER: EntityId = [0, 0, 1, 0x07];

    fn change(seq: u64, len: usize) -> CacheChange {
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        CacheChange::new(
            GUID::new([1; 12], WRITER),
            seq,
            ChangeKind::Alive,
            KeyHash::from_u64(9),
            payload,
        )
    }

    #[test]
    fn test_fragment_count_and_bounds() {
        assert_eq!(fragment_count(1000, 1000), 1);
        assert_eq!(fragment_count(1001, 1000), 2);
        assert_eq!(fragment_count(0, 1000), 1);
        assert_eq!(fragment_bounds(2, 1000, 1500), Some(1000..1500));
        assert_eq!(fragment_bounds(3, 1000, 1500), None);
        assert_eq!(fragment_bounds(0, 1000, 1500), None);
    }

    #[test]
    fn test_split_and_reassemble_out_of_order() {
        let original = change(4, 2500);
        let mut frags = split_change(&original, READER, WRITER, 1000, None);
        assert_eq!(frags.len(), 3);
        frags.reverse();

        let mut assembler = FragmentAssembler::new(4);
        let now = Instant::now();
        assert_eq!(assembler.insert(&frags[0], now), FragmentOutcome::Pending);
        assert_eq!(assembler.insert(&frags[1], now), FragmentOutcome::Pending);
        assert_eq!(
            assembler.missing(4).map(|s| s.iter().collect::<Vec<_>>()),
            Some(vec![1])
        );
        match assembler.insert(&frags[2], now) {
            FragmentOutcome::Complete(sample) => {
                assert_eq!(sample.seq, 4);
                assert_eq!(sample.payload, original.payload.to_vec());
                assert_eq!(sample.instance_key, KeyHash::from_u64(9));
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_split_only_requested_fragments() {
        let original = change(1, 5000);
        let wanted = FragmentNumberSet::from_items(2, [2, 5]);
        let frags = split_change(&original, READER, WRITER, 1000, Some(&wanted));
        let numbers: Vec<u32> = frags.iter().map(|f| f.fragment_start).collect();
        assert_eq!(numbers, vec![2, 5]);
    }

    #[test]
    fn test_duplicate_fragment_dropped() {
        let frags = split_change(&change(1, 1500), READER, WRITER, 1000, None);
        let mut assembler = FragmentAssembler::new(2);
        let now = Instant::now();
        assert_eq!(assembler.insert(&frags[0], now), FragmentOutcome::Pending);
        assert_eq!(assembler.insert(&frags[0], now), FragmentOutcome::Dropped);
    }

    #[test]
    fn test_capacity_prefers_lower_sequence() {
        let mut assembler = FragmentAssembler::new(1);
        let now = Instant::now();
        let high = split_change(&change(9, 1500), READER, WRITER, 1000, None);
        let low = split_change(&change(3, 1500), READER, WRITER, 1000, None);
        assert_eq!(assembler.insert(&high[0], now), FragmentOutcome::Pending);
        assert_eq!(assembler.insert(&low[0], now), FragmentOutcome::Pending);
        assert!(assembler.contains(3));
        assert!(!assembler.contains(9));
        assert_eq!(assembler.insert(&high[1], now), FragmentOutcome::Dropped);
    }

    #[test]
    fn test_oversized_sample_refused_before_allocation() {
        let mut assembler = FragmentAssembler::new(4);
        assembler.set_max_sample_size(2000);
        let now = Instant::now();

        let mut huge = split_change(&change(1, 1500), READER, WRITER, 1000, None).remove(0);
        huge.sample_size = u32::MAX;
        assert_eq!(
            assembler.insert(&huge, now),
            FragmentOutcome::TooLarge {
                size: u32::MAX as usize,
                max: 2000
            }
        );
        assert!(assembler.is_empty());

        let fits = split_change(&change(2, 1500), READER, WRITER, 1000, None);
        assert_eq!(assembler.insert(&fits[0], now), FragmentOutcome::Pending);
        assert!(matches!(
            assembler.insert(&fits[1], now),
            FragmentOutcome::Complete(_)
        ));
    }

    #[test]
    fn test_discard_through() {
        let mut assembler = FragmentAssembler::new(8);
        let now = Instant::now();
        for seq in [2, 5, 7] {
            let frags = split_change(&change(seq, 1500), READER, WRITER, 1000, None);
            assembler.insert(&frags[0], now);
        }
        assembler.discard_through(5);
        assert_eq!(assembler.pending_seqs().collect::<Vec<_>>(), vec![7]);
    }
}
