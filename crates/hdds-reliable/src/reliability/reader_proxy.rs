// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Writer-side state for one matched reader.
//!
//! A `ReaderProxy` tracks, for every change above the reader's acknowledged
//! low mark, where that change stands in the delivery cycle:
//!
//! ```text
//!            push send            suppression over
//!  Unsent ───────────────> Underway ─────────────> Unacknowledged
//!    │                        ^                        │    ^
//!    │ pull mode              │ resend                 │    │ resend
//!    v                        │                        v    │ (no suppression)
//!  Unacknowledged ───────> Requested <─────────────────┘────┘
//!               ACKNACK bit
//!
//!  any status ── ACKNACK base passes it ──> removed (low mark advances)
//! ```
//!
//! Samples are referenced by [`SampleHandle`]; a change whose sample left the
//! history keeps its slot with `handle = None` and is answered with GAP.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use super::arena::SampleHandle;
use super::bitmap::{FragmentNumberSet, SequenceBitmapRange};
use crate::core::guid::GUID;
use crate::qos::{Durability, Reliability};
use crate::transport::Locator;

/// What discovery tells a writer about a matched reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteReaderAttributes {
    pub guid: GUID,
    pub unicast_locators: Vec<Locator>,
    pub multicast_locators: Vec<Locator>,
    pub reliability: Reliability,
    pub durability: Durability,
    pub expects_inline_qos: bool,
}

impl RemoteReaderAttributes {
    pub fn new(guid: GUID, locator: Locator) -> Self {
        Self {
            guid,
            unicast_locators: vec![locator],
            multicast_locators: Vec::new(),
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            expects_inline_qos: false,
        }
    }

    pub fn best_effort(mut self) -> Self {
        self.reliability = Reliability::BestEffort;
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }
}

/// Delivery status of one change for one reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStatus {
    /// Not sent yet.
    Unsent,
    /// Requested by ACKNACK / NACK_FRAG, waiting for the response window.
    Requested,
    /// Sent recently; requests are ignored until `until`.
    Underway { until: Instant },
    /// Sent, not acknowledged.
    Unacknowledged,
    /// Acknowledged individually (best-effort bookkeeping).
    Acknowledged,
}

/// One change as seen by one reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeForReader {
    pub seq: u64,
    pub status: ChangeStatus,
    /// `None` once the sample left the writer history.
    pub handle: Option<SampleHandle>,
    /// Fragments asked for by NACK_FRAG; `None` means the whole sample.
    pub requested_fragments: Option<FragmentNumberSet>,
}

/// Result of applying the request bits of an ACKNACK.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Changes newly marked `Requested`.
    pub requested: usize,
    /// Requested numbers this proxy never tracked (answered with GAP).
    pub unknown: Vec<u64>,
}

/// Debug view of a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderProxySnapshot {
    pub guid: GUID,
    pub is_reliable: bool,
    pub low_mark: u64,
    pub tracked: usize,
    pub unacked: usize,
    pub requested: Vec<u64>,
}

/// Per-reader acknowledgment and retransmission state.
#[derive(Debug)]
pub struct ReaderProxy {
    attrs: RemoteReaderAttributes,
    /// Highest sequence number acknowledged contiguously.
    low_mark: u64,
    /// Changes at or below never reach this reader (volatile late joiner).
    floor: u64,
    changes: BTreeMap<u64, ChangeForReader>,
    /// Requested numbers with no tracked change (GAP candidates).
    gap_pending: BTreeSet<u64>,
    last_acknack_count: u32,
    last_nackfrag_count: u32,
    nack_response_at: Option<Instant>,
}

impl ReaderProxy {
    /// Proxy whose reader is considered to have acknowledged `low_mark`.
    /// The low mark never regresses below this initial value.
    pub fn new(attrs: RemoteReaderAttributes, low_mark: u64) -> Self {
        Self {
            attrs,
            low_mark,
            floor: low_mark,
            changes: BTreeMap::new(),
            gap_pending: BTreeSet::new(),
            last_acknack_count: 0,
            last_nackfrag_count: 0,
            nack_response_at: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn guid(&self) -> GUID {
        self.attrs.guid
    }

    #[must_use]
    pub fn attributes(&self) -> &RemoteReaderAttributes {
        &self.attrs
    }

    #[inline]
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.attrs.reliability == Reliability::Reliable
    }

    #[must_use]
    pub fn durability(&self) -> Durability {
        self.attrs.durability
    }

    /// Locators to send to: unicast when known, multicast otherwise.
    #[must_use]
    pub fn locators(&self) -> &[Locator] {
        if self.attrs.unicast_locators.is_empty() {
            &self.attrs.multicast_locators
        } else {
            &self.attrs.unicast_locators
        }
    }

    #[inline]
    #[must_use]
    pub fn low_mark(&self) -> u64 {
        self.low_mark
    }

    /// Low mark the proxy was created with.
    #[must_use]
    pub fn floor(&self) -> u64 {
        self.floor
    }

    // ========================================================================
    // Change tracking
    // ========================================================================

    /// Start tracking a change. Ignored at or below the low mark.
    pub fn add_change(&mut self, seq: u64, handle: SampleHandle, status: ChangeStatus) {
        if seq <= self.low_mark {
            return;
        }
        self.changes.insert(
            seq,
            ChangeForReader {
                seq,
                status,
                handle: Some(handle),
                requested_fragments: None,
            },
        );
    }

    /// The sample left the writer history.
    pub fn change_removed(&mut self, seq: u64) {
        if let Some(change) = self.changes.get_mut(&seq) {
            change.handle = None;
            change.requested_fragments = None;
        }
    }

    #[must_use]
    pub fn change(&self, seq: u64) -> Option<&ChangeForReader> {
        self.changes.get(&seq)
    }

    /// Changes never sent, ascending.
    #[must_use]
    pub fn unsent_changes(&self) -> Vec<u64> {
        self.seqs_with(|status| matches!(status, ChangeStatus::Unsent))
    }

    /// Changes waiting for retransmission, ascending.
    #[must_use]
    pub fn requested_changes(&self) -> Vec<u64> {
        self.seqs_with(|status| matches!(status, ChangeStatus::Requested))
    }

    fn seqs_with(&self, pred: impl Fn(&ChangeStatus) -> bool) -> Vec<u64> {
        self.changes
            .values()
            .filter(|c| pred(&c.status))
            .map(|c| c.seq)
            .collect()
    }

    /// Record a (re)transmission. `until` enables nack suppression.
    pub fn mark_sent(&mut self, seq: u64, until: Option<Instant>) {
        if let Some(change) = self.changes.get_mut(&seq) {
            change.status = match until {
                Some(until) => ChangeStatus::Underway { until },
                None => ChangeStatus::Unacknowledged,
            };
            change.requested_fragments = None;
        }
    }

    /// Pull mode: announce without sending.
    pub fn mark_announced(&mut self, seq: u64) {
        if let Some(change) = self.changes.get_mut(&seq) {
            if change.status == ChangeStatus::Unsent {
                change.status = ChangeStatus::Unacknowledged;
            }
        }
    }

    /// `true` while any tracked change is not acknowledged.
    #[must_use]
    pub fn has_unacked(&self) -> bool {
        self.changes
            .values()
            .any(|c| c.status != ChangeStatus::Acknowledged)
    }

    /// Tracked changes not yet acknowledged, ascending.
    pub fn unacked_changes(&self) -> impl Iterator<Item = u64> + '_ {
        self.changes
            .values()
            .filter(|c| c.status != ChangeStatus::Acknowledged)
            .map(|c| c.seq)
    }

    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.changes
            .values()
            .filter(|c| c.status != ChangeStatus::Acknowledged)
            .count()
    }

    /// Reader has `seq` (acknowledged).
    #[must_use]
    pub fn is_acked(&self, seq: u64) -> bool {
        seq <= self.low_mark
            || self
                .changes
                .get(&seq)
                .is_some_and(|c| c.status == ChangeStatus::Acknowledged)
    }

    // ========================================================================
    // ACKNACK / NACK_FRAG
    // ========================================================================

    /// Accept an ACKNACK count. Stale or repeated counts return `false`.
    pub fn check_acknack_count(&mut self, count: u32) -> bool {
        if count <= self.last_acknack_count {
            return false;
        }
        self.last_acknack_count = count;
        true
    }

    /// Accept a NACK_FRAG count. Stale or repeated counts return `false`.
    pub fn check_nackfrag_count(&mut self, count: u32) -> bool {
        if count <= self.last_nackfrag_count {
            return false;
        }
        self.last_nackfrag_count = count;
        true
    }

    /// Move the low mark to `base - 1`.
    ///
    /// Returns the previous low mark when the reader went backwards (it lost
    /// state); the engine then re-tracks `(new_low, old_low]` from history.
    pub fn acked_changes_set(&mut self, base: u64) -> Option<u64> {
        let new_low = base.saturating_sub(1).max(self.floor);
        if new_low >= self.low_mark {
            self.changes = self.changes.split_off(&new_low.saturating_add(1));
            self.gap_pending = self.gap_pending.split_off(&new_low.saturating_add(1));
            self.low_mark = new_low;
            return None;
        }
        let previous = self.low_mark;
        log::debug!(
            "[writer] reader {} acked base went back {} -> {}",
            self.attrs.guid,
            previous,
            new_low
        );
        self.low_mark = new_low;
        Some(previous)
    }

    /// Re-track a change after a low mark regression.
    pub fn restore_change(&mut self, seq: u64, handle: Option<SampleHandle>) {
        if seq <= self.low_mark {
            return;
        }
        self.changes.entry(seq).or_insert(ChangeForReader {
            seq,
            status: ChangeStatus::Requested,
            handle,
            requested_fragments: None,
        });
    }

    /// Mark the set bits of an ACKNACK as requested.
    ///
    /// Changes still `Underway` are left alone (nack suppression). Numbers
    /// above `last_seq` were never written and are ignored.
    pub fn requested_changes_set(
        &mut self,
        set: &SequenceBitmapRange,
        last_seq: u64,
    ) -> RequestOutcome {
        let mut outcome = RequestOutcome::default();
        for seq in set.iter() {
            if seq <= self.low_mark || seq > last_seq {
                continue;
            }
            match self.changes.get_mut(&seq) {
                Some(change) => match change.status {
                    ChangeStatus::Underway { .. } | ChangeStatus::Requested => {}
                    _ => {
                        change.status = ChangeStatus::Requested;
                        change.requested_fragments = None;
                        outcome.requested += 1;
                    }
                },
                None => {
                    if self.gap_pending.insert(seq) {
                        outcome.unknown.push(seq);
                    }
                }
            }
        }
        outcome
    }

    /// Mark fragments of one change as requested. `false` when ignored.
    pub fn requested_fragments_set(&mut self, seq: u64, fragments: &FragmentNumberSet) -> bool {
        if seq <= self.low_mark || fragments.is_empty() {
            return false;
        }
        let Some(change) = self.changes.get_mut(&seq) else {
            return self.gap_pending.insert(seq);
        };
        match change.status {
            ChangeStatus::Underway { .. } => false,
            ChangeStatus::Requested if change.requested_fragments.is_none() => false,
            _ => {
                let merged = match change.requested_fragments.take() {
                    Some(mut existing) => {
                        fragments.for_each(|n| {
                            existing.add(n);
                        });
                        existing
                    }
                    None => *fragments,
                };
                change.requested_fragments = Some(merged);
                change.status = ChangeStatus::Requested;
                true
            }
        }
    }

    /// Drain the GAP candidates, ascending.
    pub fn take_gap_pending(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.gap_pending).into_iter().collect()
    }

    #[must_use]
    pub fn has_pending_response(&self) -> bool {
        !self.gap_pending.is_empty()
            || self
                .changes
                .values()
                .any(|c| c.status == ChangeStatus::Requested)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// End nack suppression for changes whose window elapsed.
    pub fn expire_suppression(&mut self, now: Instant) {
        for change in self.changes.values_mut() {
            if let ChangeStatus::Underway { until } = change.status {
                if until <= now {
                    change.status = ChangeStatus::Unacknowledged;
                }
            }
        }
    }

    #[must_use]
    pub fn next_suppression_expiry(&self) -> Option<Instant> {
        self.changes
            .values()
            .filter_map(|c| match c.status {
                ChangeStatus::Underway { until } => Some(until),
                _ => None,
            })
            .min()
    }

    /// Arm the nack response timer unless already armed earlier.
    pub fn schedule_nack_response(&mut self, at: Instant) {
        self.nack_response_at = Some(self.nack_response_at.map_or(at, |cur| cur.min(at)));
    }

    #[must_use]
    pub fn nack_response_at(&self) -> Option<Instant> {
        self.nack_response_at
    }

    /// Disarm the nack response timer if it is due.
    pub fn take_due_nack_response(&mut self, now: Instant) -> bool {
        match self.nack_response_at {
            Some(at) if at <= now => {
                self.nack_response_at = None;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> ReaderProxySnapshot {
        ReaderProxySnapshot {
            guid: self.attrs.guid,
            is_reliable: self.is_reliable(),
            low_mark: self.low_mark,
            tracked: self.changes.len(),
            unacked: self.unacked_count(),
            requested: self.requested_changes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::arena::SampleArena;
    use crate::reliability::change::{CacheChange, ChangeKind, KeyHash};
    use std::time::Duration;

    fn proxy() -> ReaderProxy {
        let guid = GUID::new([3; 12], [0, 0, 1, 0x07]);
        ReaderProxy::new(RemoteReaderAttributes::new(guid, Locator::intra(1)), 0)
    }

    fn handles(n: u64) -> Vec<SampleHandle> {
        let mut arena = SampleArena::new();
        (1..=n)
            .map(|seq| {
                arena.insert(CacheChange::new(
                    GUID::zero(),
                    seq,
                    ChangeKind::Alive,
                    KeyHash::default(),
                    Vec::new(),
                ))
            })
            .collect()
    }

    fn tracked(n: u64) -> ReaderProxy {
        let mut p = proxy();
        for (i, h) in handles(n).into_iter().enumerate() {
            p.add_change(i as u64 + 1, h, ChangeStatus::Unacknowledged);
        }
        p
    }

    #[test]
    fn test_acked_changes_set_advances_low_mark() {
        let mut p = tracked(5);
        assert_eq!(p.acked_changes_set(4), None);
        assert_eq!(p.low_mark(), 3);
        assert!(p.is_acked(3));
        assert!(!p.is_acked(4));
        assert_eq!(p.unacked_count(), 2);
    }

    #[test]
    fn test_acked_changes_set_regression_reported() {
        let mut p = tracked(5);
        p.acked_changes_set(5);
        assert_eq!(p.acked_changes_set(2), Some(4));
        assert_eq!(p.low_mark(), 1);
    }

    #[test]
    fn test_regression_clamped_to_floor() {
        let guid = GUID::new([3; 12], [0, 0, 1, 0x07]);
        let mut p = ReaderProxy::new(RemoteReaderAttributes::new(guid, Locator::intra(1)), 10);
        assert_eq!(p.acked_changes_set(1), None);
        assert_eq!(p.low_mark(), 10);
        assert_eq!(p.floor(), 10);
        assert_eq!(p.acked_changes_set(13), None);
        assert_eq!(p.acked_changes_set(5), Some(12));
        assert_eq!(p.low_mark(), 10);
    }

    #[test]
    fn test_requested_changes_set() {
        let mut p = tracked(5);
        p.acked_changes_set(2);
        let set = SequenceBitmapRange::from_items(2, [3, 5, 9]);
        let outcome = p.requested_changes_set(&set, 5);
        assert_eq!(outcome.requested, 2);
        assert!(outcome.unknown.is_empty());
        assert_eq!(p.requested_changes(), vec![3, 5]);

        p.mark_sent(3, None);
        assert_eq!(p.requested_changes(), vec![5]);
    }

    #[test]
    fn test_unknown_request_becomes_gap_candidate() {
        let mut p = proxy();
        let set = SequenceBitmapRange::from_items(1, [1, 2]);
        let outcome = p.requested_changes_set(&set, 2);
        assert_eq!(outcome.unknown, vec![1, 2]);
        // Same request again is not duplicated.
        assert!(p.requested_changes_set(&set, 2).unknown.is_empty());
        assert_eq!(p.take_gap_pending(), vec![1, 2]);
    }

    #[test]
    fn test_underway_ignores_requests_until_expiry() {
        let mut p = tracked(1);
        let now = Instant::now();
        p.mark_sent(1, Some(now + Duration::from_millis(50)));
        let set = SequenceBitmapRange::from_items(1, [1]);
        assert_eq!(p.requested_changes_set(&set, 1).requested, 0);
        assert_eq!(p.next_suppression_expiry(), Some(now + Duration::from_millis(50)));

        p.expire_suppression(now + Duration::from_millis(60));
        assert_eq!(p.requested_changes_set(&set, 1).requested, 1);
    }

    #[test]
    fn test_count_dedup() {
        let mut p = proxy();
        assert!(p.check_acknack_count(1));
        assert!(!p.check_acknack_count(1));
        assert!(p.check_acknack_count(5));
        assert!(!p.check_acknack_count(3));
        assert!(p.check_nackfrag_count(1));
    }

    #[test]
    fn test_requested_fragments_merge() {
        let mut p = tracked(2);
        let first = FragmentNumberSet::from_items(1, [2]);
        let second = FragmentNumberSet::from_items(1, [4]);
        assert!(p.requested_fragments_set(2, &first));
        assert!(p.requested_fragments_set(2, &second));
        let frags = p
            .change(2)
            .and_then(|c| c.requested_fragments)
            .map(|s| s.iter().collect::<Vec<_>>());
        assert_eq!(frags, Some(vec![2, 4]));
    }

    #[test]
    fn test_nack_response_timer() {
        let mut p = proxy();
        let now = Instant::now();
        p.schedule_nack_response(now + Duration::from_millis(10));
        p.schedule_nack_response(now + Duration::from_millis(30));
        assert_eq!(p.nack_response_at(), Some(now + Duration::from_millis(10)));
        assert!(!p.take_due_nack_response(now));
        assert!(p.take_due_nack_response(now + Duration::from_millis(10)));
        assert_eq!(p.nack_response_at(), None);
    }
}
