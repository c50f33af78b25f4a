// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reader-side state for one matched writer.
//!
//! Tracks which sequence numbers of the writer have been received or
//! declared irrelevant (GAP, lost), and what the writer claims to have
//! (HEARTBEAT):
//!
//! ```text
//!   1 ... low_mark | low_mark+1 ........................ max_available
//!   all accounted  | received / irrelevant / missing     (from HEARTBEAT)
//! ```
//!
//! The low mark only moves forward: it advances whenever `low_mark + 1`
//! becomes received or irrelevant. Samples at or below it are deliverable.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use super::bitmap::{FragmentNumberSet, SequenceBitmapRange, BITMAP_MAX_BITS};
use super::fragment::FragmentAssembler;
use crate::core::guid::GUID;
use crate::qos::{Durability, Reliability};
use crate::transport::Locator;

/// What discovery tells a reader about a matched writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteWriterAttributes {
    pub guid: GUID,
    pub unicast_locators: Vec<Locator>,
    pub multicast_locators: Vec<Locator>,
    pub reliability: Reliability,
    pub durability: Durability,
    /// Liveliness lease announced by the writer.
    pub liveliness_lease: Option<Duration>,
}

impl RemoteWriterAttributes {
    pub fn new(guid: GUID, locator: Locator) -> Self {
        Self {
            guid,
            unicast_locators: vec![locator],
            multicast_locators: Vec::new(),
            reliability: Reliability::Reliable,
            durability: Durability::Volatile,
            liveliness_lease: None,
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

    pub fn liveliness_lease(mut self, lease: Duration) -> Self {
        self.liveliness_lease = Some(lease);
        self
    }
}

/// Debug view of a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterProxySnapshot {
    pub guid: GUID,
    pub low_mark: u64,
    pub max_available: u64,
    pub received_above_low_mark: usize,
    pub partial_samples: usize,
    pub lost_total: u64,
    pub alive: bool,
}

/// Per-writer reception state.
#[derive(Debug)]
pub struct WriterProxy {
    attrs: RemoteWriterAttributes,
    low_mark: u64,
    received: BTreeSet<u64>,
    /// Disjoint, non-adjacent irrelevant ranges above the low mark: start -> end (inclusive).
    irrelevant: BTreeMap<u64, u64>,
    max_available: u64,
    last_heartbeat_count: u32,
    heartbeat_seen: bool,
    acknack_count: u32,
    nackfrag_count: u32,
    acknack_at: Option<Instant>,
    assembler: FragmentAssembler,
    last_alive: Instant,
    alive: bool,
    lost_total: u64,
}

impl WriterProxy {
    pub fn new(attrs: RemoteWriterAttributes, max_pending_fragmented: usize, now: Instant) -> Self {
        Self {
            attrs,
            low_mark: 0,
            received: BTreeSet::new(),
            irrelevant: BTreeMap::new(),
            max_available: 0,
            last_heartbeat_count: 0,
            heartbeat_seen: false,
            acknack_count: 0,
            nackfrag_count: 0,
            acknack_at: None,
            assembler: FragmentAssembler::new(max_pending_fragmented),
            last_alive: now,
            alive: true,
            lost_total: 0,
        }
    }

    /// Cap on the announced size of fragmented samples.
    pub fn with_max_sample_size(mut self, max: usize) -> Self {
        self.assembler.set_max_sample_size(max);
        self
    }

    #[inline]
    #[must_use]
    pub fn guid(&self) -> GUID {
        self.attrs.guid
    }

    #[must_use]
    pub fn attributes(&self) -> &RemoteWriterAttributes {
        &self.attrs
    }

    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.attrs.reliability == Reliability::Reliable
    }

    /// Locators to reply to: unicast when known, multicast otherwise.
    #[must_use]
    pub fn locators(&self) -> &[Locator] {
        if self.attrs.unicast_locators.is_empty() {
            &self.attrs.multicast_locators
        } else {
            &self.attrs.unicast_locators
        }
    }

    /// Highest sequence number below which everything is accounted for.
    #[inline]
    #[must_use]
    pub fn low_mark(&self) -> u64 {
        self.low_mark
    }

    #[inline]
    #[must_use]
    pub fn max_available(&self) -> u64 {
        self.max_available
    }

    #[must_use]
    pub fn lost_total(&self) -> u64 {
        self.lost_total
    }

    // ========================================================================
    // Reception
    // ========================================================================

    /// Already received, irrelevant, or at/below the low mark.
    #[must_use]
    pub fn is_duplicate(&self, seq: u64) -> bool {
        seq <= self.low_mark || self.received.contains(&seq) || self.is_irrelevant(seq)
    }

    fn is_irrelevant(&self, seq: u64) -> bool {
        self.irrelevant
            .range(..=seq)
            .next_back()
            .is_some_and(|(_, &end)| end >= seq)
    }

    /// Record a received sample. Returns `true` when the low mark advanced.
    pub fn received_change_set(&mut self, seq: u64) -> bool {
        if self.is_duplicate(seq) {
            return false;
        }
        self.received.insert(seq);
        self.assembler.remove(seq);
        if seq > self.max_available {
            self.max_available = seq;
        }
        self.normalize()
    }

    /// Declare one sequence number irrelevant (GAP).
    pub fn irrelevant_change_set(&mut self, seq: u64) -> bool {
        if self.is_duplicate(seq) {
            return false;
        }
        self.mark_irrelevant(seq, seq);
        self.normalize()
    }

    /// Declare `[from, to]` irrelevant. Returns `true` when the low mark advanced.
    pub fn irrelevant_range_set(&mut self, from: u64, to: u64) -> bool {
        if to <= self.low_mark || from > to {
            return false;
        }
        if from <= self.low_mark.saturating_add(1) {
            // Range touches the low mark: jump over it.
            self.low_mark = to;
            self.prune();
            self.normalize();
            return true;
        }
        self.mark_irrelevant(from, to);
        self.normalize()
    }

    /// Merge `[from, to]` into the irrelevant ranges, independent of its width.
    fn mark_irrelevant(&mut self, from: u64, to: u64) {
        let mut start = from;
        let mut end = to;
        if let Some((&prev_start, &prev_end)) = self.irrelevant.range(..from).next_back() {
            if prev_end.saturating_add(1) >= from {
                start = prev_start;
                end = end.max(prev_end);
            }
        }
        let absorbed: Vec<u64> = self
            .irrelevant
            .range(start..=end.saturating_add(1))
            .map(|(&s, _)| s)
            .collect();
        for s in absorbed {
            if let Some(e) = self.irrelevant.remove(&s) {
                end = end.max(e);
            }
        }
        self.irrelevant.insert(start, end);

        let partial: Vec<u64> = self
            .assembler
            .pending_seqs()
            .filter(|seq| (from..=to).contains(seq))
            .collect();
        for seq in partial {
            self.assembler.remove(seq);
        }
    }

    /// How many of `[from, through]` are irrelevant.
    fn irrelevant_count(&self, from: u64, through: u64) -> u64 {
        let mut count = 0;
        let first = self
            .irrelevant
            .range(..=from)
            .next_back()
            .map_or(from, |(&s, _)| s);
        for (&s, &e) in self.irrelevant.range(first..=through) {
            let lo = s.max(from);
            let hi = e.min(through);
            if lo <= hi {
                count += hi - lo + 1;
            }
        }
        count
    }

    /// Everything below `first` the writer no longer has: what we miss there
    /// is lost. Returns how many sequence numbers were lost.
    pub fn lost_changes_update(&mut self, first: u64) -> u64 {
        if first <= self.low_mark.saturating_add(1) {
            return 0;
        }
        let through = first - 1;
        let from = self.low_mark + 1;
        let received_only = self
            .received
            .range(from..=through)
            .filter(|&&seq| !self.is_irrelevant(seq))
            .count() as u64;
        let accounted = received_only + self.irrelevant_count(from, through);
        let lost = (through - self.low_mark).saturating_sub(accounted);
        self.low_mark = through;
        self.prune();
        self.normalize();
        self.lost_total = self.lost_total.saturating_add(lost);
        lost
    }

    /// Raise the known-available bound from a HEARTBEAT `last_seq`.
    pub fn missing_changes_update(&mut self, last: u64) {
        if last > self.max_available {
            self.max_available = last;
        }
    }

    /// Missing sequence numbers in the ACKNACK window, excluding samples
    /// partially received through DATA_FRAG.
    #[must_use]
    pub fn missing_changes(&self) -> SequenceBitmapRange {
        let base = self.low_mark.saturating_add(1);
        let mut set = SequenceBitmapRange::new(base);
        let end = self
            .max_available
            .min(base.saturating_add(u64::from(BITMAP_MAX_BITS) - 1));
        let mut seq = base;
        while seq <= end {
            if !self.received.contains(&seq)
                && !self.is_irrelevant(seq)
                && !self.assembler.contains(seq)
            {
                set.add(seq);
            }
            seq += 1;
        }
        set
    }

    /// Missing fragments of partially received samples, ascending by seq.
    #[must_use]
    pub fn fragment_requests(&self) -> Vec<(u64, FragmentNumberSet)> {
        self.assembler
            .pending_seqs()
            .filter_map(|seq| self.assembler.missing(seq).map(|set| (seq, set)))
            .filter(|(_, set)| !set.is_empty())
            .collect()
    }

    /// Anything known but not yet here.
    #[must_use]
    pub fn has_missing(&self) -> bool {
        !self.missing_changes().is_empty() || !self.assembler.is_empty()
    }

    /// Sequence numbers received out of order, waiting for the gap below them.
    pub fn buffered(&self) -> impl Iterator<Item = u64> + '_ {
        self.received.iter().copied()
    }

    pub fn assembler_mut(&mut self) -> &mut FragmentAssembler {
        &mut self.assembler
    }

    #[must_use]
    pub fn assembler(&self) -> &FragmentAssembler {
        &self.assembler
    }

    fn prune(&mut self) {
        let keep_from = self.low_mark.saturating_add(1);
        self.received = self.received.split_off(&keep_from);
        let straddling = self
            .irrelevant
            .range(..keep_from)
            .next_back()
            .map(|(_, &end)| end)
            .filter(|&end| end >= keep_from);
        self.irrelevant = self.irrelevant.split_off(&keep_from);
        if let Some(end) = straddling {
            self.irrelevant.insert(keep_from, end);
        }
        self.assembler.discard_through(self.low_mark);
        if self.max_available < self.low_mark {
            self.max_available = self.low_mark;
        }
    }

    fn normalize(&mut self) -> bool {
        let start = self.low_mark;
        loop {
            let next = self.low_mark + 1;
            if self.received.remove(&next) {
                self.low_mark = next;
            } else if let Some(end) = self.irrelevant.remove(&next) {
                self.low_mark = end;
            } else {
                break;
            }
        }
        if self.low_mark != start {
            self.prune();
            true
        } else {
            false
        }
    }

    // ========================================================================
    // HEARTBEAT / ACKNACK bookkeeping
    // ========================================================================

    /// Accept a HEARTBEAT count. Stale or repeated counts return `false`.
    pub fn check_heartbeat_count(&mut self, count: u32) -> bool {
        if self.heartbeat_seen && count <= self.last_heartbeat_count {
            return false;
        }
        self.last_heartbeat_count = count;
        self.heartbeat_seen = true;
        true
    }

    #[must_use]
    pub fn heartbeat_seen(&self) -> bool {
        self.heartbeat_seen
    }

    /// Count for the next ACKNACK (monotonic, never reset).
    pub fn next_acknack_count(&mut self) -> u32 {
        self.acknack_count = self.acknack_count.wrapping_add(1);
        self.acknack_count
    }

    /// Count for the next NACK_FRAG (monotonic, never reset).
    pub fn next_nackfrag_count(&mut self) -> u32 {
        self.nackfrag_count = self.nackfrag_count.wrapping_add(1);
        self.nackfrag_count
    }

    /// Arm the ACKNACK timer unless already armed earlier.
    pub fn schedule_acknack(&mut self, at: Instant) {
        self.acknack_at = Some(self.acknack_at.map_or(at, |cur| cur.min(at)));
    }

    #[must_use]
    pub fn acknack_at(&self) -> Option<Instant> {
        self.acknack_at
    }

    /// Disarm the ACKNACK timer if it is due.
    pub fn take_due_acknack(&mut self, now: Instant) -> bool {
        match self.acknack_at {
            Some(at) if at <= now => {
                self.acknack_at = None;
                true
            }
            _ => false,
        }
    }

    // ========================================================================
    // Liveliness
    // ========================================================================

    /// Writer showed a sign of life. Returns `true` if it was considered lost.
    pub fn assert_alive(&mut self, now: Instant) -> bool {
        self.last_alive = now;
        let was_lost = !self.alive;
        self.alive = true;
        was_lost
    }

    /// Lease check. Returns `true` on the alive -> lost transition.
    pub fn check_liveliness(&mut self, now: Instant) -> bool {
        match self.lease_expiry() {
            Some(expiry) if self.alive && expiry <= now => {
                self.alive = false;
                true
            }
            _ => false,
        }
    }

    /// When the lease runs out, if one applies and the writer is alive.
    #[must_use]
    pub fn lease_expiry(&self) -> Option<Instant> {
        if !self.alive {
            return None;
        }
        self.attrs
            .liveliness_lease
            .and_then(|lease| self.last_alive.checked_add(lease))
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    #[must_use]
    pub fn snapshot(&self) -> WriterProxySnapshot {
        WriterProxySnapshot {
            guid: self.attrs.guid,
            low_mark: self.low_mark,
            max_available: self.max_available,
            received_above_low_mark: self.received.len(),
            partial_samples: self.assembler.len(),
            lost_total: self.lost_total,
            alive: self.alive,
        }
    }
}
