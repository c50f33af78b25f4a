// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample history: the bounded, ordered store of samples of one endpoint.
//!
//! Samples live in a [`SampleArena`]; the history keeps the indexes:
//!
//! - `order`: `(writer, seq)` -> handle, for in-order iteration and
//!   retransmission lookups
//! - `by_age` / per-instance sets: eviction order (source timestamp, then key)
//! - `expiry`: lifespan side index
//! - `deadlines`: instance -> next deadline, for per-instance silence detection
//!
//! Admission is decided by [`admission_decision`], a pure function of the
//! history policy, the resource limits and the current occupancy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use super::arena::{SampleArena, SampleHandle};
use super::change::{CacheChange, KeyHash, SampleKey};
use crate::core::guid::GUID;
use crate::qos::{History, MemoryPolicy, ResourceLimits};

/// Arena slots reserved up front for preallocated histories.
const MAX_PREALLOCATED_SLOTS: usize = 4096;

/// Why a sample was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Payload larger than the preallocated slot size.
    PayloadTooLarge { size: usize, max: usize },
    MaxSamples,
    MaxInstances,
    MaxSamplesPerInstance,
    MaxQuotaBytes,
    /// A sample with the same `(writer, seq)` is already stored.
    Duplicate,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PayloadTooLarge { size, max } => {
                write!(f, "payload of {} bytes exceeds slot size {}", size, max)
            }
            RejectReason::MaxSamples => write!(f, "max_samples reached"),
            RejectReason::MaxInstances => write!(f, "max_instances reached"),
            RejectReason::MaxSamplesPerInstance => write!(f, "max_samples_per_instance reached"),
            RejectReason::MaxQuotaBytes => write!(f, "max_quota_bytes reached"),
            RejectReason::Duplicate => write!(f, "duplicate sample"),
        }
    }
}

/// Current fill level of a history, as seen by an incoming sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occupancy {
    pub total: usize,
    pub instances: usize,
    pub in_instance: usize,
    pub instance_known: bool,
    pub bytes: usize,
    pub incoming_bytes: usize,
}

/// Outcome of [`admission_decision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accept,
    /// KEEP_LAST: replace the oldest sample of the same instance first.
    EvictOldestInInstance,
    /// KEEP_LAST: replace the oldest sample overall first.
    EvictOldest,
    Reject(RejectReason),
}

/// Decide whether a sample may enter a history.
///
/// KEEP_LAST never rejects for sample counts: it asks for an eviction.
/// KEEP_ALL rejects once any limit is saturated.
pub fn admission_decision(
    policy: History,
    limits: &ResourceLimits,
    occupancy: &Occupancy,
) -> Admission {
    if !occupancy.instance_known && occupancy.instances >= limits.max_instances {
        return Admission::Reject(RejectReason::MaxInstances);
    }

    let per_instance_cap = match policy {
        History::KeepLast(depth) => (depth as usize).min(limits.max_samples_per_instance),
        History::KeepAll => limits.max_samples_per_instance,
    };
    if occupancy.in_instance >= per_instance_cap {
        return match policy {
            History::KeepLast(_) => Admission::EvictOldestInInstance,
            History::KeepAll => Admission::Reject(RejectReason::MaxSamplesPerInstance),
        };
    }

    if occupancy.total >= limits.max_samples {
        return match policy {
            History::KeepLast(_) => Admission::EvictOldest,
            History::KeepAll => Admission::Reject(RejectReason::MaxSamples),
        };
    }

    if occupancy.bytes.saturating_add(occupancy.incoming_bytes) > limits.max_quota_bytes {
        if occupancy.total == 0 {
            return Admission::Reject(RejectReason::MaxQuotaBytes);
        }
        return match policy {
            History::KeepLast(_) => Admission::EvictOldest,
            History::KeepAll => Admission::Reject(RejectReason::MaxQuotaBytes),
        };
    }

    Admission::Accept
}

/// Result of a successful [`SampleHistory::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddOutcome {
    pub handle: SampleHandle,
    /// Samples replaced to make room (KEEP_LAST), oldest first.
    pub evicted: Vec<SampleKey>,
}

type AgeKey = (SystemTime, SampleKey);

/// Ordered, bounded store of samples.
#[derive(Debug)]
pub struct SampleHistory {
    policy: History,
    limits: ResourceLimits,
    memory: MemoryPolicy,
    arena: SampleArena,
    order: BTreeMap<SampleKey, SampleHandle>,
    by_age: BTreeSet<AgeKey>,
    instances: HashMap<KeyHash, BTreeSet<AgeKey>>,
    expiry: BTreeSet<(Instant, SampleKey)>,
    deadline_period: Option<Duration>,
    deadlines: HashMap<KeyHash, Instant>,
    bytes: usize,
}

impl SampleHistory {
    pub fn new(policy: History, limits: ResourceLimits, memory: MemoryPolicy) -> Self {
        let arena = match memory {
            MemoryPolicy::Preallocated { .. } | MemoryPolicy::PreallocatedWithRealloc => {
                SampleArena::with_capacity(limits.max_samples.min(MAX_PREALLOCATED_SLOTS))
            }
            MemoryPolicy::Dynamic => SampleArena::new(),
        };
        Self {
            policy,
            limits,
            memory,
            arena,
            order: BTreeMap::new(),
            by_age: BTreeSet::new(),
            instances: HashMap::new(),
            expiry: BTreeSet::new(),
            deadline_period: None,
            deadlines: HashMap::new(),
            bytes: 0,
        }
    }

    /// Enable per-instance deadline tracking.
    pub fn set_deadline(&mut self, period: Option<Duration>) {
        self.deadline_period = period;
        if period.is_none() {
            self.deadlines.clear();
        }
    }

    #[must_use]
    pub fn policy(&self) -> History {
        self.policy
    }

    #[must_use]
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Largest payload this history could ever admit.
    #[must_use]
    pub fn max_payload(&self) -> usize {
        self.memory
            .payload_limit()
            .map_or(self.limits.max_quota_bytes, |max| {
                max.min(self.limits.max_quota_bytes)
            })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Occupancy seen by a sample of `instance` with `payload_len` bytes.
    #[must_use]
    pub fn occupancy(&self, instance: &KeyHash, payload_len: usize) -> Occupancy {
        let in_instance = self.instances.get(instance).map_or(0, BTreeSet::len);
        Occupancy {
            total: self.order.len(),
            instances: self.instances.len(),
            in_instance,
            instance_known: in_instance > 0,
            bytes: self.bytes,
            incoming_bytes: payload_len,
        }
    }

    /// Admission decision for a prospective sample, memory policy included.
    #[must_use]
    pub fn check_admission(&self, instance: &KeyHash, payload_len: usize) -> Admission {
        if let Some(max) = self.memory.payload_limit() {
            if payload_len > max {
                return Admission::Reject(RejectReason::PayloadTooLarge {
                    size: payload_len,
                    max,
                });
            }
        }
        admission_decision(
            self.policy,
            &self.limits,
            &self.occupancy(instance, payload_len),
        )
    }

    /// Admit a sample, evicting under KEEP_LAST when needed.
    pub fn add(&mut self, change: CacheChange) -> Result<AddOutcome, RejectReason> {
        let key = change.key();
        if self.order.contains_key(&key) {
            return Err(RejectReason::Duplicate);
        }

        let mut evicted = Vec::new();
        loop {
            match self.check_admission(&change.instance_key, change.payload_len()) {
                Admission::Accept => break,
                Admission::EvictOldestInInstance => {
                    let victim = self
                        .oldest_in_instance(&change.instance_key)
                        .ok_or(RejectReason::MaxSamplesPerInstance)?;
                    self.take(&victim);
                    evicted.push(victim);
                }
                Admission::EvictOldest => {
                    let victim = self.oldest().ok_or(RejectReason::MaxSamples)?;
                    self.take(&victim);
                    evicted.push(victim);
                }
                Admission::Reject(reason) => return Err(reason),
            }
        }

        if !evicted.is_empty() {
            log::trace!("[history] evicted {} sample(s) for {:?}", evicted.len(), key);
        }

        let age: AgeKey = (change.source_timestamp, key);
        let instance = change.instance_key;
        let expires_at = change.expires_at;
        let received_at = change.received_at;
        self.bytes = self.bytes.saturating_add(change.payload_len());

        let handle = self.arena.insert(change);
        self.order.insert(key, handle);
        self.by_age.insert(age);
        self.instances.entry(instance).or_default().insert(age);
        if let Some(at) = expires_at {
            self.expiry.insert((at, key));
        }
        if let Some(period) = self.deadline_period {
            if let Some(next) = received_at.checked_add(period) {
                self.deadlines.insert(instance, next);
            }
        }

        Ok(AddOutcome { handle, evicted })
    }

    // ========================================================================
    // Removal
    // ========================================================================

    /// Remove a specific sample. `false` if not present.
    pub fn remove(&mut self, key: &SampleKey) -> bool {
        self.take(key).is_some()
    }

    /// Remove and return a specific sample.
    pub fn take(&mut self, key: &SampleKey) -> Option<CacheChange> {
        let handle = self.order.remove(key)?;
        let change = self.arena.remove(handle)?;
        let age: AgeKey = (change.source_timestamp, *key);
        self.by_age.remove(&age);
        if let Some(set) = self.instances.get_mut(&change.instance_key) {
            set.remove(&age);
            if set.is_empty() {
                self.instances.remove(&change.instance_key);
            }
        }
        if let Some(at) = change.expires_at {
            self.expiry.remove(&(at, *key));
        }
        self.bytes = self.bytes.saturating_sub(change.payload_len());
        Some(change)
    }

    /// Remove the lowest `(writer, seq)` sample.
    pub fn remove_min(&mut self) -> Option<CacheChange> {
        let key = *self.order.keys().next()?;
        self.take(&key)
    }

    /// Remove everything, returning the removed keys in order.
    pub fn clear(&mut self) -> Vec<SampleKey> {
        let keys: Vec<SampleKey> = self.order.keys().copied().collect();
        self.order.clear();
        self.by_age.clear();
        self.instances.clear();
        self.expiry.clear();
        self.arena.clear();
        self.bytes = 0;
        keys
    }

    /// Remove samples whose lifespan ended at or before `now`.
    pub fn remove_expired(&mut self, now: Instant) -> Vec<CacheChange> {
        let due: Vec<SampleKey> = self
            .expiry
            .iter()
            .take_while(|(at, _)| *at <= now)
            .map(|(_, key)| *key)
            .collect();
        due.iter().filter_map(|key| self.take(key)).collect()
    }

    /// Instances whose deadline elapsed. Each is re-armed one period later,
    /// so a silent instance is reported once per period.
    pub fn missed_deadlines(&mut self, now: Instant) -> Vec<KeyHash> {
        let Some(period) = self.deadline_period else {
            return Vec::new();
        };
        let mut missed = Vec::new();
        for (instance, deadline) in self.deadlines.iter_mut() {
            if *deadline <= now {
                missed.push(*instance);
                *deadline = now.checked_add(period).unwrap_or(now);
            }
        }
        missed.sort();
        missed
    }

    /// Earliest lifespan expiry or instance deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let expiry = self.expiry.iter().next().map(|(at, _)| *at);
        let deadline = self.deadlines.values().min().copied();
        match (expiry, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    #[must_use]
    pub fn get(&self, key: &SampleKey) -> Option<&CacheChange> {
        self.order.get(key).and_then(|h| self.arena.get(*h))
    }

    #[must_use]
    pub fn get_by_handle(&self, handle: SampleHandle) -> Option<&CacheChange> {
        self.arena.get(handle)
    }

    #[must_use]
    pub fn handle(&self, key: &SampleKey) -> Option<SampleHandle> {
        self.order.get(key).copied()
    }

    #[must_use]
    pub fn contains(&self, key: &SampleKey) -> bool {
        self.order.contains_key(key)
    }

    /// All samples in `(writer, seq)` order.
    pub fn iter(&self) -> impl Iterator<Item = &CacheChange> + '_ {
        self.order.values().filter_map(|h| self.arena.get(*h))
    }

    /// Samples of one writer in sequence order.
    pub fn iter_writer(&self, writer: GUID) -> impl Iterator<Item = &CacheChange> + '_ {
        self.order
            .range(SampleKey::new(writer, 0)..=SampleKey::new(writer, u64::MAX))
            .filter_map(|(_, h)| self.arena.get(*h))
    }

    /// `(seq, handle)` of one writer's samples within `[from, to]`.
    pub fn handles_between(&self, writer: GUID, from: u64, to: u64) -> Vec<(u64, SampleHandle)> {
        if from > to {
            return Vec::new();
        }
        self.order
            .range(SampleKey::new(writer, from)..=SampleKey::new(writer, to))
            .map(|(k, h)| (k.seq, *h))
            .collect()
    }

    #[must_use]
    pub fn min_seq(&self, writer: GUID) -> Option<u64> {
        self.order
            .range(SampleKey::new(writer, 0)..=SampleKey::new(writer, u64::MAX))
            .next()
            .map(|(k, _)| k.seq)
    }

    #[must_use]
    pub fn max_seq(&self, writer: GUID) -> Option<u64> {
        self.order
            .range(SampleKey::new(writer, 0)..=SampleKey::new(writer, u64::MAX))
            .next_back()
            .map(|(k, _)| k.seq)
    }

    /// Oldest sample of an instance.
    #[must_use]
    pub fn oldest_in_instance(&self, instance: &KeyHash) -> Option<SampleKey> {
        self.instances
            .get(instance)
            .and_then(|set| set.iter().next())
            .map(|(_, key)| *key)
    }

    /// Oldest sample overall.
    #[must_use]
    pub fn oldest(&self) -> Option<SampleKey> {
        self.by_age.iter().next().map(|(_, key)| *key)
    }

    /// Samples of an instance, oldest first.
    pub fn instance_keys(&self, instance: &KeyHash) -> Vec<SampleKey> {
        self.instances
            .get(instance)
            .map(|set| set.iter().map(|(_, key)| *key).collect())
            .unwrap_or_default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total payload bytes held.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[must_use]
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// `max_samples` reached.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.order.len() >= self.limits.max_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::change::ChangeKind;
    use std::time::UNIX_EPOCH;

    fn writer() -> GUID {
        GUID::new([7; 12], [0, 0, 1, 0x02])
    }

    fn sample(seq: u64, instance: u64, len: usize) -> CacheChange {
        CacheChange::new(
            writer(),
            seq,
            ChangeKind::Alive,
            KeyHash::from_u64(instance),
            vec![0u8; len],
        )
        .with_source_timestamp(UNIX_EPOCH + Duration::from_millis(seq))
    }

    fn limits(max_samples: usize, per_instance: usize) -> ResourceLimits {
        ResourceLimits {
            max_samples,
            max_instances: 8,
            max_samples_per_instance: per_instance,
            max_quota_bytes: usize::MAX,
        }
    }

    fn occupancy(total: usize, in_instance: usize) -> Occupancy {
        Occupancy {
            total,
            instances: 1,
            in_instance,
            instance_known: true,
            bytes: 0,
            incoming_bytes: 1,
        }
    }

    #[test]
    fn test_admission_keep_last_evicts_in_instance() {
        let decision = admission_decision(History::KeepLast(3), &limits(100, 100), &occupancy(3, 3));
        assert_eq!(decision, Admission::EvictOldestInInstance);
    }

    #[test]
    fn test_admission_keep_all_rejects_when_full() {
        let decision = admission_decision(History::KeepAll, &limits(10, 10), &occupancy(10, 5));
        assert_eq!(decision, Admission::Reject(RejectReason::MaxSamples));
        let decision = admission_decision(History::KeepAll, &limits(10, 5), &occupancy(5, 5));
        assert_eq!(decision, Admission::Reject(RejectReason::MaxSamplesPerInstance));
    }

    #[test]
    fn test_admission_keep_last_evicts_oldest_when_total_full() {
        let decision = admission_decision(History::KeepLast(5), &limits(4, 4), &occupancy(4, 1));
        assert_eq!(decision, Admission::EvictOldest);
    }

    #[test]
    fn test_admission_rejects_new_instance_over_limit() {
        let mut occ = occupancy(1, 0);
        occ.instance_known = false;
        occ.instances = 8;
        let decision = admission_decision(History::KeepLast(1), &limits(100, 10), &occ);
        assert_eq!(decision, Admission::Reject(RejectReason::MaxInstances));
    }

    #[test]
    fn test_keep_last_retains_most_recent() {
        let mut history = SampleHistory::new(
            History::KeepLast(4),
            limits(100, 100),
            MemoryPolicy::Dynamic,
        );
        let mut evicted = Vec::new();
        for seq in 1..=10 {
            let outcome = history.add(sample(seq, 1, 4)).expect("KEEP_LAST never rejects");
            evicted.extend(outcome.evicted.iter().map(|k| k.seq));
        }
        let kept: Vec<u64> = history.iter().map(|c| c.sequence_number).collect();
        assert_eq!(kept, vec![7, 8, 9, 10]);
        assert_eq!(evicted, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(history.bytes(), 16);
    }

    #[test]
    fn test_keep_last_is_per_instance() {
        let mut history = SampleHistory::new(
            History::KeepLast(2),
            limits(100, 100),
            MemoryPolicy::Dynamic,
        );
        for seq in 1..=6 {
            history
                .add(sample(seq, seq % 2, 1))
                .expect("KEEP_LAST never rejects");
        }
        assert_eq!(history.instance_count(), 2);
        let odd: Vec<u64> = history
            .instance_keys(&KeyHash::from_u64(1))
            .iter()
            .map(|k| k.seq)
            .collect();
        assert_eq!(odd, vec![3, 5]);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_keep_all_rejects_eleventh() {
        let mut history =
            SampleHistory::new(History::KeepAll, limits(10, 10), MemoryPolicy::Dynamic);
        for seq in 1..=10 {
            history.add(sample(seq, 0, 1)).expect("within limits");
        }
        assert!(history.is_full());
        assert_eq!(history.add(sample(11, 0, 1)), Err(RejectReason::MaxSamplesPerInstance));
        assert_eq!(history.len(), 10);
    }

    #[test]
    fn test_preallocated_payload_limit() {
        let mut history = SampleHistory::new(
            History::KeepAll,
            limits(10, 10),
            MemoryPolicy::Preallocated { payload_max: 8 },
        );
        assert!(history.add(sample(1, 0, 8)).is_ok());
        assert_eq!(
            history.add(sample(2, 0, 9)),
            Err(RejectReason::PayloadTooLarge { size: 9, max: 8 })
        );
    }

    #[test]
    fn test_max_payload_is_tighter_bound() {
        let mut rl = limits(10, 10);
        rl.max_quota_bytes = 64;
        let dynamic = SampleHistory::new(History::KeepAll, rl, MemoryPolicy::Dynamic);
        assert_eq!(dynamic.max_payload(), 64);
        let prealloc = SampleHistory::new(
            History::KeepAll,
            rl,
            MemoryPolicy::Preallocated { payload_max: 8 },
        );
        assert_eq!(prealloc.max_payload(), 8);
    }

    #[test]
    fn test_quota_bytes_keep_last_evicts() {
        let mut rl = limits(100, 100);
        rl.max_quota_bytes = 10;
        let mut history = SampleHistory::new(History::KeepLast(100), rl, MemoryPolicy::Dynamic);
        history.add(sample(1, 0, 6)).expect("fits");
        let outcome = history.add(sample(2, 0, 6)).expect("evicts to fit");
        assert_eq!(outcome.evicted.len(), 1);
        assert_eq!(history.bytes(), 6);
        assert_eq!(history.add(sample(3, 0, 11)), Err(RejectReason::MaxQuotaBytes));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut history =
            SampleHistory::new(History::KeepAll, limits(10, 10), MemoryPolicy::Dynamic);
        history.add(sample(1, 0, 1)).expect("first add");
        assert_eq!(history.add(sample(1, 0, 1)), Err(RejectReason::Duplicate));
    }

    #[test]
    fn test_remove_and_min_max() {
        let mut history =
            SampleHistory::new(History::KeepAll, limits(10, 10), MemoryPolicy::Dynamic);
        for seq in [3, 1, 2] {
            history.add(sample(seq, 0, 1)).expect("within limits");
        }
        assert_eq!(history.min_seq(writer()), Some(1));
        assert_eq!(history.max_seq(writer()), Some(3));
        assert!(history.remove(&SampleKey::new(writer(), 2)));
        assert!(!history.remove(&SampleKey::new(writer(), 2)));
        assert_eq!(history.remove_min().map(|c| c.sequence_number), Some(1));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_eviction() {
        let mut history = SampleHistory::new(
            History::KeepLast(1),
            limits(10, 10),
            MemoryPolicy::Dynamic,
        );
        let first = history.add(sample(1, 0, 1)).expect("add").handle;
        history.add(sample(2, 0, 1)).expect("add");
        assert!(history.get_by_handle(first).is_none());
    }

    #[test]
    fn test_lifespan_expiry_index() {
        let mut history =
            SampleHistory::new(History::KeepAll, limits(10, 10), MemoryPolicy::Dynamic);
        let now = Instant::now();
        history
            .add(sample(1, 0, 1).with_expiry(Some(now + Duration::from_millis(10))))
            .expect("add");
        history
            .add(sample(2, 0, 1).with_expiry(Some(now + Duration::from_secs(60))))
            .expect("add");
        history.add(sample(3, 0, 1)).expect("add");

        assert_eq!(history.next_deadline(), Some(now + Duration::from_millis(10)));
        let expired = history.remove_expired(now + Duration::from_millis(20));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sequence_number, 1);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_deadline_index_reports_once_per_period() {
        let mut history =
            SampleHistory::new(History::KeepAll, limits(10, 10), MemoryPolicy::Dynamic);
        history.set_deadline(Some(Duration::from_millis(100)));
        let change = sample(1, 5, 1);
        let start = change.received_at;
        history.add(change).expect("add");

        assert!(history.missed_deadlines(start + Duration::from_millis(50)).is_empty());
        let missed = history.missed_deadlines(start + Duration::from_millis(150));
        assert_eq!(missed, vec![KeyHash::from_u64(5)]);
        assert!(history.missed_deadlines(start + Duration::from_millis(160)).is_empty());
    }
}
