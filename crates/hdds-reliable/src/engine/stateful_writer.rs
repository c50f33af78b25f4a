// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable writer engine.
//!
//! Owns the writer history and one [`ReaderProxy`] per matched reader, all
//! behind a single mutex. Drives the writer half of the reliability
//! protocol:
//!
//! ```text
//!  write() ──> history ──> proxies (Unsent) ──push──> DATA / DATA_FRAG
//!                                     ^                    │
//!              ACKNACK / NACK_FRAG ───┘ Requested          │
//!                  │                                       v
//!                  └──> resend DATA, or GAP when evicted   HEARTBEAT (periodic
//!                                                          while unacked)
//! ```
//!
//! Sends happen while the engine lock is held; the [`Transport`] contract
//! guarantees no synchronous re-entry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};

use super::events::{EventChannel, WriterEvent};
use super::timer::TimerHandle;
use super::{data_submessages, earliest, ReliabilityEngine};
use crate::config::{WriterAttributes, WriterTimes};
use crate::core::guid::{EntityId, GuidPrefix, GUID};
use crate::dds::{Error, Result};
use crate::qos::{Durability, WriterQos};
use crate::reliability::gap::build_gaps;
use crate::reliability::history::{Admission, RejectReason, SampleHistory};
use crate::reliability::messages::{AckNackMsg, HeartbeatMsg, NackFragMsg, Submessage};
use crate::reliability::reader_proxy::{
    ChangeStatus, ReaderProxy, ReaderProxySnapshot, RemoteReaderAttributes,
};
use crate::reliability::{
    CacheChange, ChangeKind, FragmentNumberSet, KeyHash, ReliableMetrics, SampleIdentity,
    SampleKey, SeqNumGenerator,
};
use crate::transport::{RtpsMessage, Transport};

struct WriterInner {
    history: SampleHistory,
    proxies: BTreeMap<GUID, ReaderProxy>,
    heartbeat_count: u32,
    next_heartbeat: Option<Instant>,
}

/// Writer with per-reader acknowledgement state.
pub struct StatefulWriter {
    guid: GUID,
    qos: WriterQos,
    attrs: WriterAttributes,
    times: ArcSwap<WriterTimes>,
    seq: SeqNumGenerator,
    inner: Mutex<WriterInner>,
    /// Signalled whenever acknowledgements or removals free history room.
    acked: Condvar,
    transport: Arc<dyn Transport>,
    events: EventChannel<WriterEvent>,
    metrics: Arc<ReliableMetrics>,
    timer: ArcSwapOption<TimerHandle>,
}

impl StatefulWriter {
    pub fn new(
        guid: GUID,
        qos: WriterQos,
        attrs: WriterAttributes,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        qos.validate().map_err(Error::InvalidQos)?;
        attrs.validate().map_err(Error::InvalidQos)?;
        let mut history = SampleHistory::new(qos.history, qos.resource_limits, qos.memory_policy);
        history.set_deadline(qos.deadline.enforced_period());

        log::debug!(
            "[writer] created {} ({:?}, {:?}, push={})",
            guid,
            qos.history,
            qos.durability,
            attrs.push_mode
        );
        Ok(Self {
            guid,
            qos,
            attrs,
            times: ArcSwap::from_pointee(attrs.times),
            seq: SeqNumGenerator::new(),
            inner: Mutex::new(WriterInner {
                history,
                proxies: BTreeMap::new(),
                heartbeat_count: 0,
                next_heartbeat: None,
            }),
            acked: Condvar::new(),
            transport,
            events: EventChannel::new(),
            metrics: Arc::new(ReliableMetrics::new()),
            timer: ArcSwapOption::empty(),
        })
    }

    #[must_use]
    pub fn qos(&self) -> &WriterQos {
        &self.qos
    }

    #[must_use]
    pub fn times(&self) -> WriterTimes {
        **self.times.load()
    }

    /// Swap the protocol timing; applies from the next scheduling decision.
    pub fn update_times(&self, times: WriterTimes) {
        self.times.store(Arc::new(times));
        self.wake_timer();
    }

    pub fn events(&self) -> Receiver<WriterEvent> {
        self.events.receiver()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Highest sequence number assigned so far.
    #[must_use]
    pub fn last_sequence_number(&self) -> u64 {
        self.seq.last_assigned()
    }

    // ========================================================================
    // Writing
    // ========================================================================

    /// Write an ALIVE sample. Returns its sequence number.
    pub fn write(&self, instance_key: KeyHash, payload: impl Into<Arc<[u8]>>) -> Result<u64> {
        self.write_change(ChangeKind::Alive, instance_key, payload.into(), None)
    }

    /// Admit a change, assign its sequence number and hand it to every
    /// matched reader.
    ///
    /// A full KEEP_ALL history first reclaims samples acknowledged by every
    /// reader. If none can be reclaimed the call fails with
    /// [`Error::Rejected`], or waits up to `max_blocking_time` and fails with
    /// [`Error::Timeout`].
    pub fn write_change(
        &self,
        kind: ChangeKind,
        instance_key: KeyHash,
        payload: Arc<[u8]>,
        related: Option<SampleIdentity>,
    ) -> Result<u64> {
        let blocking_deadline = self
            .qos
            .max_blocking_time
            .and_then(|t| Instant::now().checked_add(t));
        let mut inner = self.inner.lock();

        let mut timed_out = false;
        loop {
            let reason = match inner.history.check_admission(&instance_key, payload.len()) {
                Admission::Reject(reason) => reason,
                _ => break,
            };
            if matches!(reason, RejectReason::PayloadTooLarge { .. }) {
                return Err(Error::Rejected(reason));
            }
            if self.reclaim_acked(&mut inner, &instance_key, reason) {
                continue;
            }
            let Some(deadline) = blocking_deadline else {
                log::debug!("[writer] {} rejected write: {}", self.guid, reason);
                return Err(Error::Rejected(reason));
            };
            if timed_out {
                log::debug!("[writer] {} blocked write timed out: {}", self.guid, reason);
                return Err(Error::Timeout);
            }
            timed_out = self.acked.wait_until(&mut inner, deadline).timed_out();
        }

        let now = Instant::now();
        let seq = self.seq.next();
        let change = CacheChange::new(self.guid, seq, kind, instance_key, payload)
            .with_related(related)
            .with_expiry(self.qos.lifespan.expires_at(now));
        let timed = change.expires_at.is_some() || self.qos.deadline.enforced_period().is_some();

        let times = self.times.load_full();
        let until = suppression_until(now, &times);
        let WriterInner {
            history,
            proxies,
            next_heartbeat,
            ..
        } = &mut *inner;

        let outcome = history.add(change).map_err(Error::Rejected)?;
        for key in &outcome.evicted {
            for proxy in proxies.values_mut() {
                proxy.change_removed(key.seq);
            }
        }

        let mut has_reliable = false;
        if let Some(change) = history.get_by_handle(outcome.handle) {
            for proxy in proxies.values_mut() {
                if !proxy.is_reliable() {
                    let submessages = self.data_submessages(change, proxy.guid().entity_id, None);
                    self.send_to(proxy, submessages);
                    self.metrics.increment_data_sent(1);
                    continue;
                }
                has_reliable = true;
                if self.attrs.push_mode {
                    proxy.add_change(seq, outcome.handle, ChangeStatus::Unsent);
                    let submessages = self.data_submessages(change, proxy.guid().entity_id, None);
                    self.send_to(proxy, submessages);
                    self.metrics.increment_data_sent(1);
                    proxy.mark_sent(seq, until);
                } else {
                    proxy.add_change(seq, outcome.handle, ChangeStatus::Unacknowledged);
                }
            }
        }

        let mut armed = false;
        if has_reliable && next_heartbeat.is_none() {
            *next_heartbeat = now.checked_add(times.heartbeat_period);
            armed = true;
        }
        drop(inner);

        log::trace!("[writer] {} wrote seq={}", self.guid, seq);
        if armed || timed {
            self.wake_timer();
        }
        Ok(seq)
    }

    /// Remove the oldest sample every reliable reader has acknowledged.
    fn reclaim_acked(&self, inner: &mut WriterInner, instance: &KeyHash, reason: RejectReason) -> bool {
        let victim = match reason {
            RejectReason::MaxSamplesPerInstance => inner
                .history
                .instance_keys(instance)
                .into_iter()
                .find(|key| acked_by_all(&inner.proxies, key.seq)),
            _ => inner
                .history
                .iter()
                .map(CacheChange::key)
                .find(|key| acked_by_all(&inner.proxies, key.seq)),
        };
        let Some(key) = victim else {
            return false;
        };
        inner.history.remove(&key);
        for proxy in inner.proxies.values_mut() {
            proxy.change_removed(key.seq);
        }
        log::trace!("[writer] {} reclaimed acked seq={}", self.guid, key.seq);
        true
    }

    /// Drop every sample from the history. Readers still missing them get GAP.
    pub fn clear_history(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.history.clear();
        for key in &removed {
            for proxy in inner.proxies.values_mut() {
                proxy.change_removed(key.seq);
            }
        }
        self.acked.notify_all();
        removed.len()
    }

    /// Drop one sample from the history.
    pub fn remove_change(&self, seq: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.history.remove(&SampleKey::new(self.guid, seq)) {
            return false;
        }
        for proxy in inner.proxies.values_mut() {
            proxy.change_removed(seq);
        }
        self.acked.notify_all();
        true
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Start serving a reader.
    ///
    /// A TRANSIENT_LOCAL reader of a TRANSIENT_LOCAL writer is seeded with
    /// the whole history; any other reader starts after the last written
    /// sequence number.
    pub fn matched_reader_add(&self, attrs: RemoteReaderAttributes) -> Result<()> {
        if attrs.guid.is_zero() {
            return Err(Error::InvalidState("cannot match the zero GUID".to_string()));
        }
        let now = Instant::now();
        let times = self.times.load_full();
        let mut inner = self.inner.lock();
        if inner.proxies.contains_key(&attrs.guid) {
            return Err(Error::AlreadyMatched(attrs.guid));
        }

        let guid = attrs.guid;
        let last = self.seq.last_assigned();
        let seed = self.qos.durability == Durability::TransientLocal
            && attrs.durability == Durability::TransientLocal;
        let low_mark = if seed {
            inner
                .history
                .min_seq(self.guid)
                .map_or(last, |min| min.saturating_sub(1))
        } else {
            last
        };

        let mut proxy = ReaderProxy::new(attrs, low_mark);
        let reliable = proxy.is_reliable();
        if seed && reliable {
            let status = if self.attrs.push_mode {
                ChangeStatus::Unsent
            } else {
                ChangeStatus::Unacknowledged
            };
            for (seq, handle) in inner.history.handles_between(self.guid, low_mark + 1, last) {
                proxy.add_change(seq, handle, status);
            }
            if self.attrs.push_mode {
                self.flush_unsent(&inner.history, &mut proxy, now, &times);
            }
        }
        let has_unacked = proxy.has_unacked();
        inner.proxies.insert(guid, proxy);

        let mut armed = false;
        if reliable {
            self.send_heartbeats(&mut inner, Some(guid), false);
            if has_unacked && inner.next_heartbeat.is_none() {
                inner.next_heartbeat = now.checked_add(times.heartbeat_period);
                armed = true;
            }
        }
        drop(inner);

        log::debug!(
            "[writer] {} matched reader {} (low_mark={}, seeded={})",
            self.guid,
            guid,
            low_mark,
            seed && reliable
        );
        self.events.emit(WriterEvent::PublicationMatched { reader: guid });
        if armed {
            self.wake_timer();
        }
        Ok(())
    }

    /// Stop serving a reader; its pending retransmissions are dropped.
    pub fn matched_reader_remove(&self, guid: GUID) -> Result<()> {
        let removed = self.inner.lock().proxies.remove(&guid);
        if removed.is_none() {
            return Err(Error::NotMatched(guid));
        }
        self.acked.notify_all();
        log::debug!("[writer] {} unmatched reader {}", self.guid, guid);
        self.events.emit(WriterEvent::PublicationUnmatched { reader: guid });
        Ok(())
    }

    #[must_use]
    pub fn matched_readers(&self) -> Vec<GUID> {
        self.inner.lock().proxies.keys().copied().collect()
    }

    #[must_use]
    pub fn reader_snapshot(&self, guid: GUID) -> Option<ReaderProxySnapshot> {
        self.inner.lock().proxies.get(&guid).map(ReaderProxy::snapshot)
    }

    // ========================================================================
    // Acknowledgement queries
    // ========================================================================

    /// Block until every reliable reader acknowledged everything, or the
    /// timeout elapses. Returns whether everything is acknowledged.
    pub fn wait_for_all_acked(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if all_acked(&inner.proxies) {
                return true;
            }
            let Some(deadline) = deadline else {
                self.acked.wait(&mut inner);
                continue;
            };
            if self.acked.wait_until(&mut inner, deadline).timed_out() {
                return all_acked(&inner.proxies);
            }
        }
    }

    /// Sequence numbers not yet acknowledged by at least one reliable reader.
    #[must_use]
    pub fn get_unacked_count(&self) -> usize {
        let inner = self.inner.lock();
        let mut unacked = BTreeSet::new();
        for proxy in inner.proxies.values().filter(|p| p.is_reliable()) {
            unacked.extend(proxy.unacked_changes());
        }
        unacked.len()
    }

    #[must_use]
    pub fn is_acked_by_all(&self, seq: u64) -> bool {
        acked_by_all(&self.inner.lock().proxies, seq)
    }

    /// Send a HEARTBEAT with the liveliness flag to every reliable reader.
    pub fn assert_liveliness(&self) {
        let mut inner = self.inner.lock();
        self.send_heartbeats(&mut inner, None, true);
    }

    // ========================================================================
    // Protocol input
    // ========================================================================

    fn on_acknack(&self, source_prefix: GuidPrefix, msg: &AckNackMsg) {
        let reader = GUID::new(source_prefix, msg.reader_id);
        let now = Instant::now();
        let times = self.times.load_full();
        let last = self.seq.last_assigned();
        let mut inner = self.inner.lock();
        let WriterInner {
            history, proxies, ..
        } = &mut *inner;

        let Some(proxy) = proxies.get_mut(&reader) else {
            log::trace!("[writer] {} ACKNACK from unmatched {}", self.guid, reader);
            return;
        };
        if !proxy.is_reliable() {
            return;
        }
        if !proxy.check_acknack_count(msg.count) {
            log::trace!("[writer] {} stale ACKNACK count={} from {}", self.guid, msg.count, reader);
            return;
        }
        self.metrics.increment_acknacks_received(1);

        let base = msg.reader_sn_state.base().min(last.saturating_add(1));
        if let Some(previous) = proxy.acked_changes_set(base) {
            for (seq, handle) in history.handles_between(self.guid, proxy.low_mark() + 1, previous) {
                proxy.restore_change(seq, Some(handle));
            }
        }
        let outcome = proxy.requested_changes_set(&msg.reader_sn_state, last);
        if outcome.requested > 0 || !outcome.unknown.is_empty() {
            log::trace!(
                "[writer] {} reader {} requested {} change(s), {} unavailable",
                self.guid,
                reader,
                outcome.requested,
                outcome.unknown.len()
            );
        }

        let mut directed_heartbeat = false;
        let mut armed = false;
        if proxy.has_pending_response() {
            if times.nack_response_delay.is_zero() {
                self.respond(history, proxy, now, &times);
            } else if let Some(at) = now.checked_add(times.nack_response_delay) {
                proxy.schedule_nack_response(at);
                armed = true;
            }
        } else if !msg.final_flag && proxy.has_unacked() {
            directed_heartbeat = true;
        }

        if directed_heartbeat {
            self.send_heartbeats(&mut inner, Some(reader), false);
        }
        self.collect_acked(&mut inner);
        drop(inner);

        self.acked.notify_all();
        if armed {
            self.wake_timer();
        }
    }

    fn on_nackfrag(&self, source_prefix: GuidPrefix, msg: &NackFragMsg) {
        let reader = GUID::new(source_prefix, msg.reader_id);
        let now = Instant::now();
        let times = self.times.load_full();
        let last = self.seq.last_assigned();
        let mut inner = self.inner.lock();
        let WriterInner {
            history, proxies, ..
        } = &mut *inner;

        let Some(proxy) = proxies.get_mut(&reader) else {
            return;
        };
        if !proxy.is_reliable() || msg.writer_sn > last {
            return;
        }
        if !proxy.check_nackfrag_count(msg.count) {
            log::trace!("[writer] {} stale NACK_FRAG count={}", self.guid, msg.count);
            return;
        }
        self.metrics.increment_nack_frags_received(1);
        if !proxy.requested_fragments_set(msg.writer_sn, &msg.fragment_number_state) {
            return;
        }

        if times.nack_response_delay.is_zero() {
            self.respond(history, proxy, now, &times);
        } else if let Some(at) = now.checked_add(times.nack_response_delay) {
            proxy.schedule_nack_response(at);
            drop(inner);
            self.wake_timer();
        }
    }

    /// VOLATILE writers keep nothing every reader already has.
    fn collect_acked(&self, inner: &mut WriterInner) {
        if self.qos.durability != Durability::Volatile {
            return;
        }
        let Some(min_low) = inner
            .proxies
            .values()
            .filter(|p| p.is_reliable())
            .map(ReaderProxy::low_mark)
            .min()
        else {
            return;
        };
        let mut removed = 0usize;
        while let Some(seq) = inner.history.min_seq(self.guid) {
            if seq > min_low {
                break;
            }
            inner.history.remove(&SampleKey::new(self.guid, seq));
            removed += 1;
        }
        if removed > 0 {
            log::trace!("[writer] {} released {} acked sample(s)", self.guid, removed);
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn data_submessages(
        &self,
        change: &CacheChange,
        reader_id: EntityId,
        fragments: Option<&FragmentNumberSet>,
    ) -> Vec<Submessage> {
        data_submessages(
            change,
            reader_id,
            self.guid.entity_id,
            self.attrs.fragment_size,
            fragments,
        )
    }

    fn send_to(&self, proxy: &ReaderProxy, submessages: Vec<Submessage>) {
        if submessages.is_empty() {
            return;
        }
        let reader = proxy.guid();
        let message = RtpsMessage {
            source_prefix: self.guid.prefix,
            destination: Some(reader.prefix),
            submessages,
        };
        if let Err(e) = self.transport.send(proxy.locators(), &message) {
            log::warn!("[writer] {} send to {} failed: {}", self.guid, reader, e);
        }
    }

    /// Send every `Unsent` change of one proxy.
    fn flush_unsent(
        &self,
        history: &SampleHistory,
        proxy: &mut ReaderProxy,
        now: Instant,
        times: &WriterTimes,
    ) {
        let until = suppression_until(now, times);
        let reader_id = proxy.guid().entity_id;
        let mut submessages = Vec::new();
        let mut sent = 0u64;
        for seq in proxy.unsent_changes() {
            let handle = proxy.change(seq).and_then(|c| c.handle);
            if let Some(change) = handle.and_then(|h| history.get_by_handle(h)) {
                submessages.extend(self.data_submessages(change, reader_id, None));
                sent += 1;
            }
            proxy.mark_sent(seq, until);
        }
        self.metrics.increment_data_sent(sent);
        self.send_to(proxy, submessages);
    }

    /// Answer the pending requests of one reader: DATA for what is still in
    /// history, GAP for what is not.
    fn respond(
        &self,
        history: &SampleHistory,
        proxy: &mut ReaderProxy,
        now: Instant,
        times: &WriterTimes,
    ) {
        let until = suppression_until(now, times);
        let reader_id = proxy.guid().entity_id;
        let mut submessages = Vec::new();
        let mut unavailable = proxy.take_gap_pending();
        let mut resent = 0u64;

        for seq in proxy.requested_changes() {
            let Some((handle, fragments)) = proxy
                .change(seq)
                .map(|c| (c.handle, c.requested_fragments))
            else {
                continue;
            };
            match handle.and_then(|h| history.get_by_handle(h)) {
                Some(change) => {
                    submessages.extend(self.data_submessages(change, reader_id, fragments.as_ref()));
                    resent += 1;
                }
                None => unavailable.push(seq),
            }
            proxy.mark_sent(seq, until);
        }

        let low_mark = proxy.low_mark();
        unavailable.retain(|seq| *seq > low_mark);
        unavailable.sort_unstable();
        unavailable.dedup();
        if !unavailable.is_empty() {
            log::debug!(
                "[writer] {} GAP to {}: {:?}",
                self.guid,
                proxy.guid(),
                unavailable
            );
        }
        for gap in build_gaps(reader_id, self.guid.entity_id, &unavailable) {
            self.metrics.record_gap_sent(gap.irrelevant_count());
            submessages.push(Submessage::Gap(gap));
        }

        if resent > 0 {
            log::debug!("[writer] {} resent {} change(s) to {}", self.guid, resent, proxy.guid());
            self.metrics.increment_retransmit_sent(resent);
        }
        self.send_to(proxy, submessages);
    }

    fn heartbeat_for(
        &self,
        history: &SampleHistory,
        proxy: &ReaderProxy,
        count: u32,
        liveliness: bool,
    ) -> HeartbeatMsg {
        let last = self.seq.last_assigned();
        let first = history
            .min_seq(self.guid)
            .unwrap_or(last + 1)
            .max(proxy.floor() + 1);
        HeartbeatMsg {
            reader_id: proxy.guid().entity_id,
            writer_id: self.guid.entity_id,
            first_seq: first,
            last_seq: last,
            count,
            final_flag: !proxy.has_unacked(),
            liveliness_flag: liveliness,
        }
    }

    /// HEARTBEAT to every reliable reader, or only to `target`.
    fn send_heartbeats(&self, inner: &mut WriterInner, target: Option<GUID>, liveliness: bool) {
        inner.heartbeat_count = inner.heartbeat_count.wrapping_add(1);
        let count = inner.heartbeat_count;
        for proxy in inner.proxies.values() {
            if !proxy.is_reliable() || target.is_some_and(|t| t != proxy.guid()) {
                continue;
            }
            let heartbeat = self.heartbeat_for(&inner.history, proxy, count, liveliness);
            log::trace!(
                "[writer] {} HEARTBEAT [{}, {}] count={} to {}",
                self.guid,
                heartbeat.first_seq,
                heartbeat.last_seq,
                count,
                proxy.guid()
            );
            self.send_to(proxy, vec![Submessage::Heartbeat(heartbeat)]);
            self.metrics.increment_heartbeats_sent(1);
        }
    }

    fn wake_timer(&self) {
        if let Some(timer) = self.timer.load().as_ref() {
            timer.wake();
        }
    }
}

impl ReliabilityEngine for StatefulWriter {
    fn guid(&self) -> GUID {
        self.guid
    }

    fn on_submessage(&self, source_prefix: GuidPrefix, submessage: &Submessage) {
        match submessage {
            Submessage::AckNack(msg) => self.on_acknack(source_prefix, msg),
            Submessage::NackFrag(msg) => self.on_nackfrag(source_prefix, msg),
            other => log::trace!("[writer] {} ignoring {}", self.guid, other.kind_name()),
        }
    }

    fn process_timers(&self, now: Instant) {
        let times = self.times.load_full();
        let mut inner = self.inner.lock();

        let expired = inner.history.remove_expired(now);
        if !expired.is_empty() {
            log::trace!("[writer] {} lifespan expired {} sample(s)", self.guid, expired.len());
            for change in &expired {
                for proxy in inner.proxies.values_mut() {
                    proxy.change_removed(change.sequence_number);
                }
            }
            self.acked.notify_all();
        }
        for instance in inner.history.missed_deadlines(now) {
            self.events
                .emit(WriterEvent::OfferedDeadlineMissed { instance });
        }

        let WriterInner {
            history, proxies, ..
        } = &mut *inner;
        for proxy in proxies.values_mut() {
            proxy.expire_suppression(now);
            if proxy.take_due_nack_response(now) {
                self.respond(history, proxy, now, &times);
            }
        }

        if inner.next_heartbeat.is_some_and(|at| at <= now) {
            let pending = inner
                .proxies
                .values()
                .any(|p| p.is_reliable() && p.has_unacked());
            if pending {
                self.send_heartbeats(&mut inner, None, false);
                inner.next_heartbeat = now.checked_add(times.heartbeat_period);
            } else {
                inner.next_heartbeat = None;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        let mut next = earliest(inner.history.next_deadline(), inner.next_heartbeat);
        for proxy in inner.proxies.values() {
            next = earliest(next, proxy.nack_response_at());
            next = earliest(next, proxy.next_suppression_expiry());
        }
        next
    }

    fn attach_timer(&self, handle: TimerHandle) {
        self.timer.store(Some(Arc::new(handle)));
    }
}

impl std::fmt::Debug for StatefulWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulWriter")
            .field("guid", &self.guid)
            .field("last_seq", &self.seq.last_assigned())
            .finish_non_exhaustive()
    }
}

fn suppression_until(now: Instant, times: &WriterTimes) -> Option<Instant> {
    if times.nack_suppression_duration.is_zero() {
        None
    } else {
        now.checked_add(times.nack_suppression_duration)
    }
}

fn acked_by_all(proxies: &BTreeMap<GUID, ReaderProxy>, seq: u64) -> bool {
    proxies
        .values()
        .filter(|p| p.is_reliable())
        .all(|p| p.is_acked(seq))
}

fn all_acked(proxies: &BTreeMap<GUID, ReaderProxy>) -> bool {
    proxies
        .values()
        .filter(|p| p.is_reliable())
        .all(|p| !p.has_unacked())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::CaptureTransport;
    use crate::reliability::bitmap::SequenceBitmapRange;
    use crate::transport::Locator;
    use std::thread;

    const WRITER_ID: EntityId = [0, 0, 1, 0x02];
    const READER_ID: EntityId = [0, 0, 1, 0x07];

    fn reader_guid() -> GUID {
        GUID::new([2; 12], READER_ID)
    }

    fn instant_times() -> WriterTimes {
        WriterTimes {
            heartbeat_period: Duration::from_millis(100),
            nack_response_delay: Duration::ZERO,
            nack_suppression_duration: Duration::ZERO,
        }
    }

    fn writer_with(qos: WriterQos, attrs: WriterAttributes) -> (StatefulWriter, Arc<CaptureTransport>) {
        let transport = Arc::new(CaptureTransport::default());
        let writer = StatefulWriter::new(GUID::new([1; 12], WRITER_ID), qos, attrs, transport.clone())
            .expect("writer creation should succeed");
        (writer, transport)
    }

    fn writer(qos: WriterQos) -> (StatefulWriter, Arc<CaptureTransport>) {
        writer_with(qos, WriterAttributes::default().with_times(instant_times()))
    }

    fn acknack(base: u64, missing: &[u64], count: u32) -> Submessage {
        Submessage::AckNack(AckNackMsg {
            reader_id: READER_ID,
            writer_id: WRITER_ID,
            reader_sn_state: SequenceBitmapRange::from_items(base, missing.iter().copied()),
            count,
            final_flag: missing.is_empty(),
        })
    }

    fn matched(qos: WriterQos) -> (StatefulWriter, Arc<CaptureTransport>) {
        let (w, t) = writer(qos);
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        t.take();
        (w, t)
    }

    #[test]
    fn test_write_pushes_data() {
        let (w, t) = matched(WriterQos::reliable());
        assert_eq!(w.write(KeyHash::default(), vec![1u8]).expect("write should succeed"), 1);
        assert_eq!(w.write(KeyHash::default(), vec![2u8]).expect("write should succeed"), 2);
        assert_eq!(t.data_seqs(), vec![1, 2]);
        assert_eq!(w.get_unacked_count(), 2);
        assert!(!w.is_acked_by_all(1));
    }

    #[test]
    fn test_acknack_resends_requested_only() {
        let (w, t) = matched(WriterQos::reliable());
        for i in 0..5u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        t.take();
        w.on_submessage([2; 12], &acknack(3, &[3], 1));
        assert_eq!(t.data_seqs(), vec![3]);
        assert!(w.is_acked_by_all(2));
        assert_eq!(w.metrics().retransmit_sent(), 1);
    }

    #[test]
    fn test_stale_acknack_ignored() {
        let (w, t) = matched(WriterQos::reliable());
        for i in 0..3u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        t.take();
        w.on_submessage([2; 12], &acknack(2, &[2], 5));
        assert_eq!(t.data_seqs(), vec![2]);
        w.on_submessage([2; 12], &acknack(2, &[2], 5));
        w.on_submessage([2; 12], &acknack(1, &[1, 2], 3));
        assert!(t.data_seqs().is_empty());
    }

    #[test]
    fn test_evicted_request_answered_with_gap() {
        let (w, t) = matched(WriterQos::reliable().keep_last(2));
        for i in 0..4u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        t.take();
        // 1 and 2 were evicted by KEEP_LAST(2).
        w.on_submessage([2; 12], &acknack(1, &[1, 2, 3], 1));
        let sent = t.take();
        let gaps: Vec<_> = sent
            .iter()
            .flat_map(|m| m.submessages.iter())
            .filter_map(|s| match s {
                Submessage::Gap(g) => Some((g.gap_start, g.gap_list.base())),
                _ => None,
            })
            .collect();
        assert_eq!(gaps, vec![(1, 3)]);
        assert_eq!(CaptureTransport::seqs_of(&sent), vec![3]);
    }

    #[test]
    fn test_keep_all_full_rejects() {
        let (w, _t) = matched(WriterQos::reliable().keep_all().max_samples(10));
        for i in 0..10u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        match w.write(KeyHash::default(), vec![10u8]) {
            Err(Error::Rejected(_)) => {}
            other => panic!("expected Rejected, got {:?}", other),
        }
        assert_eq!(w.last_sequence_number(), 10);
    }

    #[test]
    fn test_keep_all_reclaims_acked() {
        let (w, _t) = matched(WriterQos::reliable().keep_all().max_samples(3).transient_local());
        for i in 0..3u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        w.on_submessage([2; 12], &acknack(4, &[], 1));
        assert_eq!(w.write(KeyHash::default(), vec![9u8]).expect("write should succeed"), 4);
    }

    #[test]
    fn test_blocking_write_times_out() {
        let qos = WriterQos::reliable()
            .keep_all()
            .max_samples(1)
            .blocking(Duration::from_millis(30));
        let (w, _t) = matched(qos);
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        let started = Instant::now();
        assert!(matches!(w.write(KeyHash::default(), vec![2u8]), Err(Error::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_blocking_write_released_by_ack() {
        let qos = WriterQos::reliable()
            .keep_all()
            .max_samples(1)
            .blocking(Duration::from_secs(5));
        let (w, _t) = matched(qos);
        let w = Arc::new(w);
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        let acker = {
            let w = Arc::clone(&w);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                w.on_submessage([2; 12], &acknack(2, &[], 1));
            })
        };
        assert_eq!(w.write(KeyHash::default(), vec![2u8]).expect("write should succeed"), 2);
        acker.join().expect("acker thread should finish");
    }

    #[test]
    fn test_wait_for_all_acked() {
        let (w, _t) = matched(WriterQos::reliable());
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        assert!(!w.wait_for_all_acked(Duration::from_millis(10)));
        w.on_submessage([2; 12], &acknack(2, &[], 1));
        assert!(w.wait_for_all_acked(Duration::from_millis(10)));
        assert_eq!(w.get_unacked_count(), 0);
    }

    #[test]
    fn test_periodic_heartbeat_while_unacked() {
        let (w, t) = matched(WriterQos::reliable());
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        w.write(KeyHash::default(), vec![2u8]).expect("write should succeed");
        t.take();
        let due = w.next_deadline().expect("heartbeat should be armed");
        w.process_timers(due);
        let heartbeats = t.heartbeats();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!((heartbeats[0].first_seq, heartbeats[0].last_seq), (1, 2));
        assert!(!heartbeats[0].final_flag);

        w.on_submessage([2; 12], &acknack(3, &[], 1));
        w.process_timers(due + Duration::from_millis(200));
        assert!(t.heartbeats().is_empty());
        assert_eq!(w.next_deadline(), None);
    }

    #[test]
    fn test_volatile_late_joiner_starts_after_last() {
        let (w, t) = writer(WriterQos::reliable());
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        w.write(KeyHash::default(), vec![2u8]).expect("write should succeed");
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        let heartbeats = t.heartbeats();
        assert_eq!(heartbeats.len(), 1);
        assert_eq!((heartbeats[0].first_seq, heartbeats[0].last_seq), (3, 2));
        assert!(heartbeats[0].final_flag);
        assert_eq!(w.get_unacked_count(), 0);
        // A regressing ACKNACK cannot pull pre-match samples back.
        w.on_submessage([2; 12], &acknack(1, &[1, 2], 1));
        assert!(t.data_seqs().is_empty());
    }

    #[test]
    fn test_transient_local_seeds_reader() {
        let (w, t) = writer(WriterQos::reliable().transient_local());
        for i in 0..3u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        w.matched_reader_add(
            RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)).transient_local(),
        )
        .expect("match should succeed");
        assert_eq!(t.data_seqs(), vec![1, 2, 3]);
        assert_eq!(w.get_unacked_count(), 3);
    }

    #[test]
    fn test_duplicate_match_rejected() {
        let (w, _t) = matched(WriterQos::reliable());
        let again = w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)));
        assert!(matches!(again, Err(Error::AlreadyMatched(_))));
        assert!(matches!(
            w.matched_reader_remove(GUID::new([7; 12], READER_ID)),
            Err(Error::NotMatched(_))
        ));
        let events: Vec<_> = w.events().try_iter().collect();
        assert_eq!(
            events,
            vec![WriterEvent::PublicationMatched {
                reader: reader_guid()
            }]
        );
    }

    #[test]
    fn test_nack_response_delay_defers_resend() {
        let times = WriterTimes {
            nack_response_delay: Duration::from_millis(20),
            ..instant_times()
        };
        let (w, t) = writer_with(WriterQos::reliable(), WriterAttributes::default().with_times(times));
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        t.take();
        w.on_submessage([2; 12], &acknack(1, &[1], 1));
        assert!(t.data_seqs().is_empty());
        w.process_timers(Instant::now() + Duration::from_millis(25));
        assert_eq!(t.data_seqs(), vec![1]);
    }

    #[test]
    fn test_nack_suppression_ignores_early_requests() {
        let times = WriterTimes {
            nack_suppression_duration: Duration::from_millis(50),
            ..instant_times()
        };
        let (w, t) = writer_with(WriterQos::reliable(), WriterAttributes::default().with_times(times));
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        t.take();
        w.on_submessage([2; 12], &acknack(1, &[1], 1));
        assert!(t.data_seqs().is_empty());

        w.process_timers(Instant::now() + Duration::from_millis(60));
        t.take();
        w.on_submessage([2; 12], &acknack(1, &[1], 2));
        assert_eq!(t.data_seqs(), vec![1]);
    }

    #[test]
    fn test_large_payload_fragmented_and_repaired() {
        let attrs = WriterAttributes::default()
            .with_times(instant_times())
            .fragment_size(100);
        let (w, t) = writer_with(WriterQos::reliable(), attrs);
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        t.take();
        w.write(KeyHash::default(), vec![7u8; 250]).expect("write should succeed");
        assert_eq!(t.fragments(), vec![(1, 1), (1, 2), (1, 3)]);

        let nack = Submessage::NackFrag(NackFragMsg {
            reader_id: READER_ID,
            writer_id: WRITER_ID,
            writer_sn: 1,
            fragment_number_state: FragmentNumberSet::from_items(2, [2]),
            count: 1,
        });
        w.on_submessage([2; 12], &nack);
        assert_eq!(t.fragments(), vec![(1, 2)]);
    }

    #[test]
    fn test_best_effort_proxy_not_tracked() {
        let (w, t) = writer(WriterQos::reliable());
        w.matched_reader_add(
            RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)).best_effort(),
        )
        .expect("match should succeed");
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        assert_eq!(t.data_seqs(), vec![1]);
        assert_eq!(w.get_unacked_count(), 0);
        assert!(w.wait_for_all_acked(Duration::ZERO));
        assert_eq!(w.next_deadline(), None);
    }

    #[test]
    fn test_sequence_numbers_never_reused_after_eviction() {
        let (w, t) = matched(WriterQos::reliable().keep_last(2));
        let mut seqs = Vec::new();
        for i in 0..10u8 {
            seqs.push(w.write(KeyHash::default(), vec![i]).expect("write should succeed"));
            if i == 4 {
                assert_eq!(w.clear_history(), 2);
            }
        }
        assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
        assert_eq!(t.data_seqs(), seqs);
    }

    #[test]
    fn test_removed_change_answered_with_gap() {
        let (w, t) = matched(WriterQos::reliable().keep_all());
        for i in 0..3u8 {
            w.write(KeyHash::default(), vec![i]).expect("write should succeed");
        }
        t.take();
        assert!(w.remove_change(2));
        assert!(!w.remove_change(2));
        w.on_submessage([2; 12], &acknack(2, &[2], 1));
        let gaps = t.gaps();
        assert_eq!(gaps.len(), 1);
        assert_eq!((gaps[0].gap_start, gaps[0].gap_list.base()), (2, 3));
        assert!(gaps[0].gap_list.is_empty());
    }

    #[test]
    fn test_pull_mode_waits_for_request() {
        let attrs = WriterAttributes::default()
            .with_times(instant_times())
            .push_mode(false);
        let (w, t) = writer_with(WriterQos::reliable(), attrs);
        w.matched_reader_add(RemoteReaderAttributes::new(reader_guid(), Locator::intra(2)))
            .expect("match should succeed");
        t.take();
        w.write(KeyHash::default(), vec![1u8]).expect("write should succeed");
        assert!(t.data_seqs().is_empty());
        w.on_submessage([2; 12], &acknack(1, &[1], 1));
        assert_eq!(t.data_seqs(), vec![1]);
    }

    #[test]
    fn test_offered_deadline_missed() {
        let (w, _t) = matched(WriterQos::reliable().deadline(Duration::from_millis(10)));
        w.write(KeyHash::from_u64(4), vec![1u8]).expect("write should succeed");
        w.process_timers(Instant::now() + Duration::from_millis(20));
        let missed: Vec<_> = w
            .events()
            .try_iter()
            .filter(|e| matches!(e, WriterEvent::OfferedDeadlineMissed { .. }))
            .collect();
        assert_eq!(
            missed,
            vec![WriterEvent::OfferedDeadlineMissed {
                instance: KeyHash::from_u64(4)
            }]
        );
    }
}
