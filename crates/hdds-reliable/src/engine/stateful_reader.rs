// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable reader engine.
//!
//! Keeps one [`WriterProxy`] per matched writer and the reader history
//! behind a single mutex. Samples are admitted as they arrive, in any order,
//! but only become visible to `take()` / `read()` once every lower sequence
//! number of the same writer is accounted for (received, GAP, or lost).
//!
//! ```text
//!  DATA / DATA_FRAG ──> WriterProxy (received) ──> history (buffered)
//!  GAP             ──> WriterProxy (irrelevant)          │ low mark passes
//!  HEARTBEAT       ──> lost / max_available              v
//!                         │                         visible to take()
//!                         └──> ACKNACK + NACK_FRAG after heartbeat_response_delay
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};

use super::events::{EventChannel, ReaderEvent, SampleLostStatus};
use super::timer::TimerHandle;
use super::{earliest, ReliabilityEngine};
use crate::config::{ReaderAttributes, ReaderTimes};
use crate::core::guid::{GuidPrefix, GUID};
use crate::dds::{Error, Result};
use crate::qos::ReaderQos;
use crate::reliability::fragment::FragmentOutcome;
use crate::reliability::history::{RejectReason, SampleHistory};
use crate::reliability::messages::{
    AckNackMsg, DataFragMsg, DataMsg, GapMsg, HeartbeatMsg, NackFragMsg, Submessage,
};
use crate::reliability::writer_proxy::{RemoteWriterAttributes, WriterProxy, WriterProxySnapshot};
use crate::reliability::{
    CacheChange, ChangeKind, KeyHash, ReliableMetrics, SampleIdentity, SampleInfo, SampleKey,
};
use crate::transport::{RtpsMessage, Transport};

/// A complete sample on its way into the history.
pub(crate) struct IncomingSample {
    pub seq: u64,
    pub kind: ChangeKind,
    pub instance_key: KeyHash,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    pub payload: Arc<[u8]>,
}

impl From<&DataMsg> for IncomingSample {
    fn from(msg: &DataMsg) -> Self {
        Self {
            seq: msg.seq,
            kind: msg.kind,
            instance_key: msg.instance_key,
            source_timestamp: msg.source_timestamp,
            related_sample_id: msg.related_sample_id,
            payload: Arc::clone(&msg.payload),
        }
    }
}

struct ReaderInner {
    history: SampleHistory,
    proxies: BTreeMap<GUID, WriterProxy>,
    /// Samples already returned by `read()`.
    read_marks: HashSet<SampleKey>,
}

impl ReaderInner {
    fn is_visible(&self, key: &SampleKey) -> bool {
        self.proxies
            .get(&key.writer)
            .map_or(true, |proxy| key.seq <= proxy.low_mark())
    }

    fn visible_keys(&self, max: usize) -> Vec<SampleKey> {
        self.history
            .iter()
            .map(CacheChange::key)
            .filter(|key| self.is_visible(key))
            .take(max)
            .collect()
    }
}

/// Reader with per-writer reception state.
pub struct StatefulReader {
    guid: GUID,
    qos: ReaderQos,
    attrs: ReaderAttributes,
    times: ArcSwap<ReaderTimes>,
    inner: Mutex<ReaderInner>,
    /// Signalled when samples become visible.
    data: Condvar,
    transport: Arc<dyn Transport>,
    events: EventChannel<ReaderEvent>,
    /// A `DataAvailable` went out and nothing was taken or read since.
    data_pending: AtomicBool,
    lost_status: Mutex<SampleLostStatus>,
    metrics: Arc<ReliableMetrics>,
    timer: ArcSwapOption<TimerHandle>,
}

impl StatefulReader {
    pub fn new(
        guid: GUID,
        qos: ReaderQos,
        attrs: ReaderAttributes,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        qos.validate().map_err(Error::InvalidQos)?;
        attrs.validate().map_err(Error::InvalidQos)?;
        let mut history = SampleHistory::new(qos.history, qos.resource_limits, qos.memory_policy);
        history.set_deadline(qos.deadline.enforced_period());

        log::debug!("[reader] created {} ({:?})", guid, qos.history);
        Ok(Self {
            guid,
            qos,
            attrs,
            times: ArcSwap::from_pointee(attrs.times),
            inner: Mutex::new(ReaderInner {
                history,
                proxies: BTreeMap::new(),
                read_marks: HashSet::new(),
            }),
            data: Condvar::new(),
            transport,
            events: EventChannel::new(),
            data_pending: AtomicBool::new(false),
            lost_status: Mutex::new(SampleLostStatus::default()),
            metrics: Arc::new(ReliableMetrics::new()),
            timer: ArcSwapOption::empty(),
        })
    }

    #[must_use]
    pub fn qos(&self) -> &ReaderQos {
        &self.qos
    }

    /// Lost-sample counters; reading resets `total_count_change`.
    pub fn sample_lost_status(&self) -> SampleLostStatus {
        self.lost_status.lock().read_and_reset()
    }

    #[must_use]
    pub fn times(&self) -> ReaderTimes {
        **self.times.load()
    }

    pub fn update_times(&self, times: ReaderTimes) {
        self.times.store(Arc::new(times));
        self.wake_timer();
    }

    pub fn events(&self) -> Receiver<ReaderEvent> {
        self.events.receiver()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        Arc::clone(&self.metrics)
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// Start tracking a writer and schedule the preemptive ACKNACK.
    pub fn matched_writer_add(&self, mut attrs: RemoteWriterAttributes) -> Result<()> {
        if attrs.guid.is_zero() {
            return Err(Error::InvalidState("cannot match the zero GUID".to_string()));
        }
        if attrs.liveliness_lease.is_none() {
            attrs.liveliness_lease = self.qos.liveliness_lease;
        }
        let now = Instant::now();
        let times = self.times.load_full();
        let mut inner = self.inner.lock();
        if inner.proxies.contains_key(&attrs.guid) {
            return Err(Error::AlreadyMatched(attrs.guid));
        }

        let guid = attrs.guid;
        let mut proxy = WriterProxy::new(attrs, self.attrs.max_pending_fragmented, now)
            .with_max_sample_size(inner.history.max_payload());
        let mut armed = proxy.attributes().liveliness_lease.is_some();
        if proxy.is_reliable() {
            if times.initial_acknack_delay.is_zero() {
                self.send_acknack(&mut proxy);
            } else if let Some(at) = now.checked_add(times.initial_acknack_delay) {
                proxy.schedule_acknack(at);
                armed = true;
            }
        }
        inner.proxies.insert(guid, proxy);
        drop(inner);

        log::debug!("[reader] {} matched writer {}", self.guid, guid);
        self.events.emit(ReaderEvent::SubscriptionMatched { writer: guid });
        if armed {
            self.wake_timer();
        }
        Ok(())
    }

    /// Stop tracking a writer. Its buffered, not yet visible samples are
    /// dropped; visible ones stay readable.
    pub fn matched_writer_remove(&self, guid: GUID) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(proxy) = inner.proxies.remove(&guid) else {
            return Err(Error::NotMatched(guid));
        };
        let invisible: Vec<SampleKey> = inner
            .history
            .iter_writer(guid)
            .map(CacheChange::key)
            .filter(|key| key.seq > proxy.low_mark())
            .collect();
        for key in &invisible {
            inner.history.remove(key);
            inner.read_marks.remove(key);
        }
        drop(inner);

        log::debug!(
            "[reader] {} unmatched writer {} ({} buffered sample(s) dropped)",
            self.guid,
            guid,
            invisible.len()
        );
        self.events.emit(ReaderEvent::SubscriptionUnmatched { writer: guid });
        Ok(())
    }

    #[must_use]
    pub fn matched_writers(&self) -> Vec<GUID> {
        self.inner.lock().proxies.keys().copied().collect()
    }

    #[must_use]
    pub fn writer_snapshot(&self, guid: GUID) -> Option<WriterProxySnapshot> {
        self.inner.lock().proxies.get(&guid).map(WriterProxy::snapshot)
    }

    // ========================================================================
    // Application access
    // ========================================================================

    /// Remove and return up to `max` visible samples, in `(writer, seq)` order.
    pub fn take(&self, max: usize) -> Vec<(SampleInfo, Arc<[u8]>)> {
        let mut inner = self.inner.lock();
        self.data_pending.store(false, Ordering::Release);
        let keys = inner.visible_keys(max);
        let mut samples = Vec::with_capacity(keys.len());
        for key in keys {
            let already_read = inner.read_marks.remove(&key);
            if let Some(change) = inner.history.take(&key) {
                samples.push((SampleInfo::from_change(&change, already_read), change.payload));
            }
        }
        samples
    }

    /// Return up to `max` visible samples without removing them.
    pub fn read(&self, max: usize) -> Vec<(SampleInfo, Arc<[u8]>)> {
        let mut inner = self.inner.lock();
        self.data_pending.store(false, Ordering::Release);
        let keys = inner.visible_keys(max);
        let mut samples = Vec::with_capacity(keys.len());
        for key in keys {
            let already_read = !inner.read_marks.insert(key);
            if let Some(change) = inner.history.get(&key) {
                samples.push((
                    SampleInfo::from_change(change, already_read),
                    Arc::clone(&change.payload),
                ));
            }
        }
        samples
    }

    /// Number of samples `take()` would return with no limit.
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().visible_keys(usize::MAX).len()
    }

    /// Block until a sample is visible or the timeout elapses.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if !inner.visible_keys(1).is_empty() {
                return true;
            }
            let Some(deadline) = deadline else {
                self.data.wait(&mut inner);
                continue;
            };
            if self.data.wait_until(&mut inner, deadline).timed_out() {
                return !inner.visible_keys(1).is_empty();
            }
        }
    }

    // ========================================================================
    // Protocol input
    // ========================================================================

    fn on_data(&self, source_prefix: GuidPrefix, msg: &DataMsg) {
        let writer = GUID::new(source_prefix, msg.writer_id);
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if !inner.proxies.contains_key(&writer) {
            log::trace!("[reader] {} DATA from unmatched {}", self.guid, writer);
            return;
        }
        let advanced = self.accept(&mut inner, writer, IncomingSample::from(msg), now);
        drop(inner);
        self.announce(writer, advanced);
    }

    fn on_data_frag(&self, source_prefix: GuidPrefix, msg: &DataFragMsg) {
        let writer = GUID::new(source_prefix, msg.writer_id);
        let now = Instant::now();
        let times = self.times.load_full();
        let mut inner = self.inner.lock();
        let Some(proxy) = inner.proxies.get_mut(&writer) else {
            log::trace!("[reader] {} DATA_FRAG from unmatched {}", self.guid, writer);
            return;
        };
        if proxy.is_duplicate(msg.seq) {
            self.metrics.increment_duplicates(1);
            return;
        }
        let reliable = proxy.is_reliable();
        match proxy.assembler_mut().insert(msg, now) {
            FragmentOutcome::Complete(sample) => {
                let incoming = IncomingSample {
                    seq: sample.seq,
                    kind: sample.kind,
                    instance_key: sample.instance_key,
                    source_timestamp: sample.source_timestamp,
                    related_sample_id: sample.related_sample_id,
                    payload: sample.payload.into(),
                };
                let advanced = self.accept(&mut inner, writer, incoming, now);
                drop(inner);
                self.announce(writer, advanced);
            }
            FragmentOutcome::Pending => {
                if !reliable || proxy.acknack_at().is_some() {
                    return;
                }
                if let Some(at) = now.checked_add(times.fragment_repair_delay) {
                    proxy.schedule_acknack(at);
                    drop(inner);
                    self.wake_timer();
                }
            }
            FragmentOutcome::TooLarge { size, max } => {
                let reason = RejectReason::PayloadTooLarge { size, max };
                log::debug!(
                    "[reader] {} refusing fragmented seq={} from {}: {}",
                    self.guid,
                    msg.seq,
                    writer,
                    reason
                );
                self.metrics.increment_samples_rejected(1);
                self.events.emit(ReaderEvent::SampleRejected {
                    writer,
                    seq: msg.seq,
                    reason,
                });
                let advanced = proxy.irrelevant_change_set(msg.seq);
                self.report_lost(writer, 1);
                drop(inner);
                self.announce(writer, advanced);
            }
            FragmentOutcome::Dropped => {
                log::trace!("[reader] {} dropped fragment of seq={}", self.guid, msg.seq);
            }
        }
    }

    /// Admit one complete sample. Returns `true` when the writer's low mark
    /// moved, i.e. samples may have become visible.
    fn accept(
        &self,
        inner: &mut ReaderInner,
        writer: GUID,
        sample: IncomingSample,
        now: Instant,
    ) -> bool {
        let ReaderInner {
            history,
            proxies,
            read_marks,
        } = inner;
        let Some(proxy) = proxies.get_mut(&writer) else {
            return false;
        };
        if proxy.assert_alive(now) {
            self.events.emit(ReaderEvent::LivelinessChanged {
                writer,
                alive: true,
            });
        }

        let seq = sample.seq;
        if proxy.is_duplicate(seq) {
            self.metrics.increment_duplicates(1);
            log::trace!("[reader] {} duplicate seq={} from {}", self.guid, seq, writer);
            return false;
        }
        let mut advanced = false;
        if !proxy.is_reliable() {
            // No repair from a best-effort writer: whatever was skipped is gone.
            let low_before = proxy.low_mark();
            let lost = proxy.lost_changes_update(seq);
            self.report_lost(writer, lost);
            advanced = proxy.low_mark() != low_before;
        } else if seq > proxy.low_mark() + 1 {
            self.metrics.increment_out_of_order(1);
        }

        let change = CacheChange::new(
            writer,
            seq,
            sample.kind,
            sample.instance_key,
            sample.payload,
        )
        .with_source_timestamp(sample.source_timestamp)
        .with_related(sample.related_sample_id)
        .with_expiry(
            self.qos
                .lifespan
                .expires_at_received(sample.source_timestamp, now),
        );

        match history.add(change) {
            Ok(outcome) => {
                for key in &outcome.evicted {
                    read_marks.remove(key);
                }
                advanced |= proxy.received_change_set(seq);
            }
            Err(RejectReason::Duplicate) => {}
            Err(reason) => {
                self.metrics.increment_samples_rejected(1);
                self.events.emit(ReaderEvent::SampleRejected {
                    writer,
                    seq,
                    reason,
                });
                if !proxy.is_reliable() || matches!(reason, RejectReason::PayloadTooLarge { .. }) {
                    // Never admissible: skip it.
                    advanced |= proxy.irrelevant_change_set(seq);
                    self.report_lost(writer, 1);
                } else if proxy.buffered().next().is_none() {
                    // Full of visible samples not taken yet: drop it
                    // unrecorded so the writer repairs it later.
                    log::debug!(
                        "[reader] {} rejected seq={} from {}: {}",
                        self.guid,
                        seq,
                        writer,
                        reason
                    );
                } else if seq > proxy.low_mark() + 1 {
                    // Out-of-order samples hold the space: give up the
                    // oldest missing range so they can drain.
                    let lost = proxy.lost_changes_update(seq);
                    self.report_lost(writer, lost);
                    advanced = true;
                } else {
                    // Next expected sample cannot fit and blocks the
                    // buffered ones above it.
                    advanced |= proxy.irrelevant_change_set(seq);
                    self.report_lost(writer, 1);
                }
            }
        }
        advanced
    }

    fn on_heartbeat(&self, source_prefix: GuidPrefix, msg: &HeartbeatMsg) {
        let writer = GUID::new(source_prefix, msg.writer_id);
        let now = Instant::now();
        let times = self.times.load_full();
        let mut inner = self.inner.lock();
        let Some(proxy) = inner.proxies.get_mut(&writer) else {
            log::trace!("[reader] {} HEARTBEAT from unmatched {}", self.guid, writer);
            return;
        };
        let first_heartbeat = !proxy.heartbeat_seen();
        if !proxy.check_heartbeat_count(msg.count) {
            log::trace!("[reader] {} stale HEARTBEAT count={} from {}", self.guid, msg.count, writer);
            return;
        }
        self.metrics.increment_heartbeats_received(1);
        if proxy.assert_alive(now) {
            self.events.emit(ReaderEvent::LivelinessChanged {
                writer,
                alive: true,
            });
        }

        let low_before = proxy.low_mark();
        let lost = proxy.lost_changes_update(msg.first_seq);
        if first_heartbeat {
            if lost > 0 {
                log::debug!(
                    "[reader] {} joined {} at seq={}",
                    self.guid,
                    writer,
                    msg.first_seq
                );
            }
        } else {
            self.report_lost(writer, lost);
        }
        let advanced = proxy.low_mark() != low_before;
        proxy.missing_changes_update(msg.last_seq);

        let mut armed = false;
        if proxy.is_reliable() && (!msg.final_flag || proxy.has_missing()) {
            if times.heartbeat_response_delay.is_zero() {
                self.send_acknack(proxy);
            } else if let Some(at) = now.checked_add(times.heartbeat_response_delay) {
                proxy.schedule_acknack(at);
                armed = true;
            }
        }
        drop(inner);

        self.announce(writer, advanced);
        if armed {
            self.wake_timer();
        }
    }

    fn on_gap(&self, source_prefix: GuidPrefix, msg: &GapMsg) {
        let writer = GUID::new(source_prefix, msg.writer_id);
        let mut inner = self.inner.lock();
        let Some(proxy) = inner.proxies.get_mut(&writer) else {
            return;
        };
        self.metrics.increment_gaps_received(1);

        let base = msg.gap_list.base();
        let mut advanced = false;
        if base > msg.gap_start {
            advanced |= proxy.irrelevant_range_set(msg.gap_start, base - 1);
        }
        for seq in msg.gap_list.iter() {
            advanced |= proxy.irrelevant_change_set(seq);
        }
        log::trace!(
            "[reader] {} GAP from {}: {} irrelevant, low_mark={}",
            self.guid,
            writer,
            msg.irrelevant_count(),
            proxy.low_mark()
        );
        drop(inner);
        self.announce(writer, advanced);
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// ACKNACK for the missing window, plus one NACK_FRAG per partially
    /// received sample.
    fn send_acknack(&self, proxy: &mut WriterProxy) {
        let missing = proxy.missing_changes();
        let fragments = proxy.fragment_requests();
        let final_flag = missing.is_empty() && fragments.is_empty() && proxy.heartbeat_seen();
        let writer = proxy.guid();

        let mut submessages = vec![Submessage::AckNack(AckNackMsg {
            reader_id: self.guid.entity_id,
            writer_id: writer.entity_id,
            reader_sn_state: missing,
            count: proxy.next_acknack_count(),
            final_flag,
        })];
        for (seq, set) in &fragments {
            submessages.push(Submessage::NackFrag(NackFragMsg {
                reader_id: self.guid.entity_id,
                writer_id: writer.entity_id,
                writer_sn: *seq,
                fragment_number_state: *set,
                count: proxy.next_nackfrag_count(),
            }));
        }
        self.metrics.increment_acknacks_sent(1);
        self.metrics.increment_nack_frags_sent(fragments.len() as u64);
        log::trace!(
            "[reader] {} ACKNACK base={} missing={} frags={} to {}",
            self.guid,
            missing.base(),
            missing.len(),
            fragments.len(),
            writer
        );

        let message = RtpsMessage {
            source_prefix: self.guid.prefix,
            destination: Some(writer.prefix),
            submessages,
        };
        if let Err(e) = self.transport.send(proxy.locators(), &message) {
            log::warn!("[reader] {} send to {} failed: {}", self.guid, writer, e);
        }
    }

    fn report_lost(&self, writer: GUID, count: u64) {
        if count == 0 {
            return;
        }
        log::debug!("[reader] {} lost {} sample(s) of {}", self.guid, count, writer);
        self.metrics.record_samples_lost(count);
        self.lost_status.lock().record(count);
        self.events.emit(ReaderEvent::SampleLost { writer, count });
    }

    fn announce(&self, writer: GUID, advanced: bool) {
        if advanced {
            if !self.data_pending.swap(true, Ordering::AcqRel) {
                self.events.emit(ReaderEvent::DataAvailable { writer });
            }
            self.data.notify_all();
        }
    }

    fn wake_timer(&self) {
        if let Some(timer) = self.timer.load().as_ref() {
            timer.wake();
        }
    }
}

impl ReliabilityEngine for StatefulReader {
    fn guid(&self) -> GUID {
        self.guid
    }

    fn on_submessage(&self, source_prefix: GuidPrefix, submessage: &Submessage) {
        match submessage {
            Submessage::Data(msg) => self.on_data(source_prefix, msg),
            Submessage::DataFrag(msg) => self.on_data_frag(source_prefix, msg),
            Submessage::Heartbeat(msg) => self.on_heartbeat(source_prefix, msg),
            Submessage::Gap(msg) => self.on_gap(source_prefix, msg),
            other => log::trace!("[reader] {} ignoring {}", self.guid, other.kind_name()),
        }
    }

    fn process_timers(&self, now: Instant) {
        let mut inner = self.inner.lock();

        let expired = inner.history.remove_expired(now);
        for change in &expired {
            inner.read_marks.remove(&change.key());
        }
        if !expired.is_empty() {
            log::trace!("[reader] {} lifespan expired {} sample(s)", self.guid, expired.len());
        }
        for instance in inner.history.missed_deadlines(now) {
            self.events
                .emit(ReaderEvent::RequestedDeadlineMissed { instance });
        }

        for proxy in inner.proxies.values_mut() {
            if proxy.check_liveliness(now) {
                log::debug!("[reader] {} writer {} lost liveliness", self.guid, proxy.guid());
                self.events.emit(ReaderEvent::LivelinessChanged {
                    writer: proxy.guid(),
                    alive: false,
                });
            }
            if proxy.take_due_acknack(now) && proxy.is_reliable() {
                self.send_acknack(proxy);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        let mut next = inner.history.next_deadline();
        for proxy in inner.proxies.values() {
            next = earliest(next, proxy.acknack_at());
            next = earliest(next, proxy.lease_expiry());
        }
        next
    }

    fn attach_timer(&self, handle: TimerHandle) {
        self.timer.store(Some(Arc::new(handle)));
    }
}

impl std::fmt::Debug for StatefulReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulReader")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}
