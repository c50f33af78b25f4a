// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Best-effort reader engine.
//!
//! Accepts any sample newer than the last one seen from its writer and makes
//! it visible immediately. Skipped sequence numbers are reported as lost;
//! late or repeated ones are dropped. Nothing is ever sent back.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};

use super::events::{EventChannel, ReaderEvent, SampleLostStatus};
use super::stateful_reader::IncomingSample;
use super::timer::TimerHandle;
use super::{earliest, ReliabilityEngine};
use crate::config::ReaderAttributes;
use crate::core::guid::{GuidPrefix, GUID};
use crate::dds::{Error, Result};
use crate::qos::{Reliability, ReaderQos};
use crate::reliability::fragment::FragmentOutcome;
use crate::reliability::history::{RejectReason, SampleHistory};
use crate::reliability::messages::{DataFragMsg, Submessage};
use crate::reliability::writer_proxy::{RemoteWriterAttributes, WriterProxy};
use crate::reliability::{CacheChange, ReliableMetrics, SampleInfo, SampleKey};

struct StatelessInner {
    history: SampleHistory,
    writers: BTreeMap<GUID, WriterProxy>,
    read_marks: HashSet<SampleKey>,
}

/// Reader without acknowledgement state.
pub struct StatelessReader {
    guid: GUID,
    qos: ReaderQos,
    attrs: ReaderAttributes,
    inner: Mutex<StatelessInner>,
    data: Condvar,
    events: EventChannel<ReaderEvent>,
    data_pending: AtomicBool,
    lost_status: Mutex<SampleLostStatus>,
    metrics: Arc<ReliableMetrics>,
    timer: ArcSwapOption<TimerHandle>,
}

impl StatelessReader {
    pub fn new(guid: GUID, qos: ReaderQos, attrs: ReaderAttributes) -> Result<Self> {
        qos.validate().map_err(Error::InvalidQos)?;
        attrs.validate().map_err(Error::InvalidQos)?;
        let mut history = SampleHistory::new(qos.history, qos.resource_limits, qos.memory_policy);
        history.set_deadline(qos.deadline.enforced_period());

        log::debug!("[reader] created best-effort {} ({:?})", guid, qos.history);
        Ok(Self {
            guid,
            qos,
            attrs,
            inner: Mutex::new(StatelessInner {
                history,
                writers: BTreeMap::new(),
                read_marks: HashSet::new(),
            }),
            data: Condvar::new(),
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

    pub fn events(&self) -> Receiver<ReaderEvent> {
        self.events.receiver()
    }

    pub fn sample_lost_status(&self) -> SampleLostStatus {
        self.lost_status.lock().read_and_reset()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn matched_writer_add(&self, mut attrs: RemoteWriterAttributes) -> Result<()> {
        if attrs.guid.is_zero() {
            return Err(Error::InvalidState("cannot match the zero GUID".to_string()));
        }
        // Reliability is never requested from the writer here.
        attrs.reliability = Reliability::BestEffort;
        if attrs.liveliness_lease.is_none() {
            attrs.liveliness_lease = self.qos.liveliness_lease;
        }
        let mut inner = self.inner.lock();
        if inner.writers.contains_key(&attrs.guid) {
            return Err(Error::AlreadyMatched(attrs.guid));
        }
        let guid = attrs.guid;
        let leased = attrs.liveliness_lease.is_some();
        let max_payload = inner.history.max_payload();
        inner.writers.insert(
            guid,
            WriterProxy::new(attrs, self.attrs.max_pending_fragmented, Instant::now())
                .with_max_sample_size(max_payload),
        );
        drop(inner);

        log::debug!("[reader] {} matched best-effort writer {}", self.guid, guid);
        self.events.emit(ReaderEvent::SubscriptionMatched { writer: guid });
        if leased {
            self.wake_timer();
        }
        Ok(())
    }

    pub fn matched_writer_remove(&self, guid: GUID) -> Result<()> {
        if self.inner.lock().writers.remove(&guid).is_none() {
            return Err(Error::NotMatched(guid));
        }
        log::debug!("[reader] {} unmatched writer {}", self.guid, guid);
        self.events.emit(ReaderEvent::SubscriptionUnmatched { writer: guid });
        Ok(())
    }

    #[must_use]
    pub fn matched_writers(&self) -> Vec<GUID> {
        self.inner.lock().writers.keys().copied().collect()
    }

    pub fn take(&self, max: usize) -> Vec<(SampleInfo, Arc<[u8]>)> {
        let mut inner = self.inner.lock();
        self.data_pending.store(false, Ordering::Release);
        let keys: Vec<SampleKey> = inner.history.iter().map(CacheChange::key).take(max).collect();
        let mut samples = Vec::with_capacity(keys.len());
        for key in keys {
            let already_read = inner.read_marks.remove(&key);
            if let Some(change) = inner.history.take(&key) {
                samples.push((SampleInfo::from_change(&change, already_read), change.payload));
            }
        }
        samples
    }

    pub fn read(&self, max: usize) -> Vec<(SampleInfo, Arc<[u8]>)> {
        let mut inner = self.inner.lock();
        self.data_pending.store(false, Ordering::Release);
        let StatelessInner {
            history,
            read_marks,
            ..
        } = &mut *inner;
        history
            .iter()
            .take(max)
            .map(|change| {
                let already_read = !read_marks.insert(change.key());
                (
                    SampleInfo::from_change(change, already_read),
                    Arc::clone(&change.payload),
                )
            })
            .collect()
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();
        loop {
            if !inner.history.is_empty() {
                return true;
            }
            let Some(deadline) = deadline else {
                self.data.wait(&mut inner);
                continue;
            };
            if self.data.wait_until(&mut inner, deadline).timed_out() {
                return !inner.history.is_empty();
            }
        }
    }

    fn accept(&self, writer: GUID, sample: IncomingSample, now: Instant) {
        let mut inner = self.inner.lock();
        let StatelessInner {
            history,
            writers,
            read_marks,
        } = &mut *inner;
        let Some(proxy) = writers.get_mut(&writer) else {
            log::trace!("[reader] {} sample from unmatched {}", self.guid, writer);
            return;
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
            return;
        }
        let lost = proxy.lost_changes_update(seq);
        if lost > 0 {
            self.metrics.record_samples_lost(lost);
            self.lost_status.lock().record(lost);
            self.events.emit(ReaderEvent::SampleLost {
                writer,
                count: lost,
            });
        }

        let change = CacheChange::new(writer, seq, sample.kind, sample.instance_key, sample.payload)
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
                proxy.received_change_set(seq);
                drop(inner);
                if !self.data_pending.swap(true, Ordering::AcqRel) {
                    self.events.emit(ReaderEvent::DataAvailable { writer });
                }
                self.data.notify_all();
            }
            Err(reason) => {
                proxy.irrelevant_change_set(seq);
                self.metrics.increment_samples_rejected(1);
                log::debug!("[reader] {} rejected seq={}: {}", self.guid, seq, reason);
                self.events.emit(ReaderEvent::SampleRejected {
                    writer,
                    seq,
                    reason,
                });
            }
        }
    }

    fn on_data_frag(&self, writer: GUID, msg: &DataFragMsg, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(proxy) = inner.writers.get_mut(&writer) else {
            return;
        };
        if proxy.is_duplicate(msg.seq) {
            return;
        }
        match proxy.assembler_mut().insert(msg, now) {
            FragmentOutcome::Complete(sample) => {
                drop(inner);
                let incoming = IncomingSample {
                    seq: sample.seq,
                    kind: sample.kind,
                    instance_key: sample.instance_key,
                    source_timestamp: sample.source_timestamp,
                    related_sample_id: sample.related_sample_id,
                    payload: sample.payload.into(),
                };
                self.accept(writer, incoming, now);
            }
            FragmentOutcome::TooLarge { size, max } => {
                proxy.irrelevant_change_set(msg.seq);
                drop(inner);
                let reason = RejectReason::PayloadTooLarge { size, max };
                self.metrics.increment_samples_rejected(1);
                log::debug!("[reader] {} rejected fragmented seq={}: {}", self.guid, msg.seq, reason);
                self.events.emit(ReaderEvent::SampleRejected {
                    writer,
                    seq: msg.seq,
                    reason,
                });
            }
            FragmentOutcome::Pending | FragmentOutcome::Dropped => {}
        }
    }

    fn wake_timer(&self) {
        if let Some(timer) = self.timer.load().as_ref() {
            timer.wake();
        }
    }
}

impl ReliabilityEngine for StatelessReader {
    fn guid(&self) -> GUID {
        self.guid
    }

    fn on_submessage(&self, source_prefix: GuidPrefix, submessage: &Submessage) {
        let now = Instant::now();
        match submessage {
            Submessage::Data(msg) => {
                let writer = GUID::new(source_prefix, msg.writer_id);
                self.accept(writer, IncomingSample::from(msg), now);
            }
            Submessage::DataFrag(msg) => {
                self.on_data_frag(GUID::new(source_prefix, msg.writer_id), msg, now);
            }
            Submessage::Heartbeat(msg) if msg.liveliness_flag => {
                let writer = GUID::new(source_prefix, msg.writer_id);
                let mut inner = self.inner.lock();
                if let Some(proxy) = inner.writers.get_mut(&writer) {
                    if proxy.assert_alive(now) {
                        self.events.emit(ReaderEvent::LivelinessChanged {
                            writer,
                            alive: true,
                        });
                    }
                }
            }
            other => log::trace!("[reader] {} best-effort, ignoring {}", self.guid, other.kind_name()),
        }
    }

    fn process_timers(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let expired = inner.history.remove_expired(now);
        for change in &expired {
            inner.read_marks.remove(&change.key());
        }
        for instance in inner.history.missed_deadlines(now) {
            self.events
                .emit(ReaderEvent::RequestedDeadlineMissed { instance });
        }
        for proxy in inner.writers.values_mut() {
            if proxy.check_liveliness(now) {
                log::debug!("[reader] {} writer {} lost liveliness", self.guid, proxy.guid());
                self.events.emit(ReaderEvent::LivelinessChanged {
                    writer: proxy.guid(),
                    alive: false,
                });
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.lock();
        inner
            .writers
            .values()
            .fold(inner.history.next_deadline(), |next, proxy| {
                earliest(next, proxy.lease_expiry())
            })
    }

    fn attach_timer(&self, handle: TimerHandle) {
        self.timer.store(Some(Arc::new(handle)));
    }
}

impl std::fmt::Debug for StatelessReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessReader")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qos::MemoryPolicy;
    use crate::reliability::fragment::split_change;
    use crate::reliability::messages::DataMsg;
    use crate::reliability::{ChangeKind, KeyHash};
    use crate::transport::Locator;
    use std::time::SystemTime;

    const WRITER_ID: [u8; 4] = [0, 0, 1, 0x03];
    const WRITER_PREFIX: GuidPrefix = [1; 12];

    fn writer_guid() -> GUID {
        GUID::new(WRITER_PREFIX, WRITER_ID)
    }

    fn reader() -> StatelessReader {
        let r = StatelessReader::new(
            GUID::new([2; 12], [0, 0, 1, 0x04]),
            ReaderQos::best_effort(),
            ReaderAttributes::default(),
        )
        .expect("reader creation should succeed");
        r.matched_writer_add(RemoteWriterAttributes::new(writer_guid(), Locator::intra(1)))
            .expect("match should succeed");
        r
    }

    fn data(seq: u64) -> Submessage {
        Submessage::Data(DataMsg {
            reader_id: [0, 0, 1, 0x04],
            writer_id: WRITER_ID,
            seq,
            kind: ChangeKind::Alive,
            instance_key: KeyHash::default(),
            source_timestamp: SystemTime::now(),
            related_sample_id: None,
            payload: Arc::from(vec![seq as u8]),
        })
    }

    fn seqs(r: &StatelessReader) -> Vec<u64> {
        r.take(usize::MAX)
            .into_iter()
            .map(|(info, _)| info.sequence_number)
            .collect()
    }

    #[test]
    fn test_newer_samples_accepted_older_dropped() {
        let r = reader();
        r.on_submessage(WRITER_PREFIX, &data(1));
        r.on_submessage(WRITER_PREFIX, &data(4));
        r.on_submessage(WRITER_PREFIX, &data(3));
        r.on_submessage(WRITER_PREFIX, &data(4));
        assert_eq!(seqs(&r), vec![1, 4]);
        let snapshot = r.metrics().snapshot();
        assert_eq!(snapshot.samples_lost, 2);
        assert_eq!(snapshot.duplicates, 2);
    }

    #[test]
    fn test_unmatched_writer_ignored() {
        let r = reader();
        r.on_submessage([7; 12], &data(1));
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn test_fragmented_sample_reassembled() {
        let r = reader();
        let change = CacheChange::new(
            writer_guid(),
            1,
            ChangeKind::Alive,
            KeyHash::default(),
            vec![9u8; 2500],
        );
        for frag in split_change(&change, [0, 0, 1, 0x04], WRITER_ID, 1024, None) {
            r.on_submessage(WRITER_PREFIX, &Submessage::DataFrag(frag));
        }
        let samples = r.take(1);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].1.len(), 2500);
    }

    #[test]
    fn test_lost_status_accumulates() {
        let r = reader();
        r.on_submessage(WRITER_PREFIX, &data(1));
        r.on_submessage(WRITER_PREFIX, &data(4));
        r.on_submessage(WRITER_PREFIX, &data(6));
        assert_eq!(
            r.sample_lost_status(),
            SampleLostStatus {
                total_count: 3,
                total_count_change: 3
            }
        );
        assert_eq!(r.sample_lost_status().total_count_change, 0);
    }

    #[test]
    fn test_oversized_fragmented_sample_refused() {
        let r = StatelessReader::new(
            GUID::new([2; 12], [0, 0, 1, 0x04]),
            ReaderQos::best_effort().memory_policy(MemoryPolicy::Preallocated { payload_max: 512 }),
            ReaderAttributes::default(),
        )
        .expect("reader creation should succeed");
        r.matched_writer_add(RemoteWriterAttributes::new(writer_guid(), Locator::intra(1)))
            .expect("match should succeed");
        let _ = r.events().try_iter().count();

        let change = CacheChange::new(
            writer_guid(),
            1,
            ChangeKind::Alive,
            KeyHash::default(),
            vec![9u8; 2500],
        );
        let mut frag = split_change(&change, [0, 0, 1, 0x04], WRITER_ID, 1024, None).remove(0);
        frag.sample_size = u32::MAX;
        r.on_submessage(WRITER_PREFIX, &Submessage::DataFrag(frag));

        let events: Vec<_> = r.events().try_iter().collect();
        assert!(events.contains(&ReaderEvent::SampleRejected {
            writer: writer_guid(),
            seq: 1,
            reason: RejectReason::PayloadTooLarge {
                size: u32::MAX as usize,
                max: 512
            },
        }));
        assert_eq!(r.metrics().snapshot().samples_rejected, 1);
        r.on_submessage(WRITER_PREFIX, &data(2));
        assert_eq!(seqs(&r), vec![2]);
        assert_eq!(r.sample_lost_status().total_count, 0);
    }

    #[test]
    fn test_wait_for_data_times_out_empty() {
        let r = reader();
        assert!(!r.wait_for_data(Duration::from_millis(5)));
        r.on_submessage(WRITER_PREFIX, &data(1));
        assert!(r.wait_for_data(Duration::from_millis(5)));
    }
}
