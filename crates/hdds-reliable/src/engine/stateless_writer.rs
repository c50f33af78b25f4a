// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Best-effort writer engine.
//!
//! Every write goes out once to every matched reader; nothing is
//! acknowledged or retransmitted. The history still applies KEEP_LAST /
//! KEEP_ALL, lifespan and deadline, and seeds TRANSIENT_LOCAL late joiners.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use crossbeam::channel::Receiver;
use parking_lot::Mutex;

use super::events::{EventChannel, WriterEvent};
use super::timer::TimerHandle;
use super::{data_submessages, ReliabilityEngine};
use crate::config::WriterAttributes;
use crate::core::guid::{GuidPrefix, GUID};
use crate::dds::{Error, Result};
use crate::qos::{Durability, WriterQos};
use crate::reliability::history::{Admission, RejectReason, SampleHistory};
use crate::reliability::messages::{HeartbeatMsg, Submessage};
use crate::reliability::reader_proxy::RemoteReaderAttributes;
use crate::reliability::{
    CacheChange, ChangeKind, KeyHash, ReliableMetrics, SampleIdentity, SeqNumGenerator,
};
use crate::transport::{RtpsMessage, Transport};

struct StatelessInner {
    history: SampleHistory,
    readers: BTreeMap<GUID, RemoteReaderAttributes>,
    heartbeat_count: u32,
}

/// Fire-and-forget writer.
pub struct StatelessWriter {
    guid: GUID,
    qos: WriterQos,
    attrs: WriterAttributes,
    seq: SeqNumGenerator,
    inner: Mutex<StatelessInner>,
    transport: Arc<dyn Transport>,
    events: EventChannel<WriterEvent>,
    metrics: Arc<ReliableMetrics>,
    timer: ArcSwapOption<TimerHandle>,
}

impl StatelessWriter {
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

        log::debug!("[writer] created best-effort {} ({:?})", guid, qos.history);
        Ok(Self {
            guid,
            qos,
            attrs,
            seq: SeqNumGenerator::new(),
            inner: Mutex::new(StatelessInner {
                history,
                readers: BTreeMap::new(),
                heartbeat_count: 0,
            }),
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

    pub fn events(&self) -> Receiver<WriterEvent> {
        self.events.receiver()
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn last_sequence_number(&self) -> u64 {
        self.seq.last_assigned()
    }

    pub fn write(&self, instance_key: KeyHash, payload: impl Into<Arc<[u8]>>) -> Result<u64> {
        self.write_change(ChangeKind::Alive, instance_key, payload.into(), None)
    }

    /// Admit and send one change. A full KEEP_ALL history makes room by
    /// dropping its oldest samples, which were all sent already.
    pub fn write_change(
        &self,
        kind: ChangeKind,
        instance_key: KeyHash,
        payload: Arc<[u8]>,
        related: Option<SampleIdentity>,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        loop {
            let victim = match inner.history.check_admission(&instance_key, payload.len()) {
                Admission::Reject(RejectReason::MaxSamplesPerInstance) => {
                    inner.history.oldest_in_instance(&instance_key)
                }
                Admission::Reject(RejectReason::MaxSamples | RejectReason::MaxQuotaBytes) => {
                    inner.history.oldest()
                }
                Admission::Reject(reason) => return Err(Error::Rejected(reason)),
                _ => break,
            };
            let Some(victim) = victim else {
                break;
            };
            inner.history.remove(&victim);
        }

        let now = Instant::now();
        let seq = self.seq.next();
        let change = CacheChange::new(self.guid, seq, kind, instance_key, payload)
            .with_related(related)
            .with_expiry(self.qos.lifespan.expires_at(now));
        let timed = change.expires_at.is_some() || self.qos.deadline.enforced_period().is_some();

        let StatelessInner {
            history, readers, ..
        } = &mut *inner;
        let outcome = history.add(change).map_err(Error::Rejected)?;
        if let Some(change) = history.get_by_handle(outcome.handle) {
            for reader in readers.values() {
                self.send_change(change, reader);
            }
        }
        drop(inner);

        log::trace!("[writer] {} wrote seq={} (best-effort)", self.guid, seq);
        if timed {
            self.wake_timer();
        }
        Ok(seq)
    }

    pub fn clear_history(&self) -> usize {
        self.inner.lock().history.clear().len()
    }

    // ========================================================================
    // Matching
    // ========================================================================

    pub fn matched_reader_add(&self, attrs: RemoteReaderAttributes) -> Result<()> {
        if attrs.guid.is_zero() {
            return Err(Error::InvalidState("cannot match the zero GUID".to_string()));
        }
        let mut inner = self.inner.lock();
        if inner.readers.contains_key(&attrs.guid) {
            return Err(Error::AlreadyMatched(attrs.guid));
        }
        let guid = attrs.guid;
        if self.qos.durability == Durability::TransientLocal
            && attrs.durability == Durability::TransientLocal
        {
            for change in inner.history.iter() {
                self.send_change(change, &attrs);
            }
        }
        inner.readers.insert(guid, attrs);
        drop(inner);

        log::debug!("[writer] {} matched best-effort reader {}", self.guid, guid);
        self.events.emit(WriterEvent::PublicationMatched { reader: guid });
        Ok(())
    }

    pub fn matched_reader_remove(&self, guid: GUID) -> Result<()> {
        if self.inner.lock().readers.remove(&guid).is_none() {
            return Err(Error::NotMatched(guid));
        }
        log::debug!("[writer] {} unmatched reader {}", self.guid, guid);
        self.events.emit(WriterEvent::PublicationUnmatched { reader: guid });
        Ok(())
    }

    #[must_use]
    pub fn matched_readers(&self) -> Vec<GUID> {
        self.inner.lock().readers.keys().copied().collect()
    }

    /// Announce liveliness with a final HEARTBEAT carrying the liveliness flag.
    pub fn assert_liveliness(&self) {
        let mut inner = self.inner.lock();
        inner.heartbeat_count = inner.heartbeat_count.wrapping_add(1);
        let last = self.seq.last_assigned();
        let first = inner.history.min_seq(self.guid).unwrap_or(last + 1);
        for reader in inner.readers.values() {
            let heartbeat = HeartbeatMsg {
                reader_id: reader.guid.entity_id,
                writer_id: self.guid.entity_id,
                first_seq: first,
                last_seq: last,
                count: inner.heartbeat_count,
                final_flag: true,
                liveliness_flag: true,
            };
            self.send(reader, vec![Submessage::Heartbeat(heartbeat)]);
            self.metrics.increment_heartbeats_sent(1);
        }
    }

    fn send_change(&self, change: &CacheChange, reader: &RemoteReaderAttributes) {
        let submessages = data_submessages(
            change,
            reader.guid.entity_id,
            self.guid.entity_id,
            self.attrs.fragment_size,
            None,
        );
        self.send(reader, submessages);
        self.metrics.increment_data_sent(1);
    }

    fn send(&self, reader: &RemoteReaderAttributes, submessages: Vec<Submessage>) {
        let message = RtpsMessage {
            source_prefix: self.guid.prefix,
            destination: Some(reader.guid.prefix),
            submessages,
        };
        let locators = if reader.unicast_locators.is_empty() {
            &reader.multicast_locators
        } else {
            &reader.unicast_locators
        };
        if let Err(e) = self.transport.send(locators, &message) {
            log::warn!("[writer] {} send to {} failed: {}", self.guid, reader.guid, e);
        }
    }

    fn wake_timer(&self) {
        if let Some(timer) = self.timer.load().as_ref() {
            timer.wake();
        }
    }
}

impl ReliabilityEngine for StatelessWriter {
    fn guid(&self) -> GUID {
        self.guid
    }

    fn on_submessage(&self, _source_prefix: GuidPrefix, submessage: &Submessage) {
        log::trace!(
            "[writer] {} best-effort, ignoring {}",
            self.guid,
            submessage.kind_name()
        );
    }

    fn process_timers(&self, now: Instant) {
        let mut inner = self.inner.lock();
        let expired = inner.history.remove_expired(now);
        if !expired.is_empty() {
            log::trace!("[writer] {} lifespan expired {} sample(s)", self.guid, expired.len());
        }
        for instance in inner.history.missed_deadlines(now) {
            self.events
                .emit(WriterEvent::OfferedDeadlineMissed { instance });
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().history.next_deadline()
    }

    fn attach_timer(&self, handle: TimerHandle) {
        self.timer.store(Some(Arc::new(handle)));
    }
}

impl std::fmt::Debug for StatelessWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatelessWriter")
            .field("guid", &self.guid)
            .field("last_seq", &self.seq.last_assigned())
            .finish_non_exhaustive()
    }
}
