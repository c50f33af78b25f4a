// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incoming message demultiplexer.
//!
//! Routes each submessage of an [`RtpsMessage`] to the local engine it
//! addresses:
//!
//! - INFO_DST for another participant: whole message dropped
//! - DATA / DATA_FRAG / HEARTBEAT / GAP: to the addressed reader, or to every
//!   local reader when the reader entity id is unknown
//! - ACKNACK / NACK_FRAG: to the addressed writer
//!
//! Submessages failing [`Submessage::validate`] are protocol violations:
//! logged and dropped without touching any engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::RtpsMessage;
use crate::core::guid::{EntityId, GuidPrefix, ENTITYID_UNKNOWN, GUIDPREFIX_UNKNOWN};
use crate::engine::ReliabilityEngine;
use crate::reliability::messages::Submessage;

/// Per-participant endpoint table.
pub struct MessageReceiver {
    prefix: GuidPrefix,
    readers: DashMap<EntityId, Arc<dyn ReliabilityEngine>>,
    writers: DashMap<EntityId, Arc<dyn ReliabilityEngine>>,
    dispatched: AtomicU64,
    dropped: AtomicU64,
}

impl MessageReceiver {
    pub fn new(prefix: GuidPrefix) -> Self {
        Self {
            prefix,
            readers: DashMap::new(),
            writers: DashMap::new(),
            dispatched: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn prefix(&self) -> GuidPrefix {
        self.prefix
    }

    pub fn register_reader(&self, engine: Arc<dyn ReliabilityEngine>) {
        self.readers.insert(engine.guid().entity_id, engine);
    }

    pub fn register_writer(&self, engine: Arc<dyn ReliabilityEngine>) {
        self.writers.insert(engine.guid().entity_id, engine);
    }

    pub fn unregister_reader(&self, entity_id: &EntityId) {
        self.readers.remove(entity_id);
    }

    pub fn unregister_writer(&self, entity_id: &EntityId) {
        self.writers.remove(entity_id);
    }

    /// Demux one message. Returns the number of engine deliveries.
    pub fn on_message(&self, message: &RtpsMessage) -> usize {
        if let Some(dst) = message.destination {
            if dst != self.prefix && dst != GUIDPREFIX_UNKNOWN {
                log::trace!("[receiver] message for another participant, skipping");
                return 0;
            }
        }

        let mut delivered = 0usize;
        for submessage in &message.submessages {
            if let Err(e) = submessage.validate() {
                log::warn!("[receiver] dropping invalid submessage: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let targets = self.targets(submessage);
            if targets.is_empty() {
                log::trace!(
                    "[receiver] no local endpoint for {}",
                    submessage.kind_name()
                );
                continue;
            }
            for engine in targets {
                engine.on_submessage(message.source_prefix, submessage);
                delivered += 1;
            }
        }
        self.dispatched.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    fn targets(&self, submessage: &Submessage) -> Vec<Arc<dyn ReliabilityEngine>> {
        if submessage.is_writer_to_reader() {
            let reader_id = submessage.reader_id();
            if reader_id == ENTITYID_UNKNOWN {
                return self.readers.iter().map(|e| Arc::clone(e.value())).collect();
            }
            return self
                .readers
                .get(&reader_id)
                .map(|e| vec![Arc::clone(e.value())])
                .unwrap_or_default();
        }
        self.writers
            .get(&submessage.writer_id())
            .map(|e| vec![Arc::clone(e.value())])
            .unwrap_or_default()
    }

    /// Submessages dropped as protocol violations.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.readers.len() + self.writers.len()
    }
}

impl std::fmt::Debug for MessageReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageReceiver")
            .field("readers", &self.readers.len())
            .field("writers", &self.writers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::GUID;
    use crate::engine::TimerHandle;
    use crate::reliability::bitmap::SequenceBitmapRange;
    use crate::reliability::messages::{AckNackMsg, HeartbeatMsg};
    use parking_lot::Mutex;
    use std::time::Instant;

    struct Recorder {
        guid: GUID,
        seen: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn new(entity_id: EntityId) -> Arc<Self> {
            Arc::new(Self {
                guid: GUID::new([9; 12], entity_id),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl ReliabilityEngine for Recorder {
        fn guid(&self) -> GUID {
            self.guid
        }
        fn on_submessage(&self, _source_prefix: GuidPrefix, submessage: &Submessage) {
            self.seen.lock().push(submessage.kind_name());
        }
        fn process_timers(&self, _now: Instant) {}
        fn next_deadline(&self) -> Option<Instant> {
            None
        }
        fn attach_timer(&self, _handle: TimerHandle) {}
    }

    const WRITER: EntityId = [0, 0, 1, 0x02];
    const READER_A: EntityId = [0, 0, 1, 0x07];
    const READER_B: EntityId = [0, 0, 2, 0x07];

    fn heartbeat(reader_id: EntityId, first_seq: u64) -> Submessage {
        Submessage::Heartbeat(HeartbeatMsg {
            reader_id,
            writer_id: WRITER,
            first_seq,
            last_seq: 3,
            count: 1,
            final_flag: false,
            liveliness_flag: false,
        })
    }

    #[test]
    fn test_unknown_reader_id_fans_out() {
        let receiver = MessageReceiver::new([9; 12]);
        let a = Recorder::new(READER_A);
        let b = Recorder::new(READER_B);
        receiver.register_reader(a.clone());
        receiver.register_reader(b.clone());

        let msg = RtpsMessage::new([1; 12]).with(heartbeat(ENTITYID_UNKNOWN, 1));
        assert_eq!(receiver.on_message(&msg), 2);

        let msg = RtpsMessage::new([1; 12]).with(heartbeat(READER_B, 1));
        assert_eq!(receiver.on_message(&msg), 1);
        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 2);
    }

    #[test]
    fn test_acknack_routed_to_writer() {
        let receiver = MessageReceiver::new([9; 12]);
        let writer = Recorder::new(WRITER);
        receiver.register_writer(writer.clone());
        let ack = Submessage::AckNack(AckNackMsg {
            reader_id: READER_A,
            writer_id: WRITER,
            reader_sn_state: SequenceBitmapRange::new(1),
            count: 1,
            final_flag: true,
        });
        assert_eq!(receiver.on_message(&RtpsMessage::new([1; 12]).with(ack)), 1);
        assert_eq!(*writer.seen.lock(), vec!["ACKNACK"]);
    }

    #[test]
    fn test_info_dst_filter() {
        let receiver = MessageReceiver::new([9; 12]);
        let a = Recorder::new(READER_A);
        receiver.register_reader(a.clone());
        let msg = RtpsMessage::to([1; 12], [4; 12]).with(heartbeat(READER_A, 1));
        assert_eq!(receiver.on_message(&msg), 0);
        let msg = RtpsMessage::to([1; 12], [9; 12]).with(heartbeat(READER_A, 1));
        assert_eq!(receiver.on_message(&msg), 1);
    }

    #[test]
    fn test_invalid_submessage_dropped() {
        let receiver = MessageReceiver::new([9; 12]);
        let a = Recorder::new(READER_A);
        receiver.register_reader(a.clone());
        let msg = RtpsMessage::new([1; 12])
            .with(heartbeat(READER_A, 0))
            .with(heartbeat(READER_A, 1));
        assert_eq!(receiver.on_message(&msg), 1);
        assert_eq!(receiver.dropped_count(), 1);
    }
}
