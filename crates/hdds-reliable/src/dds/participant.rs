// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Participant
//!
//! Owns one GUID prefix, the [`MessageReceiver`] its endpoints are reached
//! through, and the outbound [`Transport`]. Creates typed writers and
//! readers and wires their engines to the receiver and, when enabled, to
//! the shared `hdds-timer` thread.
//!
//! ```text
//!  IntraProcessNetwork ──> MessageReceiver ──> engines (by entity id)
//!        ^                                         │
//!        └────────────── IntraTransport <──────────┘
//! ```
//!
//! Matching is explicit: hand the attributes from
//! [`Participant::remote_reader`] / [`Participant::remote_writer`] to the
//! other side.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::reader::ReaderEngine;
use super::writer::WriterEngine;
use super::{DataReader, DataWriter, Result, DDS};
use crate::config::{ReaderAttributes, WriterAttributes};
use crate::core::guid::{GuidPrefix, GUID};
use crate::core::registry::{EntityKind, EntityRegistry};
use crate::engine::{
    ReliabilityEngine, StatefulReader, StatefulWriter, StatelessReader, StatelessWriter,
    TimedEventService,
};
use crate::qos::{ReaderQos, Reliability, WriterQos};
use crate::reliability::reader_proxy::RemoteReaderAttributes;
use crate::reliability::writer_proxy::RemoteWriterAttributes;
use crate::transport::{IntraProcessNetwork, Locator, MessageReceiver, Transport};

/// Entry point for creating endpoints.
pub struct Participant {
    prefix: GuidPrefix,
    registry: Arc<EntityRegistry>,
    transport: Arc<dyn Transport>,
    receiver: Arc<MessageReceiver>,
    locator: Locator,
    network: Option<IntraProcessNetwork>,
    timer: Option<TimedEventService>,
    engines: Mutex<Vec<Arc<dyn ReliabilityEngine>>>,
}

impl Participant {
    /// Participant attached to an in-process network.
    pub fn new_intra(registry: Arc<EntityRegistry>, network: &IntraProcessNetwork) -> Self {
        let prefix = registry.allocate_prefix();
        let receiver = Arc::new(MessageReceiver::new(prefix));
        let locator = network.attach(Arc::clone(&receiver));
        let transport: Arc<dyn Transport> = network.transport();
        log::debug!("[participant] {:02x?} on {}", prefix, locator);
        Self {
            prefix,
            registry,
            transport,
            receiver,
            locator,
            network: Some(network.clone()),
            timer: None,
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Participant over a caller-provided transport. Incoming messages must
    /// be fed to [`Participant::receiver`]; `locator` is what remote
    /// endpoints are told to send to.
    pub fn with_transport(
        registry: Arc<EntityRegistry>,
        transport: Arc<dyn Transport>,
        locator: Locator,
    ) -> Self {
        let prefix = registry.allocate_prefix();
        log::debug!("[participant] {:02x?} on {}", prefix, locator);
        Self {
            prefix,
            registry,
            transport,
            receiver: Arc::new(MessageReceiver::new(prefix)),
            locator,
            network: None,
            timer: None,
            engines: Mutex::new(Vec::new()),
        }
    }

    /// Drive every endpoint's timers from a dedicated `hdds-timer` thread
    /// instead of [`Participant::process_timers`].
    pub fn with_timer(mut self) -> Result<Self> {
        if self.timer.is_none() {
            let timer = TimedEventService::start()?;
            for engine in self.engines.lock().iter() {
                timer.register(engine);
            }
            self.timer = Some(timer);
        }
        Ok(self)
    }

    #[must_use]
    pub fn guid_prefix(&self) -> GuidPrefix {
        self.prefix
    }

    #[must_use]
    pub fn guid(&self) -> GUID {
        GUID::new(self.prefix, [0, 0, 1, 0xc1])
    }

    #[must_use]
    pub fn locator(&self) -> Locator {
        self.locator
    }

    #[must_use]
    pub fn receiver(&self) -> Arc<MessageReceiver> {
        Arc::clone(&self.receiver)
    }

    // ========================================================================
    // Endpoints
    // ========================================================================

    pub fn create_writer<T: DDS>(&self, qos: WriterQos) -> Result<DataWriter<T>> {
        self.create_writer_with(qos, WriterAttributes::default())
    }

    pub fn create_writer_with<T: DDS>(
        &self,
        qos: WriterQos,
        attrs: WriterAttributes,
    ) -> Result<DataWriter<T>> {
        let entity_id = self
            .registry
            .next_entity_id(&self.prefix, EntityKind::WriterWithKey);
        let guid = GUID::new(self.prefix, entity_id);
        let transport = Arc::clone(&self.transport);
        let engine = match qos.reliability {
            Reliability::Reliable => {
                WriterEngine::Reliable(Arc::new(StatefulWriter::new(guid, qos, attrs, transport)?))
            }
            Reliability::BestEffort => WriterEngine::BestEffort(Arc::new(StatelessWriter::new(
                guid, qos, attrs, transport,
            )?)),
        };
        let writer = DataWriter::new(engine);
        let engine = writer.engine();
        self.receiver.register_writer(Arc::clone(&engine));
        self.track(engine);
        Ok(writer)
    }

    pub fn create_reader<T: DDS>(&self, qos: ReaderQos) -> Result<DataReader<T>> {
        self.create_reader_with(qos, ReaderAttributes::default())
    }

    pub fn create_reader_with<T: DDS>(
        &self,
        qos: ReaderQos,
        attrs: ReaderAttributes,
    ) -> Result<DataReader<T>> {
        let entity_id = self
            .registry
            .next_entity_id(&self.prefix, EntityKind::ReaderWithKey);
        let guid = GUID::new(self.prefix, entity_id);
        let engine = match qos.reliability {
            Reliability::Reliable => ReaderEngine::Reliable(Arc::new(StatefulReader::new(
                guid,
                qos,
                attrs,
                Arc::clone(&self.transport),
            )?)),
            Reliability::BestEffort => {
                ReaderEngine::BestEffort(Arc::new(StatelessReader::new(guid, qos, attrs)?))
            }
        };
        let reader = DataReader::new(engine);
        let engine = reader.engine();
        self.receiver.register_reader(Arc::clone(&engine));
        self.track(engine);
        Ok(reader)
    }

    /// Detach a writer from this participant; it no longer receives
    /// ACKNACKs or timer ticks.
    pub fn delete_writer<T: DDS>(&self, writer: &DataWriter<T>) {
        let guid = writer.guid();
        self.receiver.unregister_writer(&guid.entity_id);
        self.untrack(guid);
    }

    pub fn delete_reader<T: DDS>(&self, reader: &DataReader<T>) {
        let guid = reader.guid();
        self.receiver.unregister_reader(&guid.entity_id);
        self.untrack(guid);
    }

    fn track(&self, engine: Arc<dyn ReliabilityEngine>) {
        if let Some(timer) = &self.timer {
            timer.register(&engine);
        }
        log::debug!("[participant] registered endpoint {}", engine.guid());
        self.engines.lock().push(engine);
    }

    fn untrack(&self, guid: GUID) {
        self.engines.lock().retain(|e| e.guid() != guid);
        log::debug!("[participant] removed endpoint {}", guid);
    }

    // ========================================================================
    // Matching
    // ========================================================================

    /// What a remote writer needs to know about `reader`.
    pub fn remote_reader<T: DDS>(&self, reader: &DataReader<T>) -> RemoteReaderAttributes {
        let qos = reader.qos();
        let mut attrs = RemoteReaderAttributes::new(reader.guid(), self.locator);
        attrs.reliability = qos.reliability;
        attrs.durability = qos.durability;
        attrs
    }

    /// What a remote reader needs to know about `writer`.
    pub fn remote_writer<T: DDS>(&self, writer: &DataWriter<T>) -> RemoteWriterAttributes {
        let qos = writer.qos();
        let mut attrs = RemoteWriterAttributes::new(writer.guid(), self.locator);
        attrs.reliability = qos.reliability;
        attrs.durability = qos.durability;
        attrs
    }

    /// Run due timers of every endpoint (when no timer thread is used).
    pub fn process_timers(&self, now: Instant) {
        let engines: Vec<Arc<dyn ReliabilityEngine>> = self.engines.lock().clone();
        for engine in engines {
            if engine.next_deadline().is_some_and(|at| at <= now) {
                engine.process_timers(now);
            }
        }
    }

    /// Earliest pending timer over every endpoint.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.engines
            .lock()
            .iter()
            .filter_map(|e| e.next_deadline())
            .min()
    }
}

impl Drop for Participant {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.stop();
        }
        if let Some(network) = &self.network {
            network.detach(&self.locator);
        }
        self.registry.release_participant(&self.prefix);
        log::debug!("[participant] {:02x?} dropped", self.prefix);
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("prefix", &self.prefix)
            .field("locator", &self.locator)
            .field("endpoints", &self.engines.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dds::Error;
    use crate::engine::{ReaderEvent, WriterEvent};
    use std::time::Duration;

    fn pair() -> (IntraProcessNetwork, Participant, Participant) {
        let registry = Arc::new(EntityRegistry::with_app_id(0x7f00_0001, 1));
        let network = IntraProcessNetwork::new();
        let a = Participant::new_intra(Arc::clone(&registry), &network);
        let b = Participant::new_intra(registry, &network);
        (network, a, b)
    }

    #[test]
    fn test_reliable_write_reaches_reader() {
        let (network, pub_part, sub_part) = pair();
        let writer = pub_part
            .create_writer::<String>(WriterQos::reliable())
            .expect("writer should be created");
        let reader = sub_part
            .create_reader::<String>(ReaderQos::reliable())
            .expect("reader should be created");
        writer
            .matched_reader_add(sub_part.remote_reader(&reader))
            .expect("match should succeed");
        reader
            .matched_writer_add(pub_part.remote_writer(&writer))
            .expect("match should succeed");

        writer.write(&"hello".to_string()).expect("write should succeed");
        network.pump();
        let samples = reader.take().expect("take should succeed");
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].data.as_deref(), Some("hello"));
        assert_eq!(samples[0].info.writer_guid, writer.guid());
    }

    #[test]
    fn test_best_effort_pair() {
        let (network, pub_part, sub_part) = pair();
        let writer = pub_part
            .create_writer::<Vec<u8>>(WriterQos::best_effort())
            .expect("writer should be created");
        let reader = sub_part
            .create_reader::<Vec<u8>>(ReaderQos::best_effort())
            .expect("reader should be created");
        writer
            .matched_reader_add(sub_part.remote_reader(&reader))
            .expect("match should succeed");
        reader
            .matched_writer_add(pub_part.remote_writer(&writer))
            .expect("match should succeed");
        writer.write(&vec![1, 2, 3]).expect("write should succeed");
        network.pump();
        assert_eq!(
            reader.take().expect("take should succeed")[0].data,
            Some(vec![1, 2, 3])
        );
        assert!(writer.wait_for_all_acked(Duration::ZERO));
    }

    #[test]
    fn test_dispose_delivers_invalid_data() {
        let (network, pub_part, sub_part) = pair();
        let writer = pub_part
            .create_writer::<String>(WriterQos::reliable())
            .expect("writer should be created");
        let reader = sub_part
            .create_reader::<String>(ReaderQos::reliable())
            .expect("reader should be created");
        writer
            .matched_reader_add(sub_part.remote_reader(&reader))
            .expect("match should succeed");
        reader
            .matched_writer_add(pub_part.remote_writer(&writer))
            .expect("match should succeed");
        writer.dispose(&"x".to_string()).expect("dispose should succeed");
        network.pump();
        let samples = reader.take().expect("take should succeed");
        assert_eq!(samples.len(), 1);
        assert!(samples[0].data.is_none());
        assert!(!samples[0].info.valid_data);
    }

    #[test]
    fn test_entity_ids_unique_within_participant() {
        let (_network, part, _other) = pair();
        let w = part
            .create_writer::<String>(WriterQos::reliable())
            .expect("writer should be created");
        let r = part
            .create_reader::<String>(ReaderQos::reliable())
            .expect("reader should be created");
        assert_ne!(w.guid().entity_id, r.guid().entity_id);
        assert!(w.guid().is_writer());
        assert!(r.guid().is_reader());
        assert_eq!(part.receiver().endpoint_count(), 2);
    }

    #[test]
    fn test_invalid_qos_rejected() {
        let (_network, part, _other) = pair();
        let result = part.create_writer::<String>(WriterQos::reliable().keep_last(0));
        assert!(matches!(result, Err(Error::InvalidQos(_))));
    }

    #[test]
    fn test_match_events() {
        let (_network, pub_part, sub_part) = pair();
        let writer = pub_part
            .create_writer::<String>(WriterQos::reliable())
            .expect("writer should be created");
        let reader = sub_part
            .create_reader::<String>(ReaderQos::reliable())
            .expect("reader should be created");
        writer
            .matched_reader_add(sub_part.remote_reader(&reader))
            .expect("match should succeed");
        reader
            .matched_writer_add(pub_part.remote_writer(&writer))
            .expect("match should succeed");
        assert_eq!(
            writer.events().try_recv().ok(),
            Some(WriterEvent::PublicationMatched {
                reader: reader.guid()
            })
        );
        assert_eq!(
            reader.events().try_recv().ok(),
            Some(ReaderEvent::SubscriptionMatched {
                writer: writer.guid()
            })
        );
    }

    #[test]
    fn test_timer_thread_repairs_loss() {
        let registry = Arc::new(EntityRegistry::with_app_id(0x7f00_0001, 2));
        let network = IntraProcessNetwork::new();
        let pub_part = Participant::new_intra(Arc::clone(&registry), &network)
            .with_timer()
            .expect("timer should start");
        let sub_part = Participant::new_intra(registry, &network)
            .with_timer()
            .expect("timer should start");
        network.spawn_dispatcher().expect("dispatcher should start");

        let writer = pub_part
            .create_writer::<String>(WriterQos::reliable())
            .expect("writer should be created");
        let reader = sub_part
            .create_reader::<String>(ReaderQos::reliable())
            .expect("reader should be created");
        writer
            .matched_reader_add(sub_part.remote_reader(&reader))
            .expect("match should succeed");
        reader
            .matched_writer_add(pub_part.remote_writer(&writer))
            .expect("match should succeed");

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&dropped);
        network.set_drop_filter(move |_, sub| {
            matches!(sub, crate::reliability::Submessage::Data(d) if d.seq == 1)
                && !flag.swap(true, std::sync::atomic::Ordering::SeqCst)
        });
        writer.write(&"one".to_string()).expect("write should succeed");
        writer.write(&"two".to_string()).expect("write should succeed");

        assert!(writer.wait_for_all_acked(Duration::from_secs(5)));
        let mut got = Vec::new();
        while got.len() < 2 && reader.wait_for_data(Duration::from_secs(1)) {
            got.extend(reader.take().expect("take should succeed"));
        }
        network.stop_dispatcher();
        let values: Vec<String> = got.into_iter().filter_map(|s| s.data).collect();
        assert_eq!(values, vec!["one".to_string(), "two".to_string()]);
    }
}
