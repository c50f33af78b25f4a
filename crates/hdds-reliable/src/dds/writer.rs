// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DataWriter
//!
//! Typed front of a writer engine. `WriterQos::reliable()` selects the
//! [`StatefulWriter`] (HEARTBEAT, retransmission, GAP); best-effort QoS
//! selects the [`StatelessWriter`].
//!
//! ```text
//! write(&T) -> T::serialize() -> engine.write_change() -> DATA / DATA_FRAG
//! ```

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;

use super::{Result, DDS};
use crate::config::WriterTimes;
use crate::core::guid::GUID;
use crate::engine::{ReliabilityEngine, StatefulWriter, StatelessWriter, WriterEvent};
use crate::qos::WriterQos;
use crate::reliability::reader_proxy::RemoteReaderAttributes;
use crate::reliability::{ChangeKind, KeyHash, ReliableMetrics, SampleIdentity};

#[derive(Clone)]
pub(crate) enum WriterEngine {
    Reliable(Arc<StatefulWriter>),
    BestEffort(Arc<StatelessWriter>),
}

/// Typed writer handle. Clones share the same engine.
pub struct DataWriter<T: DDS> {
    engine: WriterEngine,
    _type: PhantomData<T>,
}

impl<T: DDS> Clone for DataWriter<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: DDS> DataWriter<T> {
    pub(crate) fn new(engine: WriterEngine) -> Self {
        Self {
            engine,
            _type: PhantomData,
        }
    }

    pub(crate) fn engine(&self) -> Arc<dyn ReliabilityEngine> {
        match &self.engine {
            WriterEngine::Reliable(w) => Arc::clone(w) as Arc<dyn ReliabilityEngine>,
            WriterEngine::BestEffort(w) => Arc::clone(w) as Arc<dyn ReliabilityEngine>,
        }
    }

    /// Publish a sample. Returns its sequence number.
    ///
    /// # Errors
    ///
    /// - [`super::Error::Serialization`] if `T` cannot be encoded
    /// - [`super::Error::Rejected`] if the history has no room
    /// - [`super::Error::Timeout`] if a blocking write waited too long
    pub fn write(&self, sample: &T) -> Result<u64> {
        self.write_kind(ChangeKind::Alive, sample, None)
    }

    /// Publish a sample that answers `related` (request/reply correlation).
    pub fn write_related(&self, sample: &T, related: SampleIdentity) -> Result<u64> {
        self.write_kind(ChangeKind::Alive, sample, Some(related))
    }

    /// Announce that the instance of `sample` was disposed.
    pub fn dispose(&self, sample: &T) -> Result<u64> {
        self.write_key_only(ChangeKind::Disposed, sample.instance_key())
    }

    /// Announce that this writer no longer updates the instance of `sample`.
    pub fn unregister(&self, sample: &T) -> Result<u64> {
        self.write_key_only(ChangeKind::Unregistered, sample.instance_key())
    }

    fn write_kind(&self, kind: ChangeKind, sample: &T, related: Option<SampleIdentity>) -> Result<u64> {
        let payload: Arc<[u8]> = sample.serialize()?.into();
        let key = sample.instance_key();
        match &self.engine {
            WriterEngine::Reliable(w) => w.write_change(kind, key, payload, related),
            WriterEngine::BestEffort(w) => w.write_change(kind, key, payload, related),
        }
    }

    fn write_key_only(&self, kind: ChangeKind, key: KeyHash) -> Result<u64> {
        let payload: Arc<[u8]> = Arc::from(Vec::new());
        match &self.engine {
            WriterEngine::Reliable(w) => w.write_change(kind, key, payload, None),
            WriterEngine::BestEffort(w) => w.write_change(kind, key, payload, None),
        }
    }

    /// Block until every reliable reader acknowledged every sample.
    /// Best-effort writers return `true` immediately.
    pub fn wait_for_all_acked(&self, timeout: Duration) -> bool {
        match &self.engine {
            WriterEngine::Reliable(w) => w.wait_for_all_acked(timeout),
            WriterEngine::BestEffort(_) => true,
        }
    }

    #[must_use]
    pub fn get_unacked_count(&self) -> usize {
        match &self.engine {
            WriterEngine::Reliable(w) => w.get_unacked_count(),
            WriterEngine::BestEffort(_) => 0,
        }
    }

    pub fn matched_reader_add(&self, reader: RemoteReaderAttributes) -> Result<()> {
        match &self.engine {
            WriterEngine::Reliable(w) => w.matched_reader_add(reader),
            WriterEngine::BestEffort(w) => w.matched_reader_add(reader),
        }
    }

    pub fn matched_reader_remove(&self, reader: GUID) -> Result<()> {
        match &self.engine {
            WriterEngine::Reliable(w) => w.matched_reader_remove(reader),
            WriterEngine::BestEffort(w) => w.matched_reader_remove(reader),
        }
    }

    #[must_use]
    pub fn matched_readers(&self) -> Vec<GUID> {
        match &self.engine {
            WriterEngine::Reliable(w) => w.matched_readers(),
            WriterEngine::BestEffort(w) => w.matched_readers(),
        }
    }

    pub fn assert_liveliness(&self) {
        match &self.engine {
            WriterEngine::Reliable(w) => w.assert_liveliness(),
            WriterEngine::BestEffort(w) => w.assert_liveliness(),
        }
    }

    /// Status events (matches, missed deadlines).
    pub fn events(&self) -> Receiver<WriterEvent> {
        match &self.engine {
            WriterEngine::Reliable(w) => w.events(),
            WriterEngine::BestEffort(w) => w.events(),
        }
    }

    /// Change protocol timing at runtime. No effect on best-effort writers.
    pub fn update_times(&self, times: WriterTimes) {
        if let WriterEngine::Reliable(w) = &self.engine {
            w.update_times(times);
        }
    }

    #[must_use]
    pub fn guid(&self) -> GUID {
        match &self.engine {
            WriterEngine::Reliable(w) => w.guid(),
            WriterEngine::BestEffort(w) => w.guid(),
        }
    }

    #[must_use]
    pub fn qos(&self) -> WriterQos {
        match &self.engine {
            WriterEngine::Reliable(w) => *w.qos(),
            WriterEngine::BestEffort(w) => *w.qos(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        match &self.engine {
            WriterEngine::Reliable(w) => w.metrics(),
            WriterEngine::BestEffort(w) => w.metrics(),
        }
    }

    #[must_use]
    pub fn last_sequence_number(&self) -> u64 {
        match &self.engine {
            WriterEngine::Reliable(w) => w.last_sequence_number(),
            WriterEngine::BestEffort(w) => w.last_sequence_number(),
        }
    }
}

impl<T: DDS> std::fmt::Debug for DataWriter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataWriter")
            .field("guid", &self.guid())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
