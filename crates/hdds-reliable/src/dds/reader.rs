// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # DataReader
//!
//! Typed front of a reader engine. Reliable QoS selects the
//! [`StatefulReader`], which only hands out samples once every earlier
//! sequence number of their writer is accounted for.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Receiver;

use super::{Result, DDS};
use crate::config::ReaderTimes;
use crate::core::guid::GUID;
use crate::engine::{
    ReaderEvent, ReliabilityEngine, SampleLostStatus, StatefulReader, StatelessReader,
};
use crate::qos::ReaderQos;
use crate::reliability::writer_proxy::RemoteWriterAttributes;
use crate::reliability::{ReliableMetrics, SampleInfo};

/// A received sample. `data` is `None` for dispose/unregister notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample<T> {
    pub data: Option<T>,
    pub info: SampleInfo,
}

#[derive(Clone)]
pub(crate) enum ReaderEngine {
    Reliable(Arc<StatefulReader>),
    BestEffort(Arc<StatelessReader>),
}

/// Typed reader handle. Clones share the same engine.
pub struct DataReader<T: DDS> {
    engine: ReaderEngine,
    _type: PhantomData<T>,
}

impl<T: DDS> Clone for DataReader<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            _type: PhantomData,
        }
    }
}

impl<T: DDS> DataReader<T> {
    pub(crate) fn new(engine: ReaderEngine) -> Self {
        Self {
            engine,
            _type: PhantomData,
        }
    }

    pub(crate) fn engine(&self) -> Arc<dyn ReliabilityEngine> {
        match &self.engine {
            ReaderEngine::Reliable(r) => Arc::clone(r) as Arc<dyn ReliabilityEngine>,
            ReaderEngine::BestEffort(r) => Arc::clone(r) as Arc<dyn ReliabilityEngine>,
        }
    }

    /// Remove and return every available sample.
    pub fn take(&self) -> Result<Vec<Sample<T>>> {
        self.take_max(usize::MAX)
    }

    /// Remove and return up to `max` available samples.
    ///
    /// # Errors
    ///
    /// [`super::Error::Serialization`] if a payload does not decode as `T`.
    /// The offending sample is consumed.
    pub fn take_max(&self, max: usize) -> Result<Vec<Sample<T>>> {
        let raw = match &self.engine {
            ReaderEngine::Reliable(r) => r.take(max),
            ReaderEngine::BestEffort(r) => r.take(max),
        };
        decode(raw)
    }

    /// Return up to `max` available samples, leaving them in place.
    pub fn read(&self, max: usize) -> Result<Vec<Sample<T>>> {
        let raw = match &self.engine {
            ReaderEngine::Reliable(r) => r.read(max),
            ReaderEngine::BestEffort(r) => r.read(max),
        };
        decode(raw)
    }

    /// Number of samples ready to be taken.
    #[must_use]
    pub fn available(&self) -> usize {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.available(),
            ReaderEngine::BestEffort(r) => r.available(),
        }
    }

    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.wait_for_data(timeout),
            ReaderEngine::BestEffort(r) => r.wait_for_data(timeout),
        }
    }

    pub fn matched_writer_add(&self, writer: RemoteWriterAttributes) -> Result<()> {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.matched_writer_add(writer),
            ReaderEngine::BestEffort(r) => r.matched_writer_add(writer),
        }
    }

    pub fn matched_writer_remove(&self, writer: GUID) -> Result<()> {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.matched_writer_remove(writer),
            ReaderEngine::BestEffort(r) => r.matched_writer_remove(writer),
        }
    }

    #[must_use]
    pub fn matched_writers(&self) -> Vec<GUID> {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.matched_writers(),
            ReaderEngine::BestEffort(r) => r.matched_writers(),
        }
    }

    /// Status events (data available, lost/rejected samples, liveliness).
    pub fn events(&self) -> Receiver<ReaderEvent> {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.events(),
            ReaderEngine::BestEffort(r) => r.events(),
        }
    }

    /// Lost-sample counters, independent of the event channel. Reading
    /// resets `total_count_change`.
    pub fn sample_lost_status(&self) -> SampleLostStatus {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.sample_lost_status(),
            ReaderEngine::BestEffort(r) => r.sample_lost_status(),
        }
    }

    /// Change protocol timing at runtime. No effect on best-effort readers.
    pub fn update_times(&self, times: ReaderTimes) {
        if let ReaderEngine::Reliable(r) = &self.engine {
            r.update_times(times);
        }
    }

    #[must_use]
    pub fn guid(&self) -> GUID {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.guid(),
            ReaderEngine::BestEffort(r) => r.guid(),
        }
    }

    #[must_use]
    pub fn qos(&self) -> ReaderQos {
        match &self.engine {
            ReaderEngine::Reliable(r) => *r.qos(),
            ReaderEngine::BestEffort(r) => *r.qos(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ReliableMetrics> {
        match &self.engine {
            ReaderEngine::Reliable(r) => r.metrics(),
            ReaderEngine::BestEffort(r) => r.metrics(),
        }
    }
}

fn decode<T: DDS>(raw: Vec<(SampleInfo, Arc<[u8]>)>) -> Result<Vec<Sample<T>>> {
    raw.into_iter()
        .map(|(info, payload)| {
            let data = if info.valid_data {
                Some(T::deserialize(&payload)?)
            } else {
                None
            };
            Ok(Sample { data, info })
        })
        .collect()
}

impl<T: DDS> std::fmt::Debug for DataReader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataReader")
            .field("guid", &self.guid())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
