// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # hdds-reliable
//!
//! RTPS reliable-delivery engine for HDDS: per-endpoint sample history,
//! writer-side `ReaderProxy` and reader-side `WriterProxy` state, and the
//! stateful writer/reader state machines driving HEARTBEAT, ACKNACK,
//! NACK_FRAG and GAP exchanges over lossy, unordered transports.
//!
//! ## Layers
//!
//! | Module | Role |
//! |--------|------|
//! | [`reliability`] | Bitmaps, sample arena, history, proxies, submessages |
//! | [`engine`] | Stateful/stateless writers and readers, timer service |
//! | [`transport`] | `Transport` seam, intra-process network, receiver demux |
//! | [`dds`] | Typed `DataWriter` / `DataReader`, `Participant`, errors |
//! | [`qos`] / [`config`] | QoS policies and protocol timing |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use hdds_reliable::{Participant, EntityRegistry, IntraProcessNetwork, WriterQos, ReaderQos};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(EntityRegistry::new(0x0a00_0001));
//! let network = IntraProcessNetwork::new();
//! let pub_part = Participant::new_intra(registry.clone(), &network);
//! let sub_part = Participant::new_intra(registry, &network);
//!
//! let writer = pub_part.create_writer::<String>(WriterQos::reliable())?;
//! let reader = sub_part.create_reader::<String>(ReaderQos::reliable())?;
//! writer.matched_reader_add(sub_part.remote_reader(&reader))?;
//! reader.matched_writer_add(pub_part.remote_writer(&writer))?;
//!
//! writer.write(&"hello".to_string())?;
//! network.pump();
//! ```

pub mod config;
pub mod core;
pub mod dds;
pub mod engine;
pub mod qos;
pub mod reliability;
pub mod transport;

pub use crate::config::{ReaderAttributes, ReaderTimes, WriterAttributes, WriterTimes};
pub use crate::core::guid::{EntityId, GuidPrefix, GUID};
pub use crate::core::registry::{EntityKind, EntityRegistry};
pub use crate::dds::{DataReader, DataWriter, Error, Participant, Result, Sample, DDS};
pub use crate::engine::{
    ReaderEvent, ReliabilityEngine, SampleLostStatus, StatefulReader, StatefulWriter,
    StatelessReader, StatelessWriter, TimedEventService, WriterEvent,
};
pub use crate::qos::{
    Durability, History, MemoryPolicy, ReaderQos, Reliability, ResourceLimits, WriterQos,
    LENGTH_UNLIMITED,
};
pub use crate::reliability::{
    CacheChange, ChangeKind, KeyHash, RejectReason, SampleHistory, SampleInfo,
    SequenceBitmapRange,
};
pub use crate::transport::{IntraProcessNetwork, Locator, MessageReceiver, RtpsMessage, Transport};
