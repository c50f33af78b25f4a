// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # RTPS Reliable QoS building blocks
//!
//! Data structures the engines in [`crate::engine`] are made of.
//!
//! ## Protocol Flow
//!
//! ```text
//! Writer                                    Reader
//!   |                                          |
//!   |--- DATA (seq=1) ------------------------>|
//!   |--- DATA (seq=2) ----------X (lost)       |
//!   |--- DATA (seq=3) ------------------------>| (buffered, not visible)
//!   |                                          |
//!   |--- HEARTBEAT (first=1, last=3) --------->|
//!   |                                          | (seq=2 missing)
//!   |<-- ACKNACK (base=2, bitmap={2}) ---------|
//!   |                                          |
//!   |--- DATA (seq=2) [retransmit] ----------->| (2, 3 become visible)
//!   |<-- ACKNACK (base=4, final) --------------|
//! ```
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | `BitmapRange` | 256-bit sequence / fragment number sets |
//! | `SampleArena` | Slab of samples addressed by generation-checked handles |
//! | `SampleHistory` | Bounded history with KEEP_LAST / KEEP_ALL admission |
//! | `ReaderProxy` | Writer-side per-reader ack / retransmission state |
//! | `WriterProxy` | Reader-side per-writer reception / gap state |
//! | `FragmentAssembler` | DATA_FRAG reassembly |
//! | `ReliableMetrics` | Counters (heartbeats, ACKNACKs, retransmits, GAPs) |
//!
//! ## See Also
//!
//! - [RTPS v2.5 Sec.8.4](https://www.omg.org/spec/DDSI-RTPS/2.5/) - Reliability Protocol

// Core types
pub mod arena;
pub mod bitmap;
pub mod change;
pub mod seq;

// Storage
pub mod history;

// Protocol messages
pub mod fragment;
pub mod gap;
pub mod messages;

// Per-peer state
pub mod reader_proxy;
pub mod writer_proxy;

pub mod metrics;

// ============================================================================
// Public re-exports
// ============================================================================

pub use arena::{SampleArena, SampleHandle};
pub use bitmap::{BitmapRange, FragmentNumberSet, SequenceBitmapRange, BITMAP_MAX_BITS};
pub use change::{CacheChange, ChangeKind, KeyHash, SampleIdentity, SampleInfo, SampleKey};
pub use history::{admission_decision, AddOutcome, Admission, Occupancy, RejectReason, SampleHistory};
pub use messages::{AckNackMsg, DataFragMsg, DataMsg, GapMsg, HeartbeatMsg, NackFragMsg, Submessage};
pub use metrics::{MetricsSnapshot, ReliableMetrics};
pub use reader_proxy::{ChangeStatus, ReaderProxy, ReaderProxySnapshot, RemoteReaderAttributes};
pub use seq::SeqNumGenerator;
pub use writer_proxy::{RemoteWriterAttributes, WriterProxy, WriterProxySnapshot};
