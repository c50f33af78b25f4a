// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliability engines.
//!
//! | Engine | Role |
//! |--------|------|
//! | [`StatefulWriter`] | Reliable writer: per-reader proxies, HEARTBEAT, retransmission, GAP |
//! | [`StatefulReader`] | Reliable reader: per-writer proxies, resequencing, ACKNACK / NACK_FRAG |
//! | [`StatelessWriter`] | Best-effort writer: send once, no acknowledgement |
//! | [`StatelessReader`] | Best-effort reader: accept anything newer |
//!
//! Engines are passive: protocol input arrives through
//! [`ReliabilityEngine::on_submessage`], time through
//! [`ReliabilityEngine::process_timers`]. The [`TimedEventService`] thread
//! (or a test) decides when to call the latter, guided by
//! [`ReliabilityEngine::next_deadline`].

mod events;
mod stateful_reader;
mod stateful_writer;
mod stateless_reader;
mod stateless_writer;
#[cfg(test)]
pub(crate) mod testing;
mod timer;

use std::sync::Arc;
use std::time::Instant;

pub use events::{
    EventChannel, ReaderEvent, SampleLostStatus, WriterEvent, EVENT_CHANNEL_CAPACITY,
};
pub use stateful_reader::StatefulReader;
pub use stateful_writer::StatefulWriter;
pub use stateless_reader::StatelessReader;
pub use stateless_writer::StatelessWriter;
pub use timer::{TimedEventService, TimerHandle};

use crate::core::guid::{EntityId, GuidPrefix, GUID};
use crate::reliability::fragment::split_change;
use crate::reliability::messages::{DataMsg, Submessage};
use crate::reliability::{CacheChange, FragmentNumberSet};

/// Common face of every writer and reader engine.
pub trait ReliabilityEngine: Send + Sync {
    fn guid(&self) -> GUID;

    /// Handle one validated submessage sent by participant `source_prefix`.
    fn on_submessage(&self, source_prefix: GuidPrefix, submessage: &Submessage);

    /// Run every timed action due at or before `now`.
    fn process_timers(&self, now: Instant);

    /// Earliest instant at which `process_timers` has work to do.
    fn next_deadline(&self) -> Option<Instant>;

    /// Timer to wake when a new deadline gets armed.
    fn attach_timer(&self, handle: TimerHandle);
}

/// Earlier of two optional instants.
pub(crate) fn earliest(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// DATA for `change`, or DATA_FRAG when the payload exceeds `fragment_size`
/// (restricted to `fragments` when given).
pub(crate) fn data_submessages(
    change: &CacheChange,
    reader_id: EntityId,
    writer_id: EntityId,
    fragment_size: usize,
    fragments: Option<&FragmentNumberSet>,
) -> Vec<Submessage> {
    if change.payload_len() > fragment_size {
        return split_change(change, reader_id, writer_id, fragment_size, fragments)
            .into_iter()
            .map(Submessage::DataFrag)
            .collect();
    }
    vec![Submessage::Data(DataMsg {
        reader_id,
        writer_id,
        seq: change.sequence_number,
        kind: change.kind,
        instance_key: change.instance_key,
        source_timestamp: change.source_timestamp,
        related_sample_id: change.related_sample_id,
        payload: Arc::clone(&change.payload),
    })]
}
