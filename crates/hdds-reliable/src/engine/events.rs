// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Application notifications.
//!
//! Engines never call user code. Status changes are pushed into a bounded
//! crossbeam channel; the application drains it whenever it likes. When the
//! channel is full the event is dropped (logged at trace). Lost samples are
//! also counted in a [`SampleLostStatus`], which never drops anything.

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::core::guid::GUID;
use crate::reliability::change::KeyHash;
use crate::reliability::history::RejectReason;

/// Events queued per endpoint before new ones are dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Writer-side status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterEvent {
    PublicationMatched { reader: GUID },
    PublicationUnmatched { reader: GUID },
    /// No sample written for `instance` within the deadline period.
    OfferedDeadlineMissed { instance: KeyHash },
}

/// Reader-side status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    /// New samples became visible to `take()` / `read()`. Emitted once until
    /// the application next takes or reads.
    DataAvailable { writer: GUID },
    /// `count` sequence numbers of `writer` will never be delivered.
    SampleLost { writer: GUID, count: u64 },
    /// Sample dropped for lack of room; it will be requested again.
    SampleRejected {
        writer: GUID,
        seq: u64,
        reason: RejectReason,
    },
    RequestedDeadlineMissed { instance: KeyHash },
    LivelinessChanged { writer: GUID, alive: bool },
    SubscriptionMatched { writer: GUID },
    SubscriptionUnmatched { writer: GUID },
}

/// Cumulative lost-sample counters of a reader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleLostStatus {
    /// Sequence numbers lost since the reader was created.
    pub total_count: u64,
    /// Lost since the status was last read.
    pub total_count_change: u64,
}

impl SampleLostStatus {
    pub fn record(&mut self, count: u64) {
        self.total_count = self.total_count.saturating_add(count);
        self.total_count_change = self.total_count_change.saturating_add(count);
    }

    /// Current value; resets `total_count_change`.
    pub fn read_and_reset(&mut self) -> Self {
        let current = *self;
        self.total_count_change = 0;
        current
    }
}

/// Bounded event queue owned by one engine.
#[derive(Debug)]
pub struct EventChannel<E> {
    tx: Sender<E>,
    rx: Receiver<E>,
}

impl<E: std::fmt::Debug> EventChannel<E> {
    pub fn new() -> Self {
        let (tx, rx) = channel::bounded(EVENT_CHANNEL_CAPACITY);
        Self { tx, rx }
    }

    /// Queue an event without blocking.
    pub fn emit(&self, event: E) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::trace!("[events] channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// A receiving end; every clone competes for the same events.
    pub fn receiver(&self) -> Receiver<E> {
        self.rx.clone()
    }
}

impl<E: std::fmt::Debug> Default for EventChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}
