// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process network.
//!
//! Every participant attaches its [`MessageReceiver`] and gets an intra
//! [`Locator`]. [`IntraTransport::send`] only enqueues; delivery happens in
//! [`IntraProcessNetwork::pump`] (deterministic, used by tests) or on the
//! `hdds-intra` dispatcher thread. Either way delivery runs on a call stack
//! that holds no engine lock.
//!
//! A [`DropFilter`] can discard individual submessages in flight, which is
//! how loss scenarios are reproduced.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

use super::{Locator, MessageReceiver, RtpsMessage, Transport};
use crate::dds::{Error, Result};
use crate::reliability::messages::Submessage;

/// Returns `true` for a submessage that must be dropped on its way to
/// `destination`.
pub type DropFilter = Box<dyn FnMut(&Locator, &Submessage) -> bool + Send>;

/// Upper bound on deliveries per `pump()` call.
const MAX_PUMP_DELIVERIES: usize = 1_000_000;
const DISPATCH_POLL: Duration = Duration::from_millis(50);

struct Envelope {
    destination: Locator,
    message: RtpsMessage,
}

/// Counters of the in-process network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub sent: u64,
    pub delivered: u64,
    pub filtered: u64,
    pub undeliverable: u64,
}

struct NetworkInner {
    endpoints: DashMap<Locator, Arc<MessageReceiver>>,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    drop_filter: Mutex<Option<DropFilter>>,
    next_port: AtomicU32,
    sent: AtomicU64,
    delivered: AtomicU64,
    filtered: AtomicU64,
    undeliverable: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl NetworkInner {
    fn enqueue(&self, destination: Locator, message: RtpsMessage) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        // rx lives in self, the channel cannot be disconnected here.
        let _ = self.tx.send(Envelope {
            destination,
            message,
        });
    }

    fn deliver(&self, envelope: Envelope) {
        let Envelope {
            destination,
            mut message,
        } = envelope;

        if let Some(filter) = self.drop_filter.lock().as_mut() {
            let before = message.submessages.len();
            message
                .submessages
                .retain(|sub| !filter(&destination, sub));
            let dropped = before - message.submessages.len();
            if dropped > 0 {
                self.filtered.fetch_add(dropped as u64, Ordering::Relaxed);
                log::trace!("[intra] filtered {} submessage(s) to {}", dropped, destination);
            }
        }
        if message.is_empty() {
            return;
        }

        let receiver = self
            .endpoints
            .get(&destination)
            .map(|entry| Arc::clone(entry.value()));
        match receiver {
            Some(receiver) => {
                receiver.on_message(&message);
                self.delivered.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                self.undeliverable.fetch_add(1, Ordering::Relaxed);
                log::trace!("[intra] no endpoint at {}", destination);
            }
        }
    }
}

/// Shared in-process network. Clones are handles to the same network.
#[derive(Clone)]
pub struct IntraProcessNetwork {
    inner: Arc<NetworkInner>,
}

impl IntraProcessNetwork {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                tx,
                rx,
                drop_filter: Mutex::new(None),
                next_port: AtomicU32::new(1),
                sent: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                filtered: AtomicU64::new(0),
                undeliverable: AtomicU64::new(0),
                dispatcher: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Attach a receiver and return the locator it answers on.
    pub fn attach(&self, receiver: Arc<MessageReceiver>) -> Locator {
        let locator = Locator::intra(self.inner.next_port.fetch_add(1, Ordering::Relaxed));
        self.inner.endpoints.insert(locator, receiver);
        log::debug!("[intra] attached endpoint {}", locator);
        locator
    }

    pub fn detach(&self, locator: &Locator) {
        if self.inner.endpoints.remove(locator).is_some() {
            log::debug!("[intra] detached endpoint {}", locator);
        }
    }

    /// Outbound handle for engines.
    pub fn transport(&self) -> Arc<IntraTransport> {
        Arc::new(IntraTransport {
            inner: Arc::downgrade(&self.inner),
        })
    }

    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&Locator, &Submessage) -> bool + Send + 'static,
    {
        *self.inner.drop_filter.lock() = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *self.inner.drop_filter.lock() = None;
    }

    /// Deliver queued messages, including those sent while delivering,
    /// until the queue is empty. Returns the number of messages handled.
    pub fn pump(&self) -> usize {
        let mut handled = 0usize;
        while let Ok(envelope) = self.inner.rx.try_recv() {
            self.inner.deliver(envelope);
            handled += 1;
            if handled >= MAX_PUMP_DELIVERIES {
                log::warn!("[intra] pump stopped after {} deliveries", handled);
                break;
            }
        }
        handled
    }

    /// Deliver messages continuously on the `hdds-intra` thread.
    pub fn spawn_dispatcher(&self) -> Result<()> {
        let mut slot = self.inner.dispatcher.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.inner.running.store(true, Ordering::Release);
        let weak: Weak<NetworkInner> = Arc::downgrade(&self.inner);
        let rx = self.inner.rx.clone();
        let handle = thread::Builder::new()
            .name("hdds-intra".to_string())
            .spawn(move || loop {
                let envelope = match rx.recv_timeout(DISPATCH_POLL) {
                    Ok(envelope) => Some(envelope),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                if let Some(envelope) = envelope {
                    inner.deliver(envelope);
                }
            })
            .map_err(|e| {
                self.inner.running.store(false, Ordering::Release);
                Error::Transport(format!("failed to spawn dispatcher: {}", e))
            })?;
        *slot = Some(handle);
        log::debug!("[intra] dispatcher started");
        Ok(())
    }

    pub fn stop_dispatcher(&self) {
        self.inner.running.store(false, Ordering::Release);
        if let Some(handle) = self.inner.dispatcher.lock().take() {
            if handle.join().is_err() {
                log::warn!("[intra] dispatcher panicked");
            }
            log::debug!("[intra] dispatcher stopped");
        }
    }

    /// Messages waiting for delivery.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    #[must_use]
    pub fn stats(&self) -> NetworkStats {
        NetworkStats {
            sent: self.inner.sent.load(Ordering::Relaxed),
            delivered: self.inner.delivered.load(Ordering::Relaxed),
            filtered: self.inner.filtered.load(Ordering::Relaxed),
            undeliverable: self.inner.undeliverable.load(Ordering::Relaxed),
        }
    }
}

impl Default for IntraProcessNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IntraProcessNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntraProcessNetwork")
            .field("endpoints", &self.inner.endpoints.len())
            .field("pending", &self.inner.rx.len())
            .finish()
    }
}

/// [`Transport`] into an [`IntraProcessNetwork`].
pub struct IntraTransport {
    inner: Weak<NetworkInner>,
}

impl Transport for IntraTransport {
    fn send(&self, locators: &[Locator], message: &RtpsMessage) -> Result<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| Error::Transport("intra network is gone".to_string()))?;
        for locator in locators {
            inner.enqueue(*locator, message.clone());
        }
        Ok(())
    }
}

impl std::fmt::Debug for IntraTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntraTransport").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::messages::HeartbeatMsg;

    fn heartbeat() -> Submessage {
        Submessage::Heartbeat(HeartbeatMsg {
            reader_id: [0, 0, 1, 0x07],
            writer_id: [0, 0, 1, 0x02],
            first_seq: 1,
            last_seq: 1,
            count: 1,
            final_flag: true,
            liveliness_flag: false,
        })
    }

    #[test]
    fn test_send_is_queued_until_pump() {
        let network = IntraProcessNetwork::new();
        let receiver = Arc::new(MessageReceiver::new([2; 12]));
        let locator = network.attach(receiver);
        let transport = network.transport();

        transport
            .send(&[locator], &RtpsMessage::new([1; 12]).with(heartbeat()))
            .expect("send should succeed");
        assert_eq!(network.pending(), 1);
        assert_eq!(network.pump(), 1);
        assert_eq!(network.pending(), 0);
        assert_eq!(network.stats().delivered, 1);
    }

    #[test]
    fn test_drop_filter_counts() {
        let network = IntraProcessNetwork::new();
        let locator = network.attach(Arc::new(MessageReceiver::new([2; 12])));
        network.set_drop_filter(|_, sub| matches!(sub, Submessage::Heartbeat(_)));
        network
            .transport()
            .send(&[locator], &RtpsMessage::new([1; 12]).with(heartbeat()))
            .expect("send should succeed");
        network.pump();
        let stats = network.stats();
        assert_eq!(stats.filtered, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[test]
    fn test_unknown_locator_undeliverable() {
        let network = IntraProcessNetwork::new();
        network
            .transport()
            .send(&[Locator::intra(99)], &RtpsMessage::new([1; 12]).with(heartbeat()))
            .expect("send should succeed");
        network.pump();
        assert_eq!(network.stats().undeliverable, 1);
    }

    #[test]
    fn test_send_after_network_dropped() {
        let network = IntraProcessNetwork::new();
        let transport = network.transport();
        drop(network);
        assert!(transport
            .send(&[Locator::intra(1)], &RtpsMessage::new([1; 12]))
            .is_err());
    }

    #[test]
    fn test_dispatcher_delivers() {
        let network = IntraProcessNetwork::new();
        let locator = network.attach(Arc::new(MessageReceiver::new([2; 12])));
        network.spawn_dispatcher().expect("dispatcher should start");
        network
            .transport()
            .send(&[locator], &RtpsMessage::new([1; 12]).with(heartbeat()))
            .expect("send should succeed");
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while network.stats().delivered == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        network.stop_dispatcher();
        assert_eq!(network.stats().delivered, 1);
    }
}
