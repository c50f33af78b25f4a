// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Metrics for Reliable QoS
//!
//! Process-local atomic counters shared by the engines of one endpoint.
//! Nothing is exported; callers read them through [`ReliableMetrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Reliable QoS metrics collector
///
/// All methods use atomic operations (Relaxed ordering) for lock-free
/// updates; a snapshot is therefore not a consistent cut across counters.
#[derive(Debug, Default)]
pub struct ReliableMetrics {
    heartbeats_sent: AtomicU64,
    heartbeats_received: AtomicU64,
    acknacks_sent: AtomicU64,
    acknacks_received: AtomicU64,
    nack_frags_sent: AtomicU64,
    nack_frags_received: AtomicU64,
    data_sent: AtomicU64,
    retransmit_sent: AtomicU64,
    gaps_sent: AtomicU64,
    gaps_received: AtomicU64,
    samples_lost: AtomicU64,
    samples_rejected: AtomicU64,
    duplicates: AtomicU64,
    out_of_order: AtomicU64,
    /// Largest number of sequence numbers covered by a single loss or GAP.
    max_gap_size: AtomicU64,
}

/// Point-in-time copy of [`ReliableMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub heartbeats_sent: u64,
    pub heartbeats_received: u64,
    pub acknacks_sent: u64,
    pub acknacks_received: u64,
    pub nack_frags_sent: u64,
    pub nack_frags_received: u64,
    pub data_sent: u64,
    pub retransmit_sent: u64,
    pub gaps_sent: u64,
    pub gaps_received: u64,
    pub samples_lost: u64,
    pub samples_rejected: u64,
    pub duplicates: u64,
    pub out_of_order: u64,
    pub max_gap_size: u64,
}

impl ReliableMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_heartbeats_sent(&self, count: u64) {
        self.heartbeats_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_heartbeats_received(&self, count: u64) {
        self.heartbeats_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_acknacks_sent(&self, count: u64) {
        self.acknacks_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_acknacks_received(&self, count: u64) {
        self.acknacks_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_nack_frags_sent(&self, count: u64) {
        self.nack_frags_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_nack_frags_received(&self, count: u64) {
        self.nack_frags_received.fetch_add(count, Ordering::Relaxed);
    }

    /// First transmissions (DATA or a full set of DATA_FRAG).
    pub fn increment_data_sent(&self, count: u64) {
        self.data_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retransmit_sent(&self, count: u64) {
        self.retransmit_sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Writer sent a GAP covering `gap_size` sequence numbers.
    pub fn record_gap_sent(&self, gap_size: u64) {
        self.gaps_sent.fetch_add(1, Ordering::Relaxed);
        self.update_max_gap_size(gap_size);
    }

    pub fn increment_gaps_received(&self, count: u64) {
        self.gaps_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Reader gave up on `count` sequence numbers.
    pub fn record_samples_lost(&self, count: u64) {
        self.samples_lost.fetch_add(count, Ordering::Relaxed);
        self.update_max_gap_size(count);
    }

    pub fn increment_samples_rejected(&self, count: u64) {
        self.samples_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_duplicates(&self, count: u64) {
        self.duplicates.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_out_of_order(&self, count: u64) {
        self.out_of_order.fetch_add(count, Ordering::Relaxed);
    }

    /// Compare-exchange loop so concurrent recorders keep the true maximum.
    fn update_max_gap_size(&self, new_size: u64) {
        let mut current = self.max_gap_size.load(Ordering::Relaxed);
        while new_size > current {
            match self.max_gap_size.compare_exchange_weak(
                current,
                new_size,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent.load(Ordering::Relaxed)
    }

    pub fn retransmit_sent(&self) -> u64 {
        self.retransmit_sent.load(Ordering::Relaxed)
    }

    pub fn samples_lost(&self) -> u64 {
        self.samples_lost.load(Ordering::Relaxed)
    }

    pub fn max_gap_size(&self) -> u64 {
        self.max_gap_size.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
            acknacks_sent: self.acknacks_sent.load(Ordering::Relaxed),
            acknacks_received: self.acknacks_received.load(Ordering::Relaxed),
            nack_frags_sent: self.nack_frags_sent.load(Ordering::Relaxed),
            nack_frags_received: self.nack_frags_received.load(Ordering::Relaxed),
            data_sent: self.data_sent.load(Ordering::Relaxed),
            retransmit_sent: self.retransmit_sent.load(Ordering::Relaxed),
            gaps_sent: self.gaps_sent.load(Ordering::Relaxed),
            gaps_received: self.gaps_received.load(Ordering::Relaxed),
            samples_lost: self.samples_lost.load(Ordering::Relaxed),
            samples_rejected: self.samples_rejected.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            max_gap_size: self.max_gap_size.load(Ordering::Relaxed),
        }
    }
}
