// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cache changes: one versioned update to a topic instance.

use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::core::guid::GUID;

/// 16-byte instance key hash (all zeros for unkeyed topics).
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(pub [u8; 16]);

impl KeyHash {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Key hash whose first 8 bytes carry `value` (big-endian). Handy for
    /// integer-keyed topics.
    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Debug for KeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyHash(")?;
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

/// Kind of change carried by a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChangeKind {
    #[default]
    Alive,
    Disposed,
    Unregistered,
}

/// Identity of a sample across the system (request/reply correlation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleIdentity {
    pub writer_guid: GUID,
    pub sequence_number: u64,
}

/// Ordering key of a sample inside a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SampleKey {
    pub writer: GUID,
    pub seq: u64,
}

impl SampleKey {
    pub const fn new(writer: GUID, seq: u64) -> Self {
        Self { writer, seq }
    }
}

/// A sample held by a history.
#[derive(Debug, Clone)]
pub struct CacheChange {
    pub writer_guid: GUID,
    pub sequence_number: u64,
    pub instance_key: KeyHash,
    pub kind: ChangeKind,
    pub payload: Arc<[u8]>,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    /// Local time the history admitted the sample.
    pub received_at: Instant,
    /// Lifespan expiry, if any.
    pub expires_at: Option<Instant>,
}

impl CacheChange {
    pub fn new(
        writer_guid: GUID,
        sequence_number: u64,
        kind: ChangeKind,
        instance_key: KeyHash,
        payload: impl Into<Arc<[u8]>>,
    ) -> Self {
        Self {
            writer_guid,
            sequence_number,
            instance_key,
            kind,
            payload: payload.into(),
            source_timestamp: SystemTime::now(),
            related_sample_id: None,
            received_at: Instant::now(),
            expires_at: None,
        }
    }

    pub fn with_source_timestamp(mut self, ts: SystemTime) -> Self {
        self.source_timestamp = ts;
        self
    }

    pub fn with_related(mut self, related: Option<SampleIdentity>) -> Self {
        self.related_sample_id = related;
        self
    }

    pub fn with_expiry(mut self, expires_at: Option<Instant>) -> Self {
        self.expires_at = expires_at;
        self
    }

    #[inline]
    pub fn key(&self) -> SampleKey {
        SampleKey::new(self.writer_guid, self.sequence_number)
    }

    #[inline]
    pub fn identity(&self) -> SampleIdentity {
        SampleIdentity {
            writer_guid: self.writer_guid,
            sequence_number: self.sequence_number,
        }
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Metadata returned alongside samples by `take()` / `read()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub writer_guid: GUID,
    pub sequence_number: u64,
    pub instance_key: KeyHash,
    pub kind: ChangeKind,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    /// `false` for dispose/unregister notifications (no payload).
    pub valid_data: bool,
    /// Sample was already returned by a previous `read()`.
    pub already_read: bool,
}

impl SampleInfo {
    pub fn from_change(change: &CacheChange, already_read: bool) -> Self {
        Self {
            writer_guid: change.writer_guid,
            sequence_number: change.sequence_number,
            instance_key: change.instance_key,
            kind: change.kind,
            source_timestamp: change.source_timestamp,
            related_sample_id: change.related_sample_id,
            valid_data: change.kind == ChangeKind::Alive,
            already_read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_hash_from_u64() {
        let key = KeyHash::from_u64(7);
        assert!(!key.is_zero());
        assert_eq!(key.0[7], 7);
        assert!(KeyHash::default().is_zero());
    }

    #[test]
    fn test_sample_key_orders_by_writer_then_seq() {
        let w1 = GUID::new([1; 12], [0, 0, 1, 3]);
        let w2 = GUID::new([2; 12], [0, 0, 1, 3]);
        assert!(SampleKey::new(w1, 9) < SampleKey::new(w1, 10));
        assert!(SampleKey::new(w1, 100) < SampleKey::new(w2, 1));
    }

    #[test]
    fn test_sample_info_for_dispose_has_no_valid_data() {
        let change = CacheChange::new(
            GUID::zero(),
            3,
            ChangeKind::Disposed,
            KeyHash::from_u64(1),
            Vec::new(),
        );
        let info = SampleInfo::from_change(&change, false);
        assert!(!info.valid_data);
        assert_eq!(info.sequence_number, 3);
    }
}
