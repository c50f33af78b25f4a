// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS reliability submessages
//!
//! Logical view of the submessages exchanged by the reliable engines:
//! - DATA / DATA_FRAG: Writer sends a sample (whole or fragmented)
//! - HEARTBEAT: Writer announces available sequence range
//! - ACKNACK: Reader acknowledges and requests retransmission
//! - NACK_FRAG: Reader requests missing fragments of one sample
//! - GAP: Writer declares sequences irrelevant / no longer available
//!
//! Byte-exact encoding belongs to the RTPS codec; these structs only carry
//! the fields the state machines need. Entity IDs are relative to the GUID
//! prefix of the enclosing message.

use std::sync::Arc;
use std::time::SystemTime;

use super::bitmap::{FragmentNumberSet, SequenceBitmapRange};
use super::change::{ChangeKind, KeyHash, SampleIdentity};
use super::fragment::fragment_count;
use crate::core::guid::{EntityId, ENTITYID_UNKNOWN};
use crate::dds::{Error, Result};

// ============================================================================
// DATA
// ============================================================================

/// DATA submessage (RTPS v2.5 Sec.8.3.7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub seq: u64,
    pub kind: ChangeKind,
    pub instance_key: KeyHash,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    pub payload: Arc<[u8]>,
}

// ============================================================================
// DATA_FRAG
// ============================================================================

/// DATA_FRAG submessage (RTPS v2.5 Sec.8.3.7.3). Fragment numbers start at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFragMsg {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub seq: u64,
    pub fragment_start: u32,
    pub fragments_in_submessage: u16,
    pub fragment_size: u16,
    pub sample_size: u32,
    pub kind: ChangeKind,
    pub instance_key: KeyHash,
    pub source_timestamp: SystemTime,
    pub related_sample_id: Option<SampleIdentity>,
    /// Bytes of fragments `[fragment_start, fragment_start + fragments_in_submessage)`.
    pub payload: Arc<[u8]>,
}

impl DataFragMsg {
    /// Total fragments of the sample.
    #[must_use]
    pub fn total_fragments(&self) -> u32 {
        fragment_count(self.sample_size as usize, usize::from(self.fragment_size))
    }

    /// Last fragment number carried by this submessage.
    #[must_use]
    pub fn fragment_end(&self) -> u32 {
        self.fragment_start
            .saturating_add(u32::from(self.fragments_in_submessage))
            .saturating_sub(1)
    }
}

// ============================================================================
// HEARTBEAT
// ============================================================================

/// HEARTBEAT submessage (RTPS v2.5 Sec.8.3.7.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatMsg {
    /// `ENTITYID_UNKNOWN` addresses every matched reader.
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    /// First (oldest) sequence number available in the writer history.
    pub first_seq: u64,
    /// Last sequence number written; `first_seq - 1` when history is empty.
    pub last_seq: u64,
    /// Monotonic heartbeat counter (anti-replay).
    pub count: u32,
    /// Writer expects no response unless something is missing.
    pub final_flag: bool,
    /// Heartbeat doubles as a liveliness assertion.
    pub liveliness_flag: bool,
}

// ============================================================================
// ACKNACK
// ============================================================================

/// ACKNACK submessage (RTPS v2.5 Sec.8.3.7.1).
///
/// `reader_sn_state.base() - 1` is the highest sequence acknowledged
/// contiguously; set bits are requested for retransmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckNackMsg {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub reader_sn_state: SequenceBitmapRange,
    pub count: u32,
    pub final_flag: bool,
}

// ============================================================================
// NACK_FRAG
// ============================================================================

/// NACK_FRAG submessage (RTPS v2.5 Sec.8.3.7.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackFragMsg {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub writer_sn: u64,
    pub fragment_number_state: FragmentNumberSet,
    pub count: u32,
}

// ============================================================================
// GAP
// ============================================================================

/// GAP submessage (RTPS v2.5 Sec.8.3.7.4).
///
/// Irrelevant: `[gap_start, gap_list.base() - 1]` plus every bit of `gap_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapMsg {
    pub reader_id: EntityId,
    pub writer_id: EntityId,
    pub gap_start: u64,
    pub gap_list: SequenceBitmapRange,
}

impl GapMsg {
    /// Number of sequence numbers declared irrelevant.
    #[must_use]
    pub fn irrelevant_count(&self) -> u64 {
        self.gap_list
            .base()
            .saturating_sub(self.gap_start)
            .saturating_add(self.gap_list.len() as u64)
    }
}

// ============================================================================
// SUBMESSAGE
// ============================================================================

/// Any submessage handled by the reliability engines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submessage {
    Data(DataMsg),
    DataFrag(DataFragMsg),
    Heartbeat(HeartbeatMsg),
    AckNack(AckNackMsg),
    NackFrag(NackFragMsg),
    Gap(GapMsg),
}

impl Submessage {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Submessage::Data(_) => "DATA",
            Submessage::DataFrag(_) => "DATA_FRAG",
            Submessage::Heartbeat(_) => "HEARTBEAT",
            Submessage::AckNack(_) => "ACKNACK",
            Submessage::NackFrag(_) => "NACK_FRAG",
            Submessage::Gap(_) => "GAP",
        }
    }

    #[must_use]
    pub fn reader_id(&self) -> EntityId {
        match self {
            Submessage::Data(m) => m.reader_id,
            Submessage::DataFrag(m) => m.reader_id,
            Submessage::Heartbeat(m) => m.reader_id,
            Submessage::AckNack(m) => m.reader_id,
            Submessage::NackFrag(m) => m.reader_id,
            Submessage::Gap(m) => m.reader_id,
        }
    }

    #[must_use]
    pub fn writer_id(&self) -> EntityId {
        match self {
            Submessage::Data(m) => m.writer_id,
            Submessage::DataFrag(m) => m.writer_id,
            Submessage::Heartbeat(m) => m.writer_id,
            Submessage::AckNack(m) => m.writer_id,
            Submessage::NackFrag(m) => m.writer_id,
            Submessage::Gap(m) => m.writer_id,
        }
    }

    /// `true` for submessages sent by writers (routed to readers).
    #[must_use]
    pub fn is_writer_to_reader(&self) -> bool {
        matches!(
            self,
            Submessage::Data(_)
                | Submessage::DataFrag(_)
                | Submessage::Heartbeat(_)
                | Submessage::Gap(_)
        )
    }

    /// Structural validation of an incoming submessage.
    ///
    /// Failures are `ProtocolViolation`s: the receiver logs and drops them.
    pub fn validate(&self) -> Result<()> {
        if self.writer_id() == ENTITYID_UNKNOWN {
            return violation(self, "writer entity id is unknown");
        }
        match self {
            Submessage::Data(m) => {
                if m.seq == 0 {
                    return violation(self, "sequence number 0");
                }
            }
            Submessage::DataFrag(m) => {
                if m.seq == 0 {
                    return violation(self, "sequence number 0");
                }
                if m.fragment_size == 0 || m.sample_size == 0 {
                    return violation(self, "empty fragment or sample size");
                }
                if m.fragment_start == 0 || m.fragments_in_submessage == 0 {
                    return violation(self, "fragment numbers start at 1");
                }
                if m.fragment_end() > m.total_fragments() {
                    return violation(self, "fragment number beyond sample size");
                }
                let max_len =
                    usize::from(m.fragments_in_submessage) * usize::from(m.fragment_size);
                if m.payload.len() > max_len || m.payload.is_empty() {
                    return violation(self, "fragment payload length mismatch");
                }
            }
            Submessage::Heartbeat(m) => {
                if m.first_seq == 0 {
                    return violation(self, "first_seq 0");
                }
                if m.last_seq.saturating_add(1) < m.first_seq {
                    return violation(self, "last_seq < first_seq - 1");
                }
            }
            Submessage::AckNack(m) => {
                if m.reader_id == ENTITYID_UNKNOWN {
                    return violation(self, "reader entity id is unknown");
                }
                if m.reader_sn_state.base() == 0 {
                    return violation(self, "bitmap base 0");
                }
            }
            Submessage::NackFrag(m) => {
                if m.reader_id == ENTITYID_UNKNOWN {
                    return violation(self, "reader entity id is unknown");
                }
                if m.writer_sn == 0 || m.fragment_number_state.base() == 0 {
                    return violation(self, "sequence or fragment number 0");
                }
            }
            Submessage::Gap(m) => {
                if m.gap_start == 0 {
                    return violation(self, "gap_start 0");
                }
                if m.gap_list.base() < m.gap_start {
                    return violation(self, "gap_list base below gap_start");
                }
            }
        }
        Ok(())
    }
}

fn violation(msg: &Submessage, what: &str) -> Result<()> {
    Err(Error::ProtocolViolation(format!(
        "{}: {}",
        msg.kind_name(),
        what
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    const WRITER: EntityId = [0, 0, 1, 0x02];
    const READER: EntityId = [0, 0, 1, 0x07];

    fn heartbeat(first: u64, last: u64) -> Submessage {
        Submessage::Heartbeat(HeartbeatMsg {
            reader_id: ENTITYID_UNKNOWN,
            writer_id: WRITER,
            first_seq: first,
            last_seq: last,
            count: 1,
            final_flag: false,
            liveliness_flag: false,
        })
    }

    #[test]
    fn test_heartbeat_validation() {
        assert!(heartbeat(1, 5).validate().is_ok());
        // Empty history: last = first - 1.
        assert!(heartbeat(6, 5).validate().is_ok());
        assert!(matches!(
            heartbeat(7, 5).validate(),
            Err(Error::ProtocolViolation(_))
        ));
        assert!(heartbeat(0, 5).validate().is_err());
    }

    #[test]
    fn test_gap_validation_and_count() {
        let gap = GapMsg {
            reader_id: READER,
            writer_id: WRITER,
            gap_start: 3,
            gap_list: SequenceBitmapRange::from_items(5, [5, 7]),
        };
        assert!(Submessage::Gap(gap).validate().is_ok());
        assert_eq!(gap.irrelevant_count(), 4);

        let bad = GapMsg {
            gap_list: SequenceBitmapRange::new(2),
            ..gap
        };
        assert!(Submessage::Gap(bad).validate().is_err());
    }

    #[test]
    fn test_data_frag_validation() {
        let frag = DataFragMsg {
            reader_id: READER,
            writer_id: WRITER,
            seq: 1,
            fragment_start: 3,
            fragments_in_submessage: 1,
            fragment_size: 100,
            sample_size: 250,
            kind: ChangeKind::Alive,
            instance_key: KeyHash::default(),
            source_timestamp: SystemTime::now(),
            related_sample_id: None,
            payload: Arc::from(vec![0u8; 50]),
        };
        assert_eq!(frag.total_fragments(), 3);
        assert!(Submessage::DataFrag(frag.clone()).validate().is_ok());

        let beyond = DataFragMsg {
            fragment_start: 4,
            ..frag.clone()
        };
        assert!(Submessage::DataFrag(beyond).validate().is_err());

        let zero = DataFragMsg {
            fragment_start: 0,
            ..frag
        };
        assert!(Submessage::DataFrag(zero).validate().is_err());
    }

    #[test]
    fn test_acknack_requires_reader_id() {
        let ack = AckNackMsg {
            reader_id: ENTITYID_UNKNOWN,
            writer_id: WRITER,
            reader_sn_state: SequenceBitmapRange::new(1),
            count: 1,
            final_flag: true,
        };
        assert!(Submessage::AckNack(ack).validate().is_err());
        let ack = AckNackMsg {
            reader_id: READER,
            ..ack
        };
        assert!(Submessage::AckNack(ack).validate().is_ok());
    }
}
