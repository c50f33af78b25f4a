// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RTPS GUID (Globally Unique Identifier)
//!
//! 16-byte identifier for RTPS endpoints:
//! - GUID Prefix: 12 bytes (participant identifier)
//! - Entity ID: 4 bytes (3-byte key + 1-byte entity kind)

use std::fmt;

/// Participant-level part of a GUID.
pub type GuidPrefix = [u8; 12];

/// Endpoint-level part of a GUID: 3-byte key followed by the entity kind.
pub type EntityId = [u8; 4];

/// All-zero prefix (INFO_DST broadcast / unknown participant).
pub const GUIDPREFIX_UNKNOWN: GuidPrefix = [0; 12];

/// RTPS constant: ENTITYID_UNKNOWN.
pub const ENTITYID_UNKNOWN: EntityId = [0x00, 0x00, 0x00, 0x00];

/// Entity kind octets (RTPS v2.5 Table 9.1).
pub const ENTITY_KIND_WRITER_WITH_KEY: u8 = 0x02;
pub const ENTITY_KIND_WRITER_NO_KEY: u8 = 0x03;
pub const ENTITY_KIND_READER_NO_KEY: u8 = 0x04;
pub const ENTITY_KIND_READER_WITH_KEY: u8 = 0x07;

/// RTPS GUID.
///
/// # Display Format
/// Hex with dots: "01.0f.ac.10.00.00.00.00.00.00.00.01.00.00.01.02"
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GUID {
    pub prefix: GuidPrefix,
    pub entity_id: EntityId,
}

impl GUID {
    pub const fn new(prefix: GuidPrefix, entity_id: EntityId) -> Self {
        Self { prefix, entity_id }
    }

    /// Placeholder GUID; never matched.
    pub const fn zero() -> Self {
        Self {
            prefix: GUIDPREFIX_UNKNOWN,
            entity_id: ENTITYID_UNKNOWN,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// Entity kind octet.
    #[inline]
    pub fn entity_kind(&self) -> u8 {
        self.entity_id[3]
    }

    /// True for writer entity kinds (with or without key).
    pub fn is_writer(&self) -> bool {
        matches!(
            self.entity_kind(),
            ENTITY_KIND_WRITER_WITH_KEY | ENTITY_KIND_WRITER_NO_KEY
        )
    }

    /// True for reader entity kinds (with or without key).
    pub fn is_reader(&self) -> bool {
        matches!(
            self.entity_kind(),
            ENTITY_KIND_READER_WITH_KEY | ENTITY_KIND_READER_NO_KEY
        )
    }
}

impl Default for GUID {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for GUID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut octets = self.prefix.iter().chain(self.entity_id.iter());
        if let Some(first) = octets.next() {
            write!(f, "{:02x}", first)?;
        }
        octets.try_for_each(|octet| write!(f, ".{:02x}", octet))
    }
}

impl fmt::Debug for GUID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GUID({})", self)
    }
}
