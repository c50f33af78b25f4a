// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Entity registry: participant prefixes and per-participant entity keys.
//!
//! There is no process-global instance. Whoever builds participants owns an
//! `Arc<EntityRegistry>` and hands it to each of them, so tests can run
//! several isolated "processes" side by side.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use super::guid::{
    EntityId, GuidPrefix, ENTITY_KIND_READER_NO_KEY, ENTITY_KIND_READER_WITH_KEY,
    ENTITY_KIND_WRITER_NO_KEY, ENTITY_KIND_WRITER_WITH_KEY,
};

/// Kind of user endpoint being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    WriterWithKey,
    WriterNoKey,
    ReaderWithKey,
    ReaderNoKey,
}

impl EntityKind {
    /// RTPS entity kind octet.
    pub fn octet(self) -> u8 {
        match self {
            EntityKind::WriterWithKey => ENTITY_KIND_WRITER_WITH_KEY,
            EntityKind::WriterNoKey => ENTITY_KIND_WRITER_NO_KEY,
            EntityKind::ReaderWithKey => ENTITY_KIND_READER_WITH_KEY,
            EntityKind::ReaderNoKey => ENTITY_KIND_READER_NO_KEY,
        }
    }
}

/// Allocator for GUID prefixes and entity IDs.
#[derive(Debug)]
pub struct EntityRegistry {
    host_id: u32,
    app_id: u32,
    next_instance: AtomicU32,
    entity_counters: DashMap<GuidPrefix, u32>,
}

impl EntityRegistry {
    /// Create a registry for the given host identifier (usually derived from
    /// an IPv4 address). The app id is the current process id.
    pub fn new(host_id: u32) -> Self {
        Self::with_app_id(host_id, std::process::id())
    }

    /// Create a registry with an explicit application id.
    pub fn with_app_id(host_id: u32, app_id: u32) -> Self {
        Self {
            host_id,
            app_id,
            next_instance: AtomicU32::new(1),
            entity_counters: DashMap::new(),
        }
    }

    /// Allocate a fresh participant prefix: host id | app id | instance id.
    pub fn allocate_prefix(&self) -> GuidPrefix {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let mut prefix = [0u8; 12];
        prefix[0..4].copy_from_slice(&self.host_id.to_be_bytes());
        prefix[4..8].copy_from_slice(&self.app_id.to_be_bytes());
        prefix[8..12].copy_from_slice(&instance.to_be_bytes());
        self.entity_counters.insert(prefix, 0);
        log::debug!("[registry] allocated participant prefix {:02x?}", prefix);
        prefix
    }

    /// Allocate the next entity ID for a participant.
    ///
    /// Entity keys are 24-bit and shared between writers and readers of the
    /// same participant, starting at 1.
    pub fn next_entity_id(&self, prefix: &GuidPrefix, kind: EntityKind) -> EntityId {
        let key = {
            let mut counter = self.entity_counters.entry(*prefix).or_insert(0);
            *counter = (*counter + 1) & 0x00FF_FFFF;
            if *counter == 0 {
                *counter = 1;
            }
            *counter
        };
        let bytes = key.to_be_bytes();
        [bytes[1], bytes[2], bytes[3], kind.octet()]
    }

    /// Forget a participant (its counters are dropped).
    pub fn release_participant(&self, prefix: &GuidPrefix) {
        self.entity_counters.remove(prefix);
    }

    /// Number of entities allocated so far for a participant.
    pub fn entity_count(&self, prefix: &GuidPrefix) -> u32 {
        self.entity_counters.get(prefix).map(|c| *c).unwrap_or(0)
    }

    /// Number of live participants.
    pub fn participant_count(&self) -> usize {
        self.entity_counters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_prefixes_are_unique() {
        let registry = EntityRegistry::with_app_id(0x0a00_0001, 42);
        let a = registry.allocate_prefix();
        let b = registry.allocate_prefix();
        assert_ne!(a, b);
        assert_eq!(&a[0..4], &[0x0a, 0x00, 0x00, 0x01]);
        assert_eq!(registry.participant_count(), 2);
    }

    #[test]
    fn test_registry_entity_ids_increment_per_participant() {
        let registry = EntityRegistry::with_app_id(1, 1);
        let p1 = registry.allocate_prefix();
        let p2 = registry.allocate_prefix();

        let w1 = registry.next_entity_id(&p1, EntityKind::WriterNoKey);
        let r1 = registry.next_entity_id(&p1, EntityKind::ReaderWithKey);
        let w2 = registry.next_entity_id(&p2, EntityKind::WriterNoKey);

        assert_eq!(w1, [0, 0, 1, ENTITY_KIND_WRITER_NO_KEY]);
        assert_eq!(r1, [0, 0, 2, ENTITY_KIND_READER_WITH_KEY]);
        assert_eq!(w2, [0, 0, 1, ENTITY_KIND_WRITER_NO_KEY]);
        assert_eq!(registry.entity_count(&p1), 2);
    }

    #[test]
    fn test_registries_are_isolated() {
        let a = EntityRegistry::with_app_id(1, 1);
        let b = EntityRegistry::with_app_id(1, 1);
        let pa = a.allocate_prefix();
        let pb = b.allocate_prefix();
        // Same seed, independent counters.
        assert_eq!(pa, pb);
        a.release_participant(&pa);
        assert_eq!(a.participant_count(), 0);
        assert_eq!(b.participant_count(), 1);
    }
}
