// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample arena with generation-checked handles.
//!
//! Proxies reference samples through [`SampleHandle`]s instead of pointers.
//! When a sample is evicted its slot generation is bumped, so a handle kept
//! by a pending retransmission simply resolves to `None` (the writer then
//! answers with GAP) instead of pointing at a recycled sample.

use super::change::CacheChange;

/// Handle to a slot in a [`SampleArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    change: Option<CacheChange>,
}

/// Slab of cache changes.
#[derive(Debug, Default)]
pub struct SampleArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl SampleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena with `capacity` slots reserved up front.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::with_capacity(capacity),
            len: 0,
        }
    }

    pub fn insert(&mut self, change: CacheChange) -> SampleHandle {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.change = Some(change);
            return SampleHandle {
                index,
                generation: slot.generation,
            };
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            change: Some(change),
        });
        SampleHandle {
            index,
            generation: 0,
        }
    }

    #[must_use]
    pub fn get(&self, handle: SampleHandle) -> Option<&CacheChange> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.change.as_ref())
    }

    pub fn get_mut(&mut self, handle: SampleHandle) -> Option<&mut CacheChange> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.change.as_mut())
    }

    /// Remove the sample; the handle (and every copy of it) becomes stale.
    pub fn remove(&mut self, handle: SampleHandle) -> Option<CacheChange> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let change = slot.change.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(change)
    }

    #[must_use]
    pub fn contains(&self, handle: SampleHandle) -> bool {
        self.get(handle).is_some()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.change.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guid::GUID;
    use crate::reliability::change::{ChangeKind, KeyHash};

    fn change(seq: u64) -> CacheChange {
        CacheChange::new(
            GUID::zero(),
            seq,
            ChangeKind::Alive,
            KeyHash::default(),
            vec![seq as u8],
        )
    }

    #[test]
    fn test_arena_insert_get_remove() {
        let mut arena = SampleArena::new();
        let h1 = arena.insert(change(1));
        let h2 = arena.insert(change(2));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.get(h1).map(|c| c.sequence_number), Some(1));

        let removed = arena.remove(h1).expect("sample should be present");
        assert_eq!(removed.sequence_number, 1);
        assert!(arena.get(h1).is_none());
        assert!(arena.contains(h2));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_stale_handle_after_slot_reuse() {
        let mut arena = SampleArena::with_capacity(4);
        let old = arena.insert(change(1));
        arena.remove(old);
        let new = arena.insert(change(2));

        // Same slot, new generation.
        assert!(arena.get(old).is_none());
        assert!(arena.remove(old).is_none());
        assert_eq!(arena.get(new).map(|c| c.sequence_number), Some(2));
    }

    #[test]
    fn test_clear_invalidates_handles() {
        let mut arena = SampleArena::new();
        let handles: Vec<_> = (1..=3).map(|s| arena.insert(change(s))).collect();
        arena.clear();
        assert!(arena.is_empty());
        assert!(handles.iter().all(|h| arena.get(*h).is_none()));
    }
}
