/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::{Error, Exhaustion, Result};
use crate::host::utilities::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Reserved,
    InUse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTable {
    Symmetric,
    Asymmetric,
}

/// Free list for one hardware key table.
///
/// Slots are handed out first-fit, lowest id first. Reserved slots are fixed at
/// construction and never change state.
pub struct KeySlotAllocator {
    table: KeyTable,
    slots: Mutex<Vec<SlotState>>,
}

impl fmt::Debug for KeySlotAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySlotAllocator")
            .field("table", &self.table)
            .field("slots", &*lock(&self.slots))
            .finish()
    }
}

impl KeySlotAllocator {
    pub fn new(table: KeyTable, count: u8, reserved: &[u8]) -> Self {
        let slots = (0..count)
            .map(|id| {
                if reserved.contains(&id) {
                    SlotState::Reserved
                } else {
                    SlotState::Free
                }
            })
            .collect();
        Self {
            table,
            slots: Mutex::new(slots),
        }
    }

    pub fn table(&self) -> KeyTable {
        self.table
    }

    /// Claims the lowest free slot. The returned guard frees it again on drop.
    pub fn allocate(self: &Arc<Self>) -> Result<KeySlot> {
        let id = {
            let mut slots = lock(&self.slots);
            let id = slots
                .iter()
                .position(|s| *s == SlotState::Free)
                .ok_or(Exhaustion::NoFreeKeySlot);
            match id {
                Ok(id) => {
                    slots[id] = SlotState::InUse;
                    id as u8
                }
                Err(e) => {
                    warn!("{:?} key table exhausted", self.table);
                    return Err(e.into());
                }
            }
        };
        debug!("{:?} key slot {} allocated", self.table, id);
        Ok(KeySlot {
            id,
            owner: Arc::clone(self),
        })
    }

    /// Takes ownership of one specific free slot, e.g. a slot the platform
    /// filled before boot.
    pub fn claim(self: &Arc<Self>, slot: u8) -> Result<KeySlot> {
        {
            let mut slots = lock(&self.slots);
            match slots.get_mut(slot as usize) {
                Some(state @ SlotState::Free) => *state = SlotState::InUse,
                Some(SlotState::InUse) => {
                    return Err(Error::config(format!(
                        "{:?} key slot {} is owned by another context",
                        self.table, slot
                    )));
                }
                Some(SlotState::Reserved) => {
                    return Err(Error::config(format!("{:?} key slot {} is reserved", self.table, slot)));
                }
                None => {
                    return Err(Error::config(format!(
                        "{:?} key slot {} does not exist",
                        self.table, slot
                    )));
                }
            }
        }
        debug!("{:?} key slot {} claimed", self.table, slot);
        Ok(KeySlot {
            id: slot,
            owner: Arc::clone(self),
        })
    }

    /// Returns a slot to the free list. Reserved slots and unknown ids are ignored.
    pub fn release(&self, slot: u8) {
        let mut slots = lock(&self.slots);
        match slots.get_mut(slot as usize) {
            Some(state @ SlotState::InUse) => {
                *state = SlotState::Free;
                debug!("{:?} key slot {} released", self.table, slot);
            }
            Some(_) => {}
            None => warn!("release of unknown {:?} key slot {}", self.table, slot),
        }
    }

    pub fn state(&self, slot: u8) -> Option<SlotState> {
        lock(&self.slots).get(slot as usize).copied()
    }

    pub fn count(&self) -> usize {
        lock(&self.slots).len()
    }

    fn filter(&self, wanted: SlotState) -> Vec<u8> {
        lock(&self.slots)
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == wanted)
            .map(|(id, _)| id as u8)
            .collect()
    }

    pub fn in_use(&self) -> Vec<u8> {
        self.filter(SlotState::InUse)
    }

    pub fn available(&self) -> Vec<u8> {
        self.filter(SlotState::Free)
    }
}

/// Exclusive ownership of one allocated key slot.
#[derive(Debug)]
pub struct KeySlot {
    id: u8,
    owner: Arc<KeySlotAllocator>,
}

impl KeySlot {
    pub fn id(&self) -> u8 {
        self.id
    }
}

impl Drop for KeySlot {
    fn drop(&mut self) {
        self.owner.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric() -> Arc<KeySlotAllocator> {
        Arc::new(KeySlotAllocator::new(KeyTable::Symmetric, 16, &[0, 15]))
    }

    #[test]
    fn first_fit_skips_reserved() {
        let pool = symmetric();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!((a.id(), b.id()), (1, 2));
        drop(a);
        // Lowest id wins again once slot 1 is back.
        assert_eq!(pool.allocate().unwrap().id(), 1);
    }

    #[test]
    fn exhaustion_is_retryable() {
        let pool = symmetric();
        let held: Vec<_> = (0..14).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(held.last().map(KeySlot::id), Some(14));
        let err = pool.allocate().unwrap_err();
        assert_eq!(err, Error::ResourceExhausted(Exhaustion::NoFreeKeySlot));
        assert!(err.is_retryable());
    }

    #[test]
    fn releasing_reserved_is_noop() {
        let pool = symmetric();
        pool.release(15);
        pool.release(0);
        assert_eq!(pool.state(15), Some(SlotState::Reserved));
        assert_eq!(pool.state(0), Some(SlotState::Reserved));
        pool.release(200);
    }

    #[test]
    fn in_use_and_available_stay_disjoint() {
        let pool = symmetric();
        let mut held: Vec<KeySlot> = Vec::new();
        // Deterministic pseudo-random allocate/release walk.
        let mut seed = 0x1234_5678u32;
        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            if seed % 3 == 0 && !held.is_empty() {
                let idx = seed as usize % held.len();
                held.swap_remove(idx);
            } else if let Ok(slot) = pool.allocate() {
                assert!(slot.id() != 0 && slot.id() != 15);
                held.push(slot);
            }
            let in_use = pool.in_use();
            let free = pool.available();
            assert!(in_use.iter().all(|s| !free.contains(s)));
            assert_eq!(in_use.len(), held.len());
            assert_eq!(in_use.len() + free.len() + 2, pool.count());
        }
    }

    #[test]
    fn claimed_slot_is_skipped_by_allocate() {
        let pool = symmetric();
        let claimed = pool.claim(1).unwrap();
        assert_eq!(pool.state(1), Some(SlotState::InUse));
        assert_eq!(pool.allocate().unwrap().id(), 2);
        assert!(matches!(pool.claim(1), Err(Error::Configuration(_))));
        assert!(matches!(pool.claim(15), Err(Error::Configuration(_))));
        assert!(matches!(pool.claim(16), Err(Error::Configuration(_))));
        drop(claimed);
        assert_eq!(pool.state(1), Some(SlotState::Free));
    }

    #[test]
    fn asymmetric_table_has_no_reserved_slots() {
        let pool = Arc::new(KeySlotAllocator::new(KeyTable::Asymmetric, 2, &[]));
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));
        assert!(pool.allocate().is_err());
    }
}
