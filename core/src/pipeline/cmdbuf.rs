/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use log::{debug, warn};

use crate::error::{Exhaustion, Result};
use crate::host::config::BackoffPolicy;
use crate::se::encoder::CommandSink;

struct Slot {
    free: AtomicBool,
    storage: Box<[AtomicU32]>,
}

/// Ring of fixed-capacity command buffers for one engine instance.
///
/// The `free` flag of each slot is the only state shared between the submitting
/// side (claim) and the completion side (release).
pub struct CommandBufferPool {
    slots: Box<[Slot]>,
    last: AtomicUsize,
    backoff: BackoffPolicy,
}

impl fmt::Debug for CommandBufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandBufferPool")
            .field("slots", &self.slots.len())
            .field("busy", &self.busy_count())
            .finish()
    }
}

impl CommandBufferPool {
    pub fn new(slots: usize, words: usize, backoff: BackoffPolicy) -> Arc<Self> {
        let slots = (0..slots)
            .map(|_| Slot {
                free: AtomicBool::new(true),
                storage: (0..words).map(|_| AtomicU32::new(0)).collect(),
            })
            .collect();
        Arc::new(Self {
            slots,
            // First scan starts at slot 0.
            last: AtomicUsize::new(usize::MAX),
            backoff,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity_words(&self) -> usize {
        self.slots.first().map_or(0, |s| s.storage.len())
    }

    /// Slots currently claimed and not yet released.
    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.free.load(Ordering::Acquire))
            .count()
    }

    pub fn is_claimed(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .is_some_and(|s| !s.free.load(Ordering::Acquire))
    }

    /// One round-robin scan starting after the last claimed slot.
    pub fn try_claim(self: &Arc<Self>) -> Option<SlotLease> {
        let n = self.slots.len();
        let start = self.last.load(Ordering::Relaxed).wrapping_add(1);
        for step in 0..n {
            let index = start.wrapping_add(step) % n;
            if self.slots[index]
                .free
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.last.store(index, Ordering::Relaxed);
                return Some(SlotLease {
                    pool: Arc::clone(self),
                    index,
                });
            }
        }
        None
    }

    /// Claims a slot, backing off between scans. Gives up with
    /// [`Exhaustion::CommandBufferBusy`] once the policy's rounds are spent.
    pub async fn claim(self: &Arc<Self>) -> Result<SlotLease> {
        let rounds = self.backoff.rounds.max(1);
        for round in 0..rounds {
            if let Some(lease) = self.try_claim() {
                return Ok(lease);
            }
            if round + 1 == rounds {
                break;
            }
            if self.backoff.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.backoff.delay).await;
            }
        }
        warn!("All {} command buffer slots busy after {} rounds", self.len(), rounds);
        Err(Exhaustion::CommandBufferBusy.into())
    }

    /// Marks `index` free. Releasing a free slot does nothing.
    pub fn release(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        if slot.free.swap(true, Ordering::AcqRel) {
            debug!("Command buffer slot {} released twice", index);
        }
    }
}

/// Exclusive ownership of one claimed slot. Dropping it releases the slot.
pub struct SlotLease {
    pool: Arc<CommandBufferPool>,
    index: usize,
}

impl fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SlotLease({})", self.index)
    }
}

impl SlotLease {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_claimed(&self) -> bool {
        self.pool.is_claimed(self.index)
    }

    /// Starts writing the slot from its first word.
    pub fn writer(&self) -> CommandWriter<'_> {
        CommandWriter {
            storage: &self.pool.slots[self.index].storage,
            len: 0,
        }
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

/// Encoder sink backed by a claimed slot.
pub struct CommandWriter<'a> {
    storage: &'a [AtomicU32],
    len: usize,
}

impl CommandWriter<'_> {
    pub fn words(&self) -> Vec<u32> {
        self.storage[..self.len]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }
}

impl CommandSink for CommandWriter<'_> {
    fn push(&mut self, word: u32) -> Result<()> {
        let cell = self
            .storage
            .get(self.len)
            .ok_or(Exhaustion::CommandBufferFull {
                capacity: self.storage.len(),
            })?;
        cell.store(word, Ordering::Relaxed);
        self.len += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }
}
