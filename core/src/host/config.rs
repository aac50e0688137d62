/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use crate::error::{Error, Result};

/// How long `CommandBufferPool::claim` keeps probing before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Full scans of the ring before reporting `Busy`. At least one scan always happens.
    pub rounds: u32,
    /// Pause between two scans. Zero yields to the runtime instead of sleeping.
    pub delay: Duration,
}

impl BackoffPolicy {
    /// Single scan, no waiting. Handy for tests.
    pub const fn immediate() -> Self {
        Self {
            rounds: 1,
            delay: Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            rounds: 100,
            delay: Duration::from_millis(1),
        }
    }
}

/// Tunables for one security engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of requests folded into one hardware submission.
    pub max_tasks_per_submit: usize,
    /// Number of command buffer slots in each engine's ring.
    pub cmdbuf_slots: usize,
    /// Capacity of a single command buffer slot, in 32-bit words.
    pub cmdbuf_words: usize,
    /// Retry budget for claiming a command buffer slot.
    pub claim_backoff: BackoffPolicy,
    /// Largest number of source segments a request may carry.
    pub max_src_segments: usize,
    /// Largest number of destination segments a request may carry.
    pub max_dst_segments: usize,
    /// Pending requests held per engine before new ones go to the backlog.
    pub queue_len: usize,
    /// Timeout for synchronous waits (key loads, DRBG).
    pub wait_timeout: Duration,
    /// Size of the symmetric key table.
    pub aes_keyslots: u8,
    /// Secure root key slot, never handed out.
    pub srk_slot: u8,
    /// Secure storage key slot, never handed out and never written by a key load.
    pub ssk_slot: u8,
    /// Size of the RSA key table.
    pub rsa_keyslots: u8,
    /// DRBG generations between two forced reseeds.
    pub drbg_reseed_interval: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_submit: 64,
            cmdbuf_slots: 10,
            cmdbuf_words: 8192,
            claim_backoff: BackoffPolicy::default(),
            max_src_segments: 50,
            max_dst_segments: 50,
            queue_len: 50,
            wait_timeout: Duration::from_secs(2),
            aes_keyslots: 16,
            srk_slot: 0,
            ssk_slot: 15,
            rsa_keyslots: 2,
            drbg_reseed_interval: 0x0077_3594,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tasks_per_submit == 0 {
            return Err(Error::config("max_tasks_per_submit must be non-zero"));
        }
        if self.cmdbuf_slots == 0 || self.cmdbuf_words == 0 {
            return Err(Error::config("command buffer ring must be non-empty"));
        }
        if self.queue_len == 0 {
            return Err(Error::config("queue_len must be non-zero"));
        }
        if self.max_src_segments == 0 || self.max_dst_segments == 0 {
            return Err(Error::config("segment limits must be non-zero"));
        }
        if self.srk_slot >= self.aes_keyslots || self.ssk_slot >= self.aes_keyslots {
            return Err(Error::config(format!(
                "reserved slots {}/{} outside a {}-entry key table",
                self.srk_slot, self.ssk_slot, self.aes_keyslots
            )));
        }
        if self.srk_slot == self.ssk_slot {
            return Err(Error::config("SRK and SSK cannot share a slot"));
        }
        if self.rsa_keyslots == 0 {
            return Err(Error::config("at least one RSA key slot is required"));
        }
        Ok(())
    }

    /// Reserved symmetric slots, in ascending order.
    pub fn reserved_aes_slots(&self) -> [u8; 2] {
        let (a, b) = (self.srk_slot, self.ssk_slot);
        if a < b { [a, b] } else { [b, a] }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_reserved_slot_clash() {
        let cfg = EngineConfig {
            ssk_slot: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_reserved_slot_outside_table() {
        let cfg = EngineConfig {
            aes_keyslots: 8,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
