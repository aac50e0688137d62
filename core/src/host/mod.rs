/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod config;
pub mod device;
pub mod dma;
pub mod keyslot;
pub mod utilities;

pub use config::{BackoffPolicy, EngineConfig};
pub use device::{AesContext, CmacContext, KeySource, RsaContext, SecurityEngine};
pub use dma::{DeviceMemory, DmaBuffer, ScatterList, Segment};
pub use keyslot::{KeySlot, KeySlotAllocator, KeyTable, SlotState};
