/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod encoder;
pub mod protocol;
pub mod registry;
pub mod regs;

pub use protocol::{
    CipherMode, Direction, EngineId, IvPolicy, KeyLength, KeyRef, OpMode, ShaAlgorithm,
};
