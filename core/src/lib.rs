/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod connection;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod se;

pub use connection::{CommandProcessor, Fault, SoftAccelerator};
pub use error::{Error, Exhaustion, Result};
pub use host::{
    AesContext, BackoffPolicy, CmacContext, DeviceMemory, EngineConfig, KeySource, RsaContext,
    ScatterList, SecurityEngine,
};
pub use pipeline::{Completion, Output};
pub use se::{CipherMode, Direction, EngineId, IvPolicy, ShaAlgorithm};
