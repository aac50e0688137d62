/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use thiserror::Error;

/// Scarce resources that can run out under load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Exhaustion {
    /// Every non-reserved key slot is owned by some context.
    #[error("no free key slot")]
    NoFreeKeySlot,
    /// Every command buffer slot stayed busy for the whole backoff window.
    #[error("no free command buffer slot")]
    CommandBufferBusy,
    /// A request carries more scatter-gather segments than the engine can describe.
    #[error("too many scatter-gather segments ({count} > {max})")]
    TooManySegments { count: usize, max: usize },
    /// Encoded batch does not fit in one command buffer slot.
    #[error("command buffer full ({capacity} words)")]
    CommandBufferFull { capacity: usize },
}

/// Errors returned by the security engine pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A bounded resource is exhausted. Retry later.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] Exhaustion),
    /// The request can never succeed as issued (bad key length, wrong engine...).
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The command processor did not reach the completion target in time.
    #[error("hardware timeout after {0:?}")]
    HardwareTimeout(Duration),
    /// The command processor rejected or abandoned a submission.
    #[error("hardware fault: {0}")]
    HardwareFault(String),
    /// The request was parked in the backlog and must be resubmitted.
    #[error("request backlogged, resubmit")]
    InProgress,
    /// Broken contract between the scheduler and the command processor.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn fault(msg: impl Into<String>) -> Self {
        Error::HardwareFault(msg.into())
    }

    /// Whether resubmitting the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::InProgress)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
