/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! The command processor the engines sit behind.
//!
//! The pipeline only ever talks to it through [`CommandProcessor`]: hand over a
//! finished command stream, then either wait for the syncpoint or get called back.
pub mod backend;

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::se::protocol::EngineId;

pub use backend::{Fault, SoftAccelerator};

/// Called once the job retired, with the number of requests it completed.
pub type CompletionCallback = Box<dyn FnOnce(usize) + Send + 'static>;

pub enum SubmitMode {
    /// The submitter will [`CommandProcessor::wait`] on the returned handle.
    Sync,
    /// The processor invokes the callback from its own context when the job retires.
    /// Dropping the callback without calling it means the job was abandoned.
    Async(CompletionCallback),
}

impl fmt::Debug for SubmitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitMode::Sync => f.write_str("Sync"),
            SubmitMode::Async(_) => f.write_str("Async"),
        }
    }
}

/// A submitted job: done once `syncpoint` on `engine` reaches `fence`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobHandle {
    pub engine: EngineId,
    pub syncpoint: u32,
    pub fence: u64,
}

#[async_trait::async_trait]
pub trait CommandProcessor: Send + Sync + fmt::Debug {
    /// Syncpoint id the trailer of every submission to `engine` must increment.
    fn syncpoint(&self, engine: EngineId) -> u32;

    /// Queues `words` on `engine`'s channel. `requests` is reported back to the
    /// completion callback.
    fn submit(
        &self,
        engine: EngineId,
        words: &[u32],
        requests: usize,
        mode: SubmitMode,
    ) -> Result<JobHandle>;

    /// Waits until `job` retired, or fails with [`crate::Error::HardwareTimeout`].
    async fn wait(&self, job: &JobHandle, timeout: Duration) -> Result<()>;
}
