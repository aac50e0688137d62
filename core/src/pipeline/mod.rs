/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Request path from caller to engine and back: queue, stage, encode, submit,
//! and copy results out once the job retires.
pub mod cmdbuf;
pub mod reactor;
pub mod request;
pub mod scheduler;
pub mod stager;

pub use cmdbuf::{CommandBufferPool, SlotLease};
pub use reactor::{CompletionMessage, CompletionReactor, InFlightBatch};
pub use request::{Completion, Operation, Output, PendingRequest};
pub use scheduler::RequestScheduler;
pub use stager::{SegmentLimits, StagedBatch};
