/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;

use log::{debug, error};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::pipeline::cmdbuf::SlotLease;
use crate::pipeline::request::{Operation, Output, PendingRequest};
use crate::pipeline::stager::{StagedBatch, write_back};
use crate::se::protocol::EngineId;

/// A batch handed to the command processor. Owns everything the hardware may
/// still touch until the reactor (or a failure path) takes it apart.
///
/// Dropping it before completion fails every request as abandoned.
pub struct InFlightBatch {
    engine: EngineId,
    requests: Vec<PendingRequest>,
    staged: Option<StagedBatch>,
    lease: Option<SlotLease>,
    finished: bool,
}

impl fmt::Debug for InFlightBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightBatch")
            .field("engine", &self.engine)
            .field("requests", &self.requests.len())
            .field("slot", &self.slot())
            .finish()
    }
}

impl InFlightBatch {
    pub fn new(
        engine: EngineId,
        requests: Vec<PendingRequest>,
        staged: Option<StagedBatch>,
        lease: SlotLease,
    ) -> Self {
        Self {
            engine,
            requests,
            staged,
            lease: Some(lease),
            finished: false,
        }
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn slot(&self) -> Option<usize> {
        self.lease.as_ref().map(SlotLease::index)
    }

    /// Unmaps staged memory, then frees the command buffer slot.
    fn release(&mut self) {
        if let Some(mut staged) = self.staged.take() {
            staged.unstage();
        }
        self.lease = None;
    }

    /// Fails every request with `err` after releasing the batch's resources.
    pub fn fail(mut self, err: Error) {
        self.finished = true;
        self.release();
        for request in &mut self.requests {
            request.fail(err.clone());
        }
    }
}

impl Drop for InFlightBatch {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                "{}: batch of {} abandoned by the command processor",
                self.engine,
                self.requests.len()
            );
            self.release();
            for request in &mut self.requests {
                request.fail(Error::fault("job abandoned before completion"));
            }
        }
    }
}

/// What the command processor's callback posts once a job retired.
#[derive(Debug)]
pub struct CompletionMessage {
    pub batch: InFlightBatch,
    pub completed: usize,
}

pub fn channel() -> (UnboundedSender<CompletionMessage>, UnboundedReceiver<CompletionMessage>) {
    mpsc::unbounded_channel()
}

fn collect(request: &mut PendingRequest, staged: Option<&StagedBatch>, index: usize) -> Result<Output> {
    let bytes = match staged {
        Some(staged) => staged.output(index)?,
        None => None,
    };
    let cipher = matches!(request.op, Operation::Cipher { .. });
    match (cipher, bytes) {
        (true, Some(bytes)) => write_back(request, &bytes).map(Output::Data),
        // Zero-copy: the engine already wrote the caller's buffers.
        (true, None) => Ok(Output::Data(match request.dst.take() {
            Some(dst) => dst,
            None => std::mem::take(&mut request.src),
        })),
        (false, Some(bytes)) => {
            if matches!(request.op, Operation::Digest { .. } | Operation::Cmac { .. }) {
                debug!("{}: {}", request.op.mode(), hex::encode(&bytes));
            }
            Ok(Output::Digest(bytes))
        }
        (false, None) => Err(Error::Internal(format!(
            "{} result was never staged",
            request.op.mode()
        ))),
    }
}

/// Finishes one retired batch: copy results out, release the mapping and the
/// command buffer slot, then resolve each request in order.
pub fn complete(message: CompletionMessage) {
    let CompletionMessage {
        mut batch,
        completed,
    } = message;
    batch.finished = true;

    let claimed = batch.lease.as_ref().is_some_and(SlotLease::is_claimed);
    if !claimed {
        error!(
            "{}: completion for slot {:?} which is not claimed",
            batch.engine,
            batch.slot()
        );
        debug_assert!(claimed, "completion for an unclaimed command buffer slot");
        batch.release();
        for request in &mut batch.requests {
            request.fail(Error::Internal("completion for an unclaimed slot".into()));
        }
        return;
    }

    if batch.requests.is_empty() {
        debug!("{}: empty batch retired, releasing only", batch.engine);
        batch.release();
        return;
    }

    if completed != batch.requests.len() {
        error!(
            "{}: engine completed {} of {} requests",
            batch.engine,
            completed,
            batch.requests.len()
        );
        let err = Error::fault(format!(
            "engine completed {} of {} requests",
            completed,
            batch.requests.len()
        ));
        batch.release();
        for request in &mut batch.requests {
            request.fail(err.clone());
        }
        return;
    }

    let staged = batch.staged.take();
    let results: Vec<_> = batch
        .requests
        .iter_mut()
        .enumerate()
        .map(|(i, request)| collect(request, staged.as_ref(), i))
        .collect();
    if let Some(mut staged) = staged {
        staged.unstage();
    }
    batch.release();
    debug!(
        "{}: batch of {} retired",
        batch.engine,
        batch.requests.len()
    );
    for (request, result) in batch.requests.iter_mut().zip(results) {
        request.resolve(result);
    }
}

/// Consumer task for completion messages.
#[derive(Debug)]
pub struct CompletionReactor {
    handle: JoinHandle<()>,
}

impl CompletionReactor {
    pub fn spawn(mut rx: UnboundedReceiver<CompletionMessage>) -> Self {
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                complete(message);
            }
            debug!("Completion channel closed, reactor stopping");
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CompletionReactor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::config::BackoffPolicy;
    use crate::host::dma::{DeviceMemory, ScatterList};
    use crate::pipeline::cmdbuf::CommandBufferPool;
    use crate::pipeline::request::Completion;
    use crate::pipeline::stager::{SegmentLimits, stage};
    use crate::se::protocol::ShaAlgorithm;
    use std::sync::Arc;

    const LIMITS: SegmentLimits = SegmentLimits {
        max_src: 8,
        max_dst: 8,
    };

    fn digest(msg: &[u8]) -> (PendingRequest, Completion) {
        PendingRequest::new(
            Operation::Digest {
                alg: ShaAlgorithm::Sha1,
            },
            ScatterList::from(msg),
            None,
        )
    }

    fn setup() -> (Arc<DeviceMemory>, Arc<CommandBufferPool>) {
        (
            DeviceMemory::new(),
            CommandBufferPool::new(2, 16, BackoffPolicy::immediate()),
        )
    }

    #[tokio::test]
    async fn synthetic_completion_copies_results_and_releases() {
        let (mem, pool) = setup();
        let (req, completion) = digest(b"abc");
        let staged = stage(&mem, std::slice::from_ref(&req), LIMITS).unwrap();
        // Pretend the engine wrote the digest.
        let out = staged.requests()[0].dst[0];
        mem.write(out.addr, &[0x5a; 20]).unwrap();
        let batch = InFlightBatch::new(EngineId::Sha, vec![req], Some(staged), pool.try_claim().unwrap());

        let (tx, rx) = channel();
        let _reactor = CompletionReactor::spawn(rx);
        tx.send(CompletionMessage {
            batch,
            completed: 1,
        })
        .unwrap();
        assert_eq!(completion.await.unwrap().into_bytes(), vec![0x5a; 20]);
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(mem.mapped_count(), 0);
    }

    #[test]
    fn empty_batch_only_releases() {
        let (_mem, pool) = setup();
        let batch = InFlightBatch::new(EngineId::Aes1, Vec::new(), None, pool.try_claim().unwrap());
        assert_eq!(pool.busy_count(), 1);
        complete(CompletionMessage {
            batch,
            completed: 0,
        });
        assert_eq!(pool.busy_count(), 0);
    }

    #[tokio::test]
    async fn short_completion_fails_the_batch() {
        let (mem, pool) = setup();
        let (a, ca) = digest(b"a");
        let (b, cb) = digest(b"b");
        let requests = vec![a, b];
        let staged = stage(&mem, &requests, LIMITS).unwrap();
        let batch = InFlightBatch::new(EngineId::Sha, requests, Some(staged), pool.try_claim().unwrap());
        complete(CompletionMessage {
            batch,
            completed: 1,
        });
        assert!(matches!(ca.await, Err(Error::HardwareFault(_))));
        assert!(matches!(cb.await, Err(Error::HardwareFault(_))));
        assert_eq!(mem.mapped_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_batch_fails_on_drop() {
        let (mem, pool) = setup();
        let (req, completion) = digest(b"abc");
        let staged = stage(&mem, std::slice::from_ref(&req), LIMITS).unwrap();
        let batch = InFlightBatch::new(EngineId::Sha, vec![req], Some(staged), pool.try_claim().unwrap());
        drop(batch);
        assert!(matches!(completion.await, Err(Error::HardwareFault(_))));
        assert_eq!(pool.busy_count(), 0);
        assert_eq!(mem.mapped_count(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "unclaimed command buffer slot")]
    fn completion_for_released_slot_is_an_invariant_violation() {
        let (_mem, pool) = setup();
        let lease = pool.try_claim().unwrap();
        pool.release(lease.index());
        let batch = InFlightBatch::new(EngineId::Aes1, Vec::new(), None, lease);
        complete(CompletionMessage {
            batch,
            completed: 0,
        });
    }
}
