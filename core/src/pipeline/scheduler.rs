/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, warn};
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::{CommandProcessor, CompletionCallback, SubmitMode};
use crate::error::{Error, Result};
use crate::host::config::EngineConfig;
use crate::host::dma::{DeviceMemory, LinkedListDescriptor};
use crate::host::utilities::lock;
use crate::pipeline::cmdbuf::{CommandBufferPool, SlotLease};
use crate::pipeline::reactor::{CompletionMessage, InFlightBatch};
use crate::pipeline::request::{Operation, PendingRequest};
use crate::pipeline::stager::{SegmentLimits, StagedBatch, StagedRequest, stage};
use crate::se::encoder::aes::encode_cipher;
use crate::se::encoder::cmac::encode_cmac;
use crate::se::encoder::rsa::encode_rsa_op;
use crate::se::encoder::sha::encode_digest;
use crate::se::encoder::{CommandSink, incr_syncpt};
use crate::se::protocol::EngineId;

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingRequest>,
    backlog: VecDeque<PendingRequest>,
    draining: bool,
}

struct Inner {
    engine: EngineId,
    max_tasks: usize,
    queue_len: usize,
    limits: SegmentLimits,
    wait_timeout: Duration,
    pool: Arc<CommandBufferPool>,
    memory: Arc<DeviceMemory>,
    processor: Arc<dyn CommandProcessor>,
    completions: UnboundedSender<CompletionMessage>,
    runtime: Handle,
    state: Mutex<QueueState>,
}

/// Queue and single drain worker of one engine instance.
#[derive(Clone)]
pub struct RequestScheduler {
    inner: Arc<Inner>,
}

impl fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (pending, backlog) = self.queued();
        f.debug_struct("RequestScheduler")
            .field("engine", &self.inner.engine)
            .field("pending", &pending)
            .field("backlog", &backlog)
            .field("draining", &self.is_draining())
            .finish()
    }
}

fn first(descs: &[LinkedListDescriptor]) -> Result<LinkedListDescriptor> {
    descs
        .first()
        .copied()
        .ok_or_else(|| Error::Internal("request staged without descriptors".into()))
}

/// Encodes one staged request.
fn encode_request<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    request: &PendingRequest,
    staged: &StagedRequest,
) -> Result<usize> {
    match &request.op {
        Operation::Cipher {
            mode,
            direction,
            key,
            iv,
        } => encode_cipher(sink, engine, *mode, *direction, *key, iv, &staged.src, &staged.dst),
        Operation::Cmac { key, .. } => {
            let plan = staged
                .cmac
                .ok_or_else(|| Error::Internal("CMAC request staged without a plan".into()))?;
            let payload = LinkedListDescriptor {
                addr: first(&staged.src)?.addr,
                len: staged.src.iter().map(|d| d.len).sum(),
            };
            encode_cmac(sink, engine, *key, &plan, payload, first(&staged.dst)?)
        }
        Operation::Digest { alg } => {
            encode_digest(sink, engine, *alg, &staged.src, first(&staged.dst)?)
        }
        Operation::Rsa {
            slot,
            mod_len,
            exp_len,
        } => encode_rsa_op(
            sink,
            engine,
            *slot,
            *mod_len,
            *exp_len,
            first(&staged.src)?,
            first(&staged.dst)?,
        ),
    }
}

impl RequestScheduler {
    /// Needs to run inside a tokio runtime; the drain worker is spawned on it.
    pub fn new(
        engine: EngineId,
        config: &EngineConfig,
        memory: Arc<DeviceMemory>,
        processor: Arc<dyn CommandProcessor>,
        completions: UnboundedSender<CompletionMessage>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::config(format!("no async runtime for {}: {}", engine, e)))?;
        let pool = CommandBufferPool::new(
            config.cmdbuf_slots,
            config.cmdbuf_words,
            config.claim_backoff,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                engine,
                max_tasks: config.max_tasks_per_submit.max(1),
                queue_len: config.queue_len,
                limits: SegmentLimits {
                    max_src: config.max_src_segments,
                    max_dst: config.max_dst_segments,
                },
                wait_timeout: config.wait_timeout,
                pool,
                memory,
                processor,
                completions,
                runtime,
                state: Mutex::new(QueueState::default()),
            }),
        })
    }

    pub fn engine(&self) -> EngineId {
        self.inner.engine
    }

    pub fn pool(&self) -> &Arc<CommandBufferPool> {
        &self.inner.pool
    }

    /// Requests waiting in the queue and in the backlog.
    pub fn queued(&self) -> (usize, usize) {
        let state = lock(&self.inner.state);
        (state.pending.len(), state.backlog.len())
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.inner.state).draining
    }

    /// Queues `request` and wakes the worker if it is idle. Requests this
    /// engine cannot run are failed right away.
    pub fn enqueue(&self, mut request: PendingRequest) {
        if let Err(err) = self.inner.engine.check(request.op.mode()) {
            request.fail(err);
            return;
        }
        let start_worker = {
            let mut state = lock(&self.inner.state);
            if state.pending.len() >= self.inner.queue_len {
                warn!(
                    "{}: queue full ({}), request backlogged",
                    self.inner.engine, self.inner.queue_len
                );
                state.backlog.push_back(request);
            } else {
                state.pending.push_back(request);
            }
            !std::mem::replace(&mut state.draining, true)
        };
        if start_worker {
            let inner = Arc::clone(&self.inner);
            self.inner.runtime.spawn(inner.drain());
        }
    }

    /// Runs an internal command stream and waits for it. The slot is freed on
    /// every path, including timeout.
    pub async fn run_sync<F>(&self, encode: F) -> Result<()>
    where
        F: FnOnce(&mut dyn CommandSink) -> Result<usize>,
    {
        let inner = &self.inner;
        let lease = inner.pool.claim().await?;
        let words = {
            let mut writer = lease.writer();
            encode(&mut writer)?;
            incr_syncpt(&mut writer, inner.processor.syncpoint(inner.engine))?;
            writer.words()
        };
        let job = inner
            .processor
            .submit(inner.engine, &words, 1, SubmitMode::Sync)?;
        debug!(
            "{}: sync job {} words on slot {}, fence {}",
            inner.engine,
            words.len(),
            lease.index(),
            job.fence
        );
        let result = inner.processor.wait(&job, inner.wait_timeout).await;
        drop(lease);
        if let Err(err) = &result {
            error!("{}: sync job failed: {}", inner.engine, err);
        }
        result
    }
}

impl Inner {
    async fn drain(self: Arc<Self>) {
        loop {
            let (backlogged, batch) = {
                let mut state = lock(&self.state);
                if state.pending.is_empty() && state.backlog.is_empty() {
                    state.draining = false;
                    return;
                }
                let backlogged = state.backlog.pop_front();
                let take = state.pending.len().min(self.max_tasks);
                let batch: Vec<_> = state.pending.drain(..take).collect();
                (backlogged, batch)
            };
            if let Some(mut request) = backlogged {
                request.fail(Error::InProgress);
            }
            if !batch.is_empty() {
                self.dispatch(batch).await;
            }
        }
    }

    async fn prepare(
        &self,
        requests: &[PendingRequest],
    ) -> Result<(StagedBatch, SlotLease, Vec<u32>)> {
        let staged = stage(&self.memory, requests, self.limits)?;
        let lease = self.pool.claim().await?;
        let words = {
            let mut writer = lease.writer();
            for (request, staged) in requests.iter().zip(staged.requests()) {
                encode_request(&mut writer, self.engine, request, staged)?;
            }
            incr_syncpt(&mut writer, self.processor.syncpoint(self.engine))?;
            writer.words()
        };
        Ok((staged, lease, words))
    }

    async fn dispatch(&self, mut requests: Vec<PendingRequest>) {
        let count = requests.len();
        let (staged, lease, words) = match self.prepare(&requests).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!("{}: batch of {} failed before submission: {}", self.engine, count, err);
                for request in &mut requests {
                    request.fail(err.clone());
                }
                return;
            }
        };
        debug!(
            "{}: submitting {} requests, {} words on slot {}",
            self.engine,
            count,
            words.len(),
            lease.index()
        );

        let batch = InFlightBatch::new(self.engine, requests, Some(staged), lease);
        let parked = Arc::new(Mutex::new(Some(batch)));
        let for_callback = Arc::clone(&parked);
        let completions = self.completions.clone();
        let callback: CompletionCallback = Box::new(move |completed| {
            let Some(batch) = lock(&for_callback).take() else {
                return;
            };
            if let Err(unsent) = completions.send(CompletionMessage { batch, completed }) {
                // Dropping the batch fails its requests.
                error!("Completion reactor is gone");
                drop(unsent);
            }
        });

        if let Err(err) = self
            .processor
            .submit(self.engine, &words, count, SubmitMode::Async(callback))
        {
            error!("{}: submission rejected: {}", self.engine, err);
            let batch = lock(&parked).take();
            if let Some(batch) = batch {
                batch.fail(err);
            }
        }
    }
}
