/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! In-process accelerator. Each engine gets its own worker thread that
//! executes command streams in submission order against [`DeviceMemory`],
//! so the host side runs unchanged on machines without the hardware.
pub mod aes;
pub mod bignum;
pub mod machine;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, info, warn};
use tokio::sync::watch;

use crate::connection::{CommandProcessor, CompletionCallback, JobHandle, SubmitMode};
use crate::error::{Error, Result};
use crate::host::dma::DeviceMemory;
use crate::host::utilities::lock;
use crate::se::protocol::EngineId;
pub use machine::KeyStore;
use machine::Machine;

const SYNCPOINT_BASE: u32 = 0x20;
const AES_KEY_SLOTS: usize = 16;
const RSA_KEY_SLOTS: usize = 2;

/// Failure modes that can be forced on one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Submissions are refused until [`SoftAccelerator::clear`].
    RejectSubmit,
    /// The next job hangs the engine. Neither it nor anything queued after it
    /// retires until the fault is cleared.
    Stall,
}

struct Job {
    words: Vec<u32>,
    fence: u64,
    requests: usize,
    callback: Option<CompletionCallback>,
    stall: bool,
}

type Failures = Arc<Mutex<HashMap<u64, String>>>;

struct Lane {
    /// Next fence and the job queue, locked together so fences stay in queue order.
    queue: Mutex<(u64, mpsc::Sender<Job>)>,
    done: watch::Receiver<u64>,
    failures: Failures,
    fault: Mutex<Option<Fault>>,
    hung: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
}

struct Worker {
    engine: EngineId,
    machine: Machine,
    done: watch::Sender<u64>,
    failures: Failures,
    hung: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
}

impl Worker {
    fn run(mut self, jobs: mpsc::Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            if job.stall && !self.hung.swap(true, Ordering::SeqCst) {
                warn!("{}: engine hung at fence {}", self.engine, job.fence);
            }
            if self.hung.load(Ordering::SeqCst) {
                // The callback goes with the job, which abandons its batch. A
                // sync waiter only ever sees its timeout, so nothing is recorded.
                continue;
            }

            let retired = match self.machine.execute(&job.words) {
                Ok(()) => job.requests,
                Err(e) => {
                    error!("{}: job {} failed: {}", self.engine, job.fence, e);
                    if job.callback.is_none() {
                        lock(&self.failures).insert(job.fence, e.to_string());
                    }
                    0
                }
            };
            self.completed.fetch_add(1, Ordering::Relaxed);
            self.done.send_replace(job.fence);
            if let Some(callback) = job.callback {
                callback(retired);
            }
        }
        debug!("{}: lane closed", self.engine);
    }
}

pub struct SoftAccelerator {
    memory: Arc<DeviceMemory>,
    keys: Arc<Mutex<KeyStore>>,
    lanes: Vec<Lane>,
}

impl fmt::Debug for SoftAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftAccelerator")
            .field("lanes", &self.lanes.len())
            .field("mapped", &self.memory.mapped_count())
            .finish()
    }
}

fn boot_seed() -> [u8; 16] {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default()
        .to_le_bytes()
}

impl SoftAccelerator {
    /// Starts one worker per engine. Workers exit once the accelerator is dropped.
    pub fn new(memory: Arc<DeviceMemory>) -> Result<Arc<Self>> {
        let keys = Arc::new(Mutex::new(KeyStore::new(AES_KEY_SLOTS, RSA_KEY_SLOTS)));
        let seed = boot_seed();
        let mut lanes = Vec::with_capacity(EngineId::ALL.len());
        for engine in EngineId::ALL {
            let (tx, rx) = mpsc::channel();
            let (done_tx, done_rx) = watch::channel(0u64);
            let failures: Failures = Arc::default();
            let hung = Arc::new(AtomicBool::new(false));
            let completed = Arc::new(AtomicU64::new(0));
            let worker = Worker {
                engine,
                machine: Machine::new(
                    engine,
                    syncpoint_of(engine),
                    Arc::clone(&memory),
                    Arc::clone(&keys),
                    &seed,
                ),
                done: done_tx,
                failures: Arc::clone(&failures),
                hung: Arc::clone(&hung),
                completed: Arc::clone(&completed),
            };
            thread::Builder::new()
                .name(format!("se-{}", engine))
                .spawn(move || worker.run(rx))
                .map_err(|e| Error::fault(format!("cannot start {} lane: {}", engine, e)))?;
            lanes.push(Lane {
                queue: Mutex::new((0, tx)),
                done: done_rx,
                failures,
                fault: Mutex::new(None),
                hung,
                completed,
            });
        }
        info!("Soft accelerator up with {} engines", lanes.len());
        Ok(Arc::new(Self {
            memory,
            keys,
            lanes,
        }))
    }

    fn lane(&self, engine: EngineId) -> &Lane {
        &self.lanes[engine.index()]
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn inject(&self, engine: EngineId, fault: Fault) {
        warn!("{}: injecting {:?}", engine, fault);
        *lock(&self.lane(engine).fault) = Some(fault);
    }

    /// Drops any injected fault and brings a hung engine back.
    pub fn clear(&self, engine: EngineId) {
        let lane = self.lane(engine);
        *lock(&lane.fault) = None;
        lane.hung.store(false, Ordering::SeqCst);
    }

    /// Writes a key straight into a key table slot, bypassing the command stream.
    pub fn provision_key(&self, slot: u8, key: &[u8]) -> Result<()> {
        lock(&self.keys).provision(slot, key)
    }

    /// Jobs that ran to retirement on `engine`, failed ones included.
    pub fn jobs_completed(&self, engine: EngineId) -> u64 {
        self.lane(engine).completed.load(Ordering::Relaxed)
    }
}

fn syncpoint_of(engine: EngineId) -> u32 {
    SYNCPOINT_BASE + engine.index() as u32
}

#[async_trait::async_trait]
impl CommandProcessor for SoftAccelerator {
    fn syncpoint(&self, engine: EngineId) -> u32 {
        syncpoint_of(engine)
    }

    fn submit(
        &self,
        engine: EngineId,
        words: &[u32],
        requests: usize,
        mode: SubmitMode,
    ) -> Result<JobHandle> {
        let lane = self.lane(engine);
        let stall = {
            let mut fault = lock(&lane.fault);
            match *fault {
                Some(Fault::RejectSubmit) => {
                    warn!("{}: submission of {} words refused", engine, words.len());
                    return Err(Error::fault(format!("{} refused the submission", engine)));
                }
                Some(Fault::Stall) => {
                    *fault = None;
                    true
                }
                None => false,
            }
        };
        let callback = match mode {
            SubmitMode::Sync => None,
            SubmitMode::Async(callback) => Some(callback),
        };

        let mut queue = lock(&lane.queue);
        queue.0 += 1;
        let fence = queue.0;
        queue
            .1
            .send(Job {
                words: words.to_vec(),
                fence,
                requests,
                callback,
                stall,
            })
            .map_err(|_| Error::fault(format!("{} lane has stopped", engine)))?;
        debug!("{}: queued {} words as fence {}", engine, words.len(), fence);
        Ok(JobHandle {
            engine,
            syncpoint: syncpoint_of(engine),
            fence,
        })
    }

    async fn wait(&self, job: &JobHandle, timeout: Duration) -> Result<()> {
        let lane = self.lane(job.engine);
        let mut done = lane.done.clone();
        let outcome = tokio::time::timeout(timeout, done.wait_for(|d| *d >= job.fence))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Err(_) => {
                warn!(
                    "{}: fence {} not reached within {:?}",
                    job.engine, job.fence, timeout
                );
                lock(&lane.failures).remove(&job.fence);
                return Err(Error::HardwareTimeout(timeout));
            }
            Ok(Err(_)) => return Err(Error::fault(format!("{} lane has stopped", job.engine))),
            Ok(Ok(())) => {}
        }
        match lock(&lane.failures).remove(&job.fence) {
            Some(reason) => Err(Error::HardwareFault(reason)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::encoder::incr_syncpt;
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_millis(500);

    fn trailer(accel: &SoftAccelerator, engine: EngineId) -> Vec<u32> {
        let mut words = Vec::new();
        incr_syncpt(&mut words, accel.syncpoint(engine)).unwrap();
        words
    }

    #[tokio::test]
    async fn sync_jobs_retire_in_order() {
        let accel = SoftAccelerator::new(DeviceMemory::new()).unwrap();
        let words = trailer(&accel, EngineId::Sha);
        let a = accel.submit(EngineId::Sha, &words, 0, SubmitMode::Sync).unwrap();
        let b = accel.submit(EngineId::Sha, &words, 0, SubmitMode::Sync).unwrap();
        assert!(b.fence > a.fence);
        accel.wait(&b, WAIT).await.unwrap();
        accel.wait(&a, WAIT).await.unwrap();
        assert_eq!(accel.jobs_completed(EngineId::Sha), 2);
    }

    #[tokio::test]
    async fn broken_stream_reports_fault() {
        let accel = SoftAccelerator::new(DeviceMemory::new()).unwrap();
        let words = trailer(&accel, EngineId::Aes0);
        // Aes1 expects its own syncpoint.
        let job = accel.submit(EngineId::Aes1, &words, 1, SubmitMode::Sync).unwrap();
        assert!(matches!(accel.wait(&job, WAIT).await, Err(Error::HardwareFault(_))));

        let (tx, rx) = oneshot::channel();
        accel
            .submit(
                EngineId::Aes1,
                &words,
                3,
                SubmitMode::Async(Box::new(move |n| {
                    let _ = tx.send(n);
                })),
            )
            .unwrap();
        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rejected_until_cleared() {
        let accel = SoftAccelerator::new(DeviceMemory::new()).unwrap();
        let words = trailer(&accel, EngineId::Rsa);
        accel.inject(EngineId::Rsa, Fault::RejectSubmit);
        assert!(matches!(
            accel.submit(EngineId::Rsa, &words, 0, SubmitMode::Sync),
            Err(Error::HardwareFault(_))
        ));
        // Other engines are unaffected.
        let sha = trailer(&accel, EngineId::Sha);
        accel.submit(EngineId::Sha, &sha, 0, SubmitMode::Sync).unwrap();
        accel.clear(EngineId::Rsa);
        let job = accel.submit(EngineId::Rsa, &words, 0, SubmitMode::Sync).unwrap();
        accel.wait(&job, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn stalled_engine_times_out_and_drops_callbacks() {
        let accel = SoftAccelerator::new(DeviceMemory::new()).unwrap();
        let words = trailer(&accel, EngineId::Aes1);
        accel.inject(EngineId::Aes1, Fault::Stall);
        let job = accel.submit(EngineId::Aes1, &words, 0, SubmitMode::Sync).unwrap();
        let timeout = Duration::from_millis(50);
        assert_eq!(accel.wait(&job, timeout).await, Err(Error::HardwareTimeout(timeout)));

        let (tx, rx) = oneshot::channel::<usize>();
        accel
            .submit(
                EngineId::Aes1,
                &words,
                1,
                SubmitMode::Async(Box::new(move |n| {
                    let _ = tx.send(n);
                })),
            )
            .unwrap();
        // Never called, only dropped.
        assert!(rx.await.is_err());
        // Both jobs went through the hung lane without leaving anything behind.
        let job = accel.submit(EngineId::Aes1, &words, 0, SubmitMode::Sync).unwrap();
        assert_eq!(accel.wait(&job, timeout).await, Err(Error::HardwareTimeout(timeout)));
        assert!(lock(&accel.lane(EngineId::Aes1).failures).is_empty());

        accel.clear(EngineId::Aes1);
        let job = accel.submit(EngineId::Aes1, &words, 0, SubmitMode::Sync).unwrap();
        accel.wait(&job, WAIT).await.unwrap();
    }

    #[test]
    fn provisioning_checks_key_length() {
        let accel = SoftAccelerator::new(DeviceMemory::new()).unwrap();
        accel.provision_key(14, &[0x11; 32]).unwrap();
        assert!(accel.provision_key(14, &[0x11; 20]).is_err());
        assert!(accel.provision_key(40, &[0x11; 16]).is_err());
    }
}
