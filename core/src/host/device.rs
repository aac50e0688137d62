/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::connection::{CommandProcessor, SoftAccelerator};
use crate::error::{Error, Result};
use crate::host::config::EngineConfig;
use crate::host::dma::{DeviceMemory, DmaBuffer, ScatterList};
use crate::host::keyslot::{KeySlot, KeySlotAllocator, KeyTable, SlotState};
use crate::host::utilities::lock;
use crate::pipeline::reactor::{self, CompletionReactor};
use crate::pipeline::{Completion, Operation, Output, PendingRequest, RequestScheduler};
use crate::se::encoder::aes::{KeyTarget, encode_cipher, load_key};
use crate::se::encoder::cmac::derive_subkeys;
use crate::se::encoder::drbg::{DRBG_BLOCKS_PER_SUBMIT, encode_generate};
use crate::se::encoder::rsa::{encode_set_key, padded_len, validate_input, validate_key};
use crate::se::encoder::sha::zero_length_digest;
use crate::se::encoder::CmacSubkeys;
use crate::se::protocol::{
    AES_BLOCK_SIZE, CipherMode, DRBG_BLOCK_SIZE, Direction, EngineId, IvPolicy, KeyLength,
    KeyRef, ShaAlgorithm,
};
use crate::se::regs::RngMode;

/// Where the key of an AES or CMAC context comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Raw key bytes (16, 24 or 32), loaded into a slot of the context's own.
    User(Vec<u8>),
    /// The secure storage key, already resident in its reserved slot.
    SecureStorage,
    /// A slot the platform filled before boot.
    Provisioned { slot: u8, key_len: usize },
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::User(key) => write!(f, "User({} bytes)", key.len()),
            KeySource::SecureStorage => f.write_str("SecureStorage"),
            KeySource::Provisioned { slot, key_len } => {
                write!(f, "Provisioned(slot {}, {} bytes)", slot, key_len)
            }
        }
    }
}

/// SSK width on this engine.
const SSK_KEY_LENGTH: KeyLength = KeyLength::Aes128;

#[derive(Debug)]
enum SlotBinding {
    /// Allocated for a user key.
    Owned(Arc<KeySlot>),
    /// A platform-filled slot claimed by this context. Never overwritten.
    Provisioned(Arc<KeySlot>),
    /// A reserved slot, shared and never released.
    Fixed(u8),
}

impl SlotBinding {
    fn id(&self) -> u8 {
        match self {
            SlotBinding::Owned(slot) | SlotBinding::Provisioned(slot) => slot.id(),
            SlotBinding::Fixed(id) => *id,
        }
    }

    fn pin(&self) -> Option<Arc<KeySlot>> {
        match self {
            SlotBinding::Owned(slot) | SlotBinding::Provisioned(slot) => Some(Arc::clone(slot)),
            SlotBinding::Fixed(_) => None,
        }
    }
}

/// A slot can take a new key in place only when no queued or in-flight
/// request still refers to it.
fn reusable(slot: &Arc<KeySlot>) -> bool {
    Arc::strong_count(slot) == 1
}

/// Symmetric key state of one caller. Dropping it frees the slot it owns.
#[derive(Debug, Default)]
pub struct AesContext {
    binding: Option<(SlotBinding, KeyLength)>,
}

impl AesContext {
    pub fn key(&self) -> Result<KeyRef> {
        self.binding
            .as_ref()
            .map(|(binding, len)| KeyRef {
                slot: binding.id(),
                len: *len,
            })
            .ok_or_else(|| Error::config("no key set on this context"))
    }

    pub fn slot(&self) -> Option<u8> {
        self.binding.as_ref().map(|(binding, _)| binding.id())
    }

    fn pin(&self) -> Option<Arc<KeySlot>> {
        self.binding.as_ref().and_then(|(binding, _)| binding.pin())
    }
}

#[derive(Debug, Default)]
pub struct CmacContext {
    aes: AesContext,
    subkeys: Option<CmacSubkeys>,
}

impl CmacContext {
    pub fn slot(&self) -> Option<u8> {
        self.aes.slot()
    }

    pub fn subkeys(&self) -> Option<&CmacSubkeys> {
        self.subkeys.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct RsaContext {
    slot: Option<Arc<KeySlot>>,
    mod_len: usize,
    exp_len: usize,
}

impl RsaContext {
    pub fn slot(&self) -> Option<u8> {
        self.slot.as_ref().map(|slot| slot.id())
    }

    pub fn modulus_len(&self) -> usize {
        self.mod_len
    }
}

/// Forced-reseed bookkeeping for the DRBG.
#[derive(Debug)]
struct DrbgState {
    remaining: u32,
    generation: u64,
}

/// The four engine instances behind one command processor.
pub struct SecurityEngine {
    config: EngineConfig,
    memory: Arc<DeviceMemory>,
    processor: Arc<dyn CommandProcessor>,
    schedulers: Vec<RequestScheduler>,
    aes_slots: Arc<KeySlotAllocator>,
    rsa_slots: Arc<KeySlotAllocator>,
    drbg: Mutex<DrbgState>,
    reactor: CompletionReactor,
}

impl fmt::Debug for SecurityEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityEngine")
            .field("processor", &self.processor)
            .field("schedulers", &self.schedulers)
            .field("aes_slots", &self.aes_slots)
            .field("rsa_slots", &self.rsa_slots)
            .finish()
    }
}

impl SecurityEngine {
    /// Brings the engines up. Must be called from within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        memory: Arc<DeviceMemory>,
        processor: Arc<dyn CommandProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = reactor::channel();
        let schedulers = EngineId::ALL
            .iter()
            .map(|engine| {
                RequestScheduler::new(
                    *engine,
                    &config,
                    Arc::clone(&memory),
                    Arc::clone(&processor),
                    tx.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let aes_slots = Arc::new(KeySlotAllocator::new(
            KeyTable::Symmetric,
            config.aes_keyslots,
            &config.reserved_aes_slots(),
        ));
        let rsa_slots = Arc::new(KeySlotAllocator::new(
            KeyTable::Asymmetric,
            config.rsa_keyslots,
            &[],
        ));
        let reactor = CompletionReactor::spawn(rx);
        info!(
            "Security engine up: {} engines, {} AES / {} RSA key slots, batches of up to {}",
            schedulers.len(),
            aes_slots.available().len(),
            rsa_slots.count(),
            config.max_tasks_per_submit
        );
        Ok(Self {
            drbg: Mutex::new(DrbgState {
                remaining: config.drbg_reseed_interval,
                generation: 0,
            }),
            config,
            memory,
            processor,
            schedulers,
            aes_slots,
            rsa_slots,
            reactor,
        })
    }

    /// Engine backed by a fresh [`SoftAccelerator`].
    pub fn soft(config: EngineConfig) -> Result<(Self, Arc<SoftAccelerator>)> {
        let memory = DeviceMemory::new();
        let accel = SoftAccelerator::new(Arc::clone(&memory))?;
        let processor: Arc<dyn CommandProcessor> = accel.clone();
        Ok((Self::new(config, memory, processor)?, accel))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.memory
    }

    pub fn scheduler(&self, engine: EngineId) -> &RequestScheduler {
        &self.schedulers[engine.index()]
    }

    pub fn aes_key_slots(&self) -> &Arc<KeySlotAllocator> {
        &self.aes_slots
    }

    pub fn rsa_key_slots(&self) -> &Arc<KeySlotAllocator> {
        &self.rsa_slots
    }

    pub fn is_running(&self) -> bool {
        self.reactor.is_running()
    }

    /// Command buffer slots currently claimed, summed over all engines.
    pub fn busy_slots(&self) -> usize {
        self.schedulers.iter().map(|s| s.pool().busy_count()).sum()
    }

    fn enqueue(
        &self,
        engine: EngineId,
        op: Operation,
        src: ScatterList,
        key_slot: Option<Arc<KeySlot>>,
    ) -> Completion {
        let (request, completion) = PendingRequest::new(op, src, None);
        self.scheduler(engine).enqueue(request.pin_key_slot(key_slot));
        completion
    }

    pub fn aes_context(&self) -> AesContext {
        AesContext::default()
    }

    pub fn cmac_context(&self) -> CmacContext {
        CmacContext::default()
    }

    pub fn rsa_context(&self) -> RsaContext {
        RsaContext::default()
    }

    /// Binds `source` to `ctx`. A user key reuses the slot the context already
    /// owns when no outstanding request still uses it, otherwise a new one is
    /// allocated and the old slot is freed once those requests resolve.
    pub async fn set_aes_key(&self, ctx: &mut AesContext, source: KeySource) -> Result<()> {
        let binding = match source {
            KeySource::User(key) => {
                let len = KeyLength::from_len(key.len())?;
                let slot = match ctx.binding.take() {
                    Some((SlotBinding::Owned(slot), _)) if reusable(&slot) => slot,
                    previous => match self.aes_slots.allocate() {
                        Ok(slot) => Arc::new(slot),
                        Err(err) => {
                            ctx.binding = previous;
                            return Err(err);
                        }
                    },
                };
                let id = slot.id();
                let ssk = self.config.ssk_slot;
                self.scheduler(EngineId::Aes1)
                    .run_sync(|sink| load_key(sink, EngineId::Aes1, id, KeyTarget::Key, &key, ssk))
                    .await?;
                debug!("{}-byte key loaded into slot {}", key.len(), id);
                (SlotBinding::Owned(slot), len)
            }
            KeySource::SecureStorage => (SlotBinding::Fixed(self.config.ssk_slot), SSK_KEY_LENGTH),
            KeySource::Provisioned { slot, key_len } => {
                let len = KeyLength::from_len(key_len)?;
                match ctx.binding.take() {
                    Some((SlotBinding::Provisioned(held), _)) if held.id() == slot => {
                        (SlotBinding::Provisioned(held), len)
                    }
                    previous => {
                        let binding = if self.aes_slots.state(slot) == Some(SlotState::Reserved) {
                            Ok(SlotBinding::Fixed(slot))
                        } else {
                            self.aes_slots
                                .claim(slot)
                                .map(|claimed| SlotBinding::Provisioned(Arc::new(claimed)))
                        };
                        match binding {
                            Ok(binding) => (binding, len),
                            Err(err) => {
                                ctx.binding = previous;
                                return Err(err);
                            }
                        }
                    }
                }
            }
        };
        // Replacing the binding releases any slot the context owned before.
        ctx.binding = Some(binding);
        Ok(())
    }

    /// Queues one cipher operation. The output has the layout of `src`.
    pub fn submit_cipher(
        &self,
        ctx: &AesContext,
        mode: CipherMode,
        direction: Direction,
        iv: IvPolicy,
        src: ScatterList,
    ) -> Completion {
        let key = match ctx.key() {
            Ok(key) => key,
            Err(err) => return Completion::ready(Err(err)),
        };
        if src.is_empty() || src.len() % AES_BLOCK_SIZE != 0 {
            return Completion::ready(Err(Error::config(format!(
                "{} needs a non-zero multiple of {} bytes, got {}",
                mode,
                AES_BLOCK_SIZE,
                src.len()
            ))));
        }
        let op = Operation::Cipher {
            mode,
            direction,
            key,
            iv,
        };
        self.enqueue(EngineId::Aes1, op, src, ctx.pin())
    }

    pub async fn encrypt(
        &self,
        ctx: &AesContext,
        mode: CipherMode,
        iv: IvPolicy,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.submit_cipher(ctx, mode, Direction::Encrypt, iv, data.into())
            .await
            .map(Output::into_bytes)
    }

    pub async fn decrypt(
        &self,
        ctx: &AesContext,
        mode: CipherMode,
        iv: IvPolicy,
        data: &[u8],
    ) -> Result<Vec<u8>> {
        self.submit_cipher(ctx, mode, Direction::Decrypt, iv, data.into())
            .await
            .map(Output::into_bytes)
    }

    /// Binds the key, then derives K1/K2 from the encryption of the zero block.
    pub async fn set_cmac_key(&self, ctx: &mut CmacContext, source: KeySource) -> Result<()> {
        self.set_aes_key(&mut ctx.aes, source).await?;
        ctx.subkeys = None;
        let key = ctx.aes.key()?;

        let block = self.memory.alloc(AES_BLOCK_SIZE)?;
        let desc = block.descriptor();
        let ran = self
            .scheduler(EngineId::Aes1)
            .run_sync(|sink| {
                encode_cipher(
                    sink,
                    EngineId::Aes1,
                    CipherMode::Ecb,
                    Direction::Encrypt,
                    key,
                    &IvPolicy::Chained,
                    &[desc],
                    &[desc],
                )
            })
            .await;
        let l = block.to_vec();
        self.memory.unmap(&block);
        ran?;

        let mut zero_enc = [0u8; AES_BLOCK_SIZE];
        zero_enc.copy_from_slice(&l[..AES_BLOCK_SIZE]);
        ctx.subkeys = Some(derive_subkeys(&zero_enc));
        Ok(())
    }

    pub fn submit_cmac(&self, ctx: &CmacContext, msg: ScatterList) -> Completion {
        let (key, subkeys) = match (ctx.aes.key(), ctx.subkeys) {
            (Ok(key), Some(subkeys)) => (key, subkeys),
            (Err(err), _) => return Completion::ready(Err(err)),
            (Ok(_), None) => {
                return Completion::ready(Err(Error::config("CMAC subkeys were never derived")));
            }
        };
        self.enqueue(EngineId::Aes1, Operation::Cmac { key, subkeys }, msg, ctx.aes.pin())
    }

    pub async fn cmac(&self, ctx: &CmacContext, msg: &[u8]) -> Result<Vec<u8>> {
        self.submit_cmac(ctx, msg.into()).await.map(Output::into_bytes)
    }

    /// Queues a digest. The empty message never reaches the engine.
    pub fn submit_digest(&self, alg: ShaAlgorithm, msg: ScatterList) -> Completion {
        if msg.is_empty() {
            let digest = zero_length_digest(alg);
            debug!("{}: zero-length message, {} from table", alg.name(), hex::encode(digest));
            return Completion::ready(Ok(Output::Digest(digest.to_vec())));
        }
        self.enqueue(EngineId::Sha, Operation::Digest { alg }, msg, None)
    }

    pub async fn digest(&self, alg: ShaAlgorithm, msg: &[u8]) -> Result<Vec<u8>> {
        self.submit_digest(alg, msg.into()).await.map(Output::into_bytes)
    }

    /// Loads a big-endian modulus and exponent into the context's RSA slot.
    pub async fn set_rsa_key(
        &self,
        ctx: &mut RsaContext,
        modulus: &[u8],
        exponent: &[u8],
    ) -> Result<()> {
        let exp_len = padded_len(exponent.len());
        validate_key(modulus.len(), exp_len)?;
        let slot = match ctx.slot.take() {
            Some(slot) if reusable(&slot) => slot,
            previous => match self.rsa_slots.allocate() {
                Ok(slot) => Arc::new(slot),
                Err(err) => {
                    ctx.slot = previous;
                    return Err(err);
                }
            },
        };
        let id = slot.id();
        ctx.mod_len = 0;
        self.scheduler(EngineId::Rsa)
            .run_sync(|sink| encode_set_key(sink, EngineId::Rsa, id, modulus, exponent))
            .await?;
        debug!("RSA-{} key loaded into slot {}", modulus.len() * 8, id);
        ctx.slot = Some(slot);
        ctx.mod_len = modulus.len();
        ctx.exp_len = exp_len;
        Ok(())
    }

    pub fn submit_rsa(&self, ctx: &RsaContext, input: &[u8]) -> Completion {
        let Some(slot) = ctx.slot() else {
            return Completion::ready(Err(Error::config("no RSA key set on this context")));
        };
        if let Err(err) = validate_input(ctx.mod_len, input.len()) {
            return Completion::ready(Err(err));
        }
        let op = Operation::Rsa {
            slot,
            mod_len: ctx.mod_len,
            exp_len: ctx.exp_len,
        };
        self.enqueue(EngineId::Rsa, op, input.into(), ctx.slot.clone())
    }

    pub async fn rsa(&self, ctx: &RsaContext, input: &[u8]) -> Result<Vec<u8>> {
        self.submit_rsa(ctx, input).await.map(Output::into_bytes)
    }

    /// Picks the mode of the next generation and advances the reseed counter.
    fn next_generation(&self) -> (RngMode, u64) {
        let mut state = lock(&self.drbg);
        state.generation += 1;
        let mode = if state.remaining == 0 {
            state.remaining = self.config.drbg_reseed_interval;
            RngMode::ForceReseed
        } else {
            state.remaining -= 1;
            RngMode::Normal
        };
        (mode, state.generation)
    }

    async fn generate_blocks(&self, blocks: usize) -> Result<Vec<u8>> {
        let (mode, generation) = self.next_generation();
        if mode == RngMode::ForceReseed {
            info!("DRBG reseed forced at generation {}", generation);
        }
        let mut seed = [0u8; DRBG_BLOCK_SIZE];
        seed[..8].copy_from_slice(&generation.to_le_bytes());
        let seed = self.memory.map(&seed)?;
        let out = match self.memory.alloc(blocks * DRBG_BLOCK_SIZE) {
            Ok(out) => out,
            Err(err) => {
                self.memory.unmap(&seed);
                return Err(err);
            }
        };
        let interval = self.config.drbg_reseed_interval;
        let (seed_desc, out_desc) = (seed.descriptor(), out.descriptor());
        let ran = self
            .scheduler(EngineId::Aes0)
            .run_sync(|sink| encode_generate(sink, EngineId::Aes0, mode, interval, seed_desc, out_desc))
            .await;
        let bytes = out.to_vec();
        for buf in [&seed, &out] {
            self.memory.unmap(buf);
        }
        ran.map(|_| bytes)
    }

    /// Random bytes from the DRBG engine, one synchronous submission per
    /// batch of blocks.
    pub async fn generate_random(&self, len: usize) -> Result<Vec<u8>> {
        let mut blocks = len.div_ceil(DRBG_BLOCK_SIZE);
        let mut out = Vec::with_capacity(blocks * DRBG_BLOCK_SIZE);
        while blocks > 0 {
            let now = blocks.min(DRBG_BLOCKS_PER_SUBMIT);
            out.extend(self.generate_blocks(now).await?);
            blocks -= now;
        }
        out.truncate(len);
        Ok(out)
    }

    /// Maps `data` for zero-copy submission. The caller unmaps it through
    /// [`DeviceMemory::unmap`] once the request resolved.
    pub fn map(&self, data: &[u8]) -> Result<DmaBuffer> {
        self.memory.map(data)
    }
}

impl Drop for SecurityEngine {
    fn drop(&mut self) {
        let (pending, backlog) = self
            .schedulers
            .iter()
            .map(RequestScheduler::queued)
            .fold((0, 0), |(p, b), (qp, qb)| (p + qp, b + qb));
        if pending + backlog > 0 {
            warn!(
                "Security engine dropped with {} queued and {} backlogged requests",
                pending, backlog
            );
        }
    }
}
