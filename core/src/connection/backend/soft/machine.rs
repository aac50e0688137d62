/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Register-level model of one engine instance.
//!
//! It consumes the same word stream real hardware would: register writes land
//! in the engine window, key table writes go through the address/data pair,
//! and a write to `OPERATION` runs one chunk of the configured operation.
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::connection::backend::soft::aes::{AesCore, Block, cbc_apply, increment, last_block};
use crate::connection::backend::soft::bignum;
use crate::error::{Error, Result};
use crate::host::dma::{DeviceMemory, LinkedListDescriptor};
use crate::host::utilities::{bytes_to_words_le, lock, words_to_bytes_le, xor_in_place};
use crate::se::encoder::restart_op;
use crate::se::protocol::{AES_BLOCK_SIZE, EngineId, KeyLength, OpMode, ShaAlgorithm};
use crate::se::regs::{
    self, ALG_AES, ALG_RNG, ALG_RSA, ALG_SHA, Config, CoreSel, CryptoConfig, Destination,
    InputSel, IvSel, OpCode, Opcode, Operation, Quad, RSA_KEY_WORDS, RngMode, RsaKeyKind,
    VctramSel, WINDOW_WORDS, XorPos,
};

/// Key storage shared by every engine, like the hardware key tables.
#[derive(Debug)]
pub struct KeyStore {
    aes: Vec<[[u32; 4]; 4]>,
    rsa: Vec<[[u32; RSA_KEY_WORDS]; 2]>,
}

impl KeyStore {
    pub fn new(aes_slots: usize, rsa_slots: usize) -> Self {
        Self {
            aes: vec![[[0; 4]; 4]; aes_slots],
            rsa: vec![[[0; RSA_KEY_WORDS]; 2]; rsa_slots],
        }
    }

    fn aes_slot(&mut self, slot: u8) -> Result<&mut [[u32; 4]; 4]> {
        self.aes
            .get_mut(slot as usize)
            .ok_or_else(|| Error::fault(format!("key slot {} does not exist", slot)))
    }

    /// Fills a slot out of band, the way platform firmware provisions keys.
    pub fn provision(&mut self, slot: u8, key: &[u8]) -> Result<()> {
        KeyLength::from_len(key.len())?;
        let words = bytes_to_words_le(key);
        let entry = self.aes_slot(slot)?;
        for (i, word) in words.iter().enumerate() {
            entry[i / 4][i % 4] = *word;
        }
        Ok(())
    }

    fn key(&mut self, slot: u8, len: KeyLength) -> Result<Vec<u8>> {
        let entry = self.aes_slot(slot)?;
        let mut bytes = words_to_bytes_le(&entry[Quad::Keys128 as usize]);
        bytes.extend(words_to_bytes_le(&entry[Quad::Keys256 as usize]));
        bytes.truncate(len.bytes());
        Ok(bytes)
    }

    fn iv(&mut self, slot: u8, quad: Quad) -> Result<Block> {
        let entry = self.aes_slot(slot)?;
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&words_to_bytes_le(&entry[quad as usize]));
        Ok(out)
    }

    fn set_iv(&mut self, slot: u8, quad: Quad, iv: &Block) -> Result<()> {
        let entry = self.aes_slot(slot)?;
        entry[quad as usize].copy_from_slice(&bytes_to_words_le(iv));
        Ok(())
    }

    fn rsa_words(&self, slot: u8, kind: RsaKeyKind, words: usize) -> Result<Vec<u32>> {
        let entry = self
            .rsa
            .get(slot as usize)
            .ok_or_else(|| Error::fault(format!("RSA key slot {} does not exist", slot)))?;
        entry[kind as usize]
            .get(..words)
            .map(<[u32]>::to_vec)
            .ok_or_else(|| Error::fault(format!("RSA key of {} words", words)))
    }
}

/// Deterministic AES-CTR generator standing in for the DRBG core.
struct Drbg {
    core: AesCore,
    counter: Block,
}

impl Drbg {
    fn new(seed: &Block) -> Self {
        Self {
            core: AesCore::with_key128(seed),
            counter: [0u8; AES_BLOCK_SIZE],
        }
    }

    fn next_block(&mut self) -> Block {
        let mut block = self.counter;
        self.core.encrypt(&mut block);
        increment(&mut self.counter);
        block
    }

    fn reseed(&mut self) {
        let key = self.next_block();
        self.core = AesCore::with_key128(&key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AesKind {
    EcbEncrypt,
    EcbDecrypt,
    CbcEncrypt,
    CbcDecrypt,
    Ctr,
    Ofb,
    Cmac,
    Drbg,
}

impl AesKind {
    fn mode(self) -> OpMode {
        match self {
            AesKind::EcbEncrypt | AesKind::EcbDecrypt => OpMode::Ecb,
            AesKind::CbcEncrypt | AesKind::CbcDecrypt => OpMode::Cbc,
            AesKind::Ctr => OpMode::Ctr,
            AesKind::Ofb => OpMode::Ofb,
            AesKind::Cmac => OpMode::Cmac,
            AesKind::Drbg => OpMode::Drbg,
        }
    }

    fn decode(config: &Config, crypto: &CryptoConfig) -> Option<Self> {
        if config.enc_alg == ALG_RNG {
            return Some(AesKind::Drbg);
        }
        match (crypto.input_sel, crypto.xor_pos, crypto.vctram_sel) {
            (InputSel::LinearCtr, _, _) => Some(AesKind::Ctr),
            (InputSel::AesOut, _, _) => Some(AesKind::Ofb),
            (InputSel::Memory, XorPos::Bypass, _) => Some(match crypto.core_sel {
                CoreSel::Encrypt => AesKind::EcbEncrypt,
                CoreSel::Decrypt => AesKind::EcbDecrypt,
            }),
            (InputSel::Memory, XorPos::Top, VctramSel::AesOut) if crypto.hash_enable => {
                Some(AesKind::Cmac)
            }
            (InputSel::Memory, XorPos::Top, VctramSel::AesOut) => Some(AesKind::CbcEncrypt),
            (InputSel::Memory, XorPos::Bottom, VctramSel::PrevMemory) => Some(AesKind::CbcDecrypt),
            _ => None,
        }
    }
}

struct AesRun {
    kind: AesKind,
    slot: u8,
    key: Vec<u8>,
    core: Option<AesCore>,
    chain: Block,
    blocks_left: usize,
    dst: Destination,
}

enum Hasher {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(alg: ShaAlgorithm) -> Self {
        match alg {
            ShaAlgorithm::Sha1 => Hasher::Sha1(Sha1::new()),
            ShaAlgorithm::Sha224 => Hasher::Sha224(Sha224::new()),
            ShaAlgorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            ShaAlgorithm::Sha384 => Hasher::Sha384(Sha384::new()),
            ShaAlgorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha224(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha384(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Hasher::Sha1(h) => h.finalize().to_vec(),
            Hasher::Sha224(h) => h.finalize().to_vec(),
            Hasher::Sha256(h) => h.finalize().to_vec(),
            Hasher::Sha384(h) => h.finalize().to_vec(),
            Hasher::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

struct ShaRun {
    alg: ShaAlgorithm,
    hasher: Hasher,
    expected_bits: u64,
    seen: u64,
    out: LinkedListDescriptor,
}

pub struct Machine {
    engine: EngineId,
    syncpoint: u32,
    memory: Arc<DeviceMemory>,
    keys: Arc<Mutex<KeyStore>>,
    regs: [u32; WINDOW_WORDS as usize],
    aes: Option<AesRun>,
    sha: Option<ShaRun>,
    drbg: Drbg,
    retired: bool,
}

impl Machine {
    pub fn new(
        engine: EngineId,
        syncpoint: u32,
        memory: Arc<DeviceMemory>,
        keys: Arc<Mutex<KeyStore>>,
        seed: &Block,
    ) -> Self {
        Self {
            engine,
            syncpoint,
            memory,
            keys,
            regs: [0; WINDOW_WORDS as usize],
            aes: None,
            sha: None,
            drbg: Drbg::new(seed),
            retired: false,
        }
    }

    fn reg(&self, offset: u32) -> u32 {
        self.regs[offset as usize]
    }

    fn descriptor(&self, lo: u32) -> LinkedListDescriptor {
        regs::decode_descriptor(self.reg(lo), self.reg(lo + 1))
    }

    /// Runs one submission. Any error leaves the engine idle for the next one.
    pub fn execute(&mut self, words: &[u32]) -> Result<()> {
        self.retired = false;
        let result = self.run(words);
        if result.is_err() || self.aes.is_some() || self.sha.is_some() {
            self.aes = None;
            self.sha = None;
        }
        result?;
        if !self.retired {
            return Err(Error::fault("submission did not end with a syncpoint increment"));
        }
        Ok(())
    }

    fn run(&mut self, words: &[u32]) -> Result<()> {
        let mut at = 0;
        while at < words.len() {
            let header = words[at];
            let (offset, count, incrementing) = match Opcode::decode(header) {
                Some(Opcode::Incr { offset, count }) => (offset, count as usize, true),
                Some(Opcode::NonIncr { offset, count }) => (offset, count as usize, false),
                None => {
                    return Err(Error::fault(format!(
                        "bad opcode 0x{:08X} at word {}",
                        header, at
                    )));
                }
            };
            let data = words
                .get(at + 1..at + 1 + count)
                .ok_or_else(|| Error::fault(format!("opcode at word {} runs past the buffer", at)))?;
            for (i, value) in data.iter().enumerate() {
                let target = if incrementing { offset + i as u32 } else { offset };
                self.write(target, *value)?;
            }
            at += 1 + count;
        }
        if self.aes.is_some() || self.sha.is_some() {
            return Err(Error::fault("operation left without a LASTBUF chunk"));
        }
        Ok(())
    }

    fn write(&mut self, target: u32, value: u32) -> Result<()> {
        if self.retired {
            return Err(Error::fault("write after the syncpoint increment"));
        }
        if target == regs::HOST_INCR_SYNCPT {
            if value != regs::incr_syncpt_word(self.syncpoint) {
                return Err(Error::fault(format!("increment of foreign syncpoint 0x{:X}", value)));
            }
            self.retired = true;
            return Ok(());
        }
        let (engine, offset) = regs::locate(target)
            .ok_or_else(|| Error::fault(format!("write to unmapped register 0x{:03X}", target)))?;
        if engine != self.engine {
            return Err(Error::fault(format!("{} stream writes {} registers", self.engine, engine)));
        }
        self.regs[offset as usize] = value;
        match engine {
            EngineId::Aes0 | EngineId::Aes1 => self.aes_write(offset, value),
            EngineId::Sha => self.sha_write(offset, value),
            EngineId::Rsa => self.rsa_write(offset, value),
        }
    }

    fn aes_write(&mut self, offset: u32, value: u32) -> Result<()> {
        use crate::se::regs::aes as reg;
        match offset {
            reg::KEYTABLE_DATA => {
                let (slot, quad, word) = regs::decode_keytable_addr(self.reg(reg::KEYTABLE_ADDR));
                lock(&self.keys).aes_slot(slot)?[quad as usize][word] = value;
                Ok(())
            }
            reg::RNG_CONFIG => {
                if matches!(
                    regs::decode_rng_mode(value),
                    RngMode::ForceReseed | RngMode::ForceInstantiation
                ) {
                    debug!("{}: DRBG reseed", self.engine);
                    self.drbg.reseed();
                }
                Ok(())
            }
            reg::OPERATION => self.aes_operation(value),
            _ => Ok(()),
        }
    }

    fn aes_operation(&mut self, value: u32) -> Result<()> {
        use crate::se::regs::aes as reg;
        let op = Operation::decode(value)
            .ok_or_else(|| Error::fault(format!("bad operation word 0x{:08X}", value)))?;
        match op.op {
            OpCode::Dummy => return Ok(()),
            OpCode::Start => {
                if self.aes.is_some() {
                    return Err(Error::fault("START while an operation is still open"));
                }
                self.aes = Some(self.begin_aes()?);
            }
            restart => {
                let run = self
                    .aes
                    .as_ref()
                    .ok_or_else(|| Error::fault("restart without an open operation"))?;
                if restart != restart_op(run.kind.mode()) {
                    return Err(Error::fault(format!("{:?} is not a {} restart", restart, run.kind.mode())));
                }
            }
        }

        let input = self.descriptor(reg::IN_ADDR);
        let output = self.descriptor(reg::OUT_ADDR);
        let mut run = self
            .aes
            .take()
            .ok_or_else(|| Error::fault("no open operation"))?;
        self.aes_chunk(&mut run, input, output)?;
        if op.lastbuf {
            self.aes_finish(run, output)
        } else {
            self.aes = Some(run);
            Ok(())
        }
    }

    fn begin_aes(&mut self) -> Result<AesRun> {
        use crate::se::regs::aes as reg;
        let config = Config::decode(self.reg(reg::CONFIG))
            .ok_or_else(|| Error::fault("bad CONFIG"))?;
        let crypto = CryptoConfig::decode(self.reg(reg::CRYPTO_CONFIG))
            .ok_or_else(|| Error::fault("bad CRYPTO_CONFIG"))?;
        let kind = AesKind::decode(&config, &crypto)
            .ok_or_else(|| Error::fault(format!("unsupported crypto config {:?}", crypto)))?;
        if !self.engine.supports(kind.mode()) {
            return Err(Error::fault(format!("{} is not wired on {}", kind.mode(), self.engine)));
        }
        let blocks_left = self.reg(reg::LAST_BLOCK) as usize + 1;

        if kind == AesKind::Drbg {
            return Ok(AesRun {
                kind,
                slot: 0,
                key: Vec::new(),
                core: None,
                chain: [0; AES_BLOCK_SIZE],
                blocks_left,
                dst: config.dst,
            });
        }

        let mode = if config.enc_alg == ALG_AES {
            config.enc_mode
        } else if config.dec_alg == ALG_AES {
            config.dec_mode
        } else {
            return Err(Error::fault("AES operation without the AES algorithm selected"));
        };
        let len = regs::key_mode_len(mode)
            .ok_or_else(|| Error::fault(format!("bad key mode {}", mode)))?;
        let slot = crypto.key_index;
        let key = lock(&self.keys).key(slot, len)?;
        let chain = match kind {
            AesKind::Ctr => {
                let words: Vec<u32> = (0..4).map(|i| self.reg(reg::LINEAR_CTR + i)).collect();
                let mut ctr = [0u8; AES_BLOCK_SIZE];
                ctr.copy_from_slice(&words_to_bytes_le(&words));
                ctr
            }
            AesKind::EcbEncrypt | AesKind::EcbDecrypt => [0; AES_BLOCK_SIZE],
            _ => {
                let quad = match crypto.iv_sel {
                    IvSel::Original => Quad::OriginalIv,
                    IvSel::Updated => Quad::UpdatedIv,
                };
                lock(&self.keys).iv(slot, quad)?
            }
        };
        trace!("{}: {:?} on slot {} ({} blocks)", self.engine, kind, slot, blocks_left);
        Ok(AesRun {
            kind,
            slot,
            core: Some(AesCore::new(&key)?),
            key,
            chain,
            blocks_left,
            dst: config.dst,
        })
    }

    fn aes_chunk(
        &mut self,
        run: &mut AesRun,
        input: LinkedListDescriptor,
        output: LinkedListDescriptor,
    ) -> Result<()> {
        if input.len == 0 || input.len % AES_BLOCK_SIZE != 0 {
            return Err(Error::fault(format!("{}-byte AES chunk", input.len)));
        }
        let blocks = input.len / AES_BLOCK_SIZE;
        run.blocks_left = run
            .blocks_left
            .checked_sub(blocks)
            .ok_or_else(|| Error::fault("chunk runs past LAST_BLOCK"))?;
        let mut data = self.memory.read(input.addr, input.len)?;

        match (run.kind, run.core.as_ref()) {
            (AesKind::Drbg, _) => {
                for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    let stream = self.drbg.next_block();
                    xor_in_place(block, &stream);
                }
            }
            (AesKind::CbcEncrypt, Some(_)) => {
                cbc_apply(&run.key, &run.chain, &mut data, true)?;
                run.chain = last_block(&data).unwrap_or(run.chain);
            }
            (AesKind::CbcDecrypt, Some(_)) => {
                let next = last_block(&data).unwrap_or(run.chain);
                cbc_apply(&run.key, &run.chain, &mut data, false)?;
                run.chain = next;
            }
            (kind, Some(core)) => {
                for chunk in data.chunks_exact_mut(AES_BLOCK_SIZE) {
                    let mut block = [0u8; AES_BLOCK_SIZE];
                    block.copy_from_slice(chunk);
                    match kind {
                        AesKind::EcbEncrypt => core.encrypt(&mut block),
                        AesKind::EcbDecrypt => core.decrypt(&mut block),
                        AesKind::Ctr => {
                            let mut stream = run.chain;
                            core.encrypt(&mut stream);
                            increment(&mut run.chain);
                            xor_in_place(&mut block, &stream);
                        }
                        AesKind::Ofb => {
                            core.encrypt(&mut run.chain);
                            xor_in_place(&mut block, &run.chain);
                        }
                        AesKind::Cmac => {
                            xor_in_place(&mut run.chain, &block);
                            core.encrypt(&mut run.chain);
                            block = run.chain;
                        }
                        _ => {}
                    }
                    chunk.copy_from_slice(&block);
                }
            }
            (kind, None) => return Err(Error::fault(format!("{:?} without a key", kind))),
        }

        // MAC passes only surface their final state.
        if run.kind != AesKind::Cmac && run.dst == Destination::Memory {
            if output.len < data.len() {
                return Err(Error::fault(format!(
                    "{}-byte output for a {}-byte chunk",
                    output.len,
                    data.len()
                )));
            }
            self.memory.write(output.addr, &data)?;
        }
        Ok(())
    }

    fn aes_finish(&mut self, run: AesRun, output: LinkedListDescriptor) -> Result<()> {
        use crate::se::regs::aes as reg;
        if run.blocks_left != 0 {
            return Err(Error::fault(format!(
                "LASTBUF with {} blocks outstanding",
                run.blocks_left
            )));
        }
        match run.kind {
            AesKind::Ctr => {
                let words = bytes_to_words_le(&run.chain);
                for (i, word) in words.iter().enumerate() {
                    self.regs[(reg::LINEAR_CTR as usize) + i] = *word;
                }
            }
            AesKind::CbcEncrypt | AesKind::CbcDecrypt | AesKind::Ofb | AesKind::Cmac => {
                lock(&self.keys).set_iv(run.slot, Quad::UpdatedIv, &run.chain)?;
            }
            AesKind::EcbEncrypt | AesKind::EcbDecrypt | AesKind::Drbg => {}
        }
        if run.kind == AesKind::Cmac && run.dst == Destination::Memory {
            if output.len < AES_BLOCK_SIZE {
                return Err(Error::fault("CMAC result buffer too small"));
            }
            self.memory.write(output.addr, &run.chain)?;
        }
        Ok(())
    }

    fn sha_write(&mut self, offset: u32, value: u32) -> Result<()> {
        use crate::se::regs::sha as reg;
        if offset != reg::OPERATION {
            return Ok(());
        }
        let op = Operation::decode(value)
            .ok_or_else(|| Error::fault(format!("bad operation word 0x{:08X}", value)))?;
        match op.op {
            OpCode::Dummy => return Ok(()),
            OpCode::Start => {
                if self.sha.is_some() {
                    return Err(Error::fault("START while a hash is still open"));
                }
                let config = Config::decode(self.reg(reg::CONFIG))
                    .ok_or_else(|| Error::fault("bad CONFIG"))?;
                if config.enc_alg != ALG_SHA {
                    return Err(Error::fault("hash operation without SHA selected"));
                }
                let alg = regs::sha_mode_alg(config.enc_mode)
                    .ok_or_else(|| Error::fault(format!("bad SHA mode {}", config.enc_mode)))?;
                let expected_bits =
                    self.reg(reg::MSG_LENGTH) as u64 | (self.reg(reg::MSG_LENGTH + 1) as u64) << 32;
                self.sha = Some(ShaRun {
                    alg,
                    hasher: Hasher::new(alg),
                    expected_bits,
                    seen: 0,
                    out: self.descriptor(reg::OUT_ADDR),
                });
            }
            OpCode::RestartIn => {
                if self.sha.is_none() {
                    return Err(Error::fault("restart without an open hash"));
                }
            }
            other => return Err(Error::fault(format!("{:?} is not a hash op", other))),
        }

        let input = self.descriptor(reg::IN_ADDR);
        let data = self.memory.read(input.addr, input.len)?;
        let mut run = self
            .sha
            .take()
            .ok_or_else(|| Error::fault("no open hash"))?;
        run.hasher.update(&data);
        run.seen += data.len() as u64;
        if !op.lastbuf {
            self.sha = Some(run);
            return Ok(());
        }

        if run.seen * 8 != run.expected_bits {
            return Err(Error::fault(format!(
                "hashed {} bits, MSG_LENGTH says {}",
                run.seen * 8,
                run.expected_bits
            )));
        }
        if run.out.len < run.alg.digest_len() {
            return Err(Error::fault("digest buffer too small"));
        }
        let digest = run.hasher.finalize();
        self.memory.write(run.out.addr, &digest)
    }

    fn rsa_write(&mut self, offset: u32, value: u32) -> Result<()> {
        use crate::se::regs::rsa as reg;
        match offset {
            reg::KEYTABLE_DATA => {
                let (slot, kind, word) = regs::decode_rsa_keytable_addr(self.reg(reg::KEYTABLE_ADDR));
                let mut keys = lock(&self.keys);
                let entry = keys
                    .rsa
                    .get_mut(slot as usize)
                    .ok_or_else(|| Error::fault(format!("RSA key slot {} does not exist", slot)))?;
                entry[kind as usize][word] = value;
                Ok(())
            }
            reg::OPERATION => {
                let op = Operation::decode(value)
                    .ok_or_else(|| Error::fault(format!("bad operation word 0x{:08X}", value)))?;
                match (op.op, op.lastbuf) {
                    (OpCode::Dummy, _) => Ok(()),
                    (OpCode::Start, true) => self.rsa_exponentiate(),
                    (other, _) => Err(Error::fault(format!("{:?} is not an RSA op", other))),
                }
            }
            _ => Ok(()),
        }
    }

    fn rsa_exponentiate(&mut self) -> Result<()> {
        use crate::se::regs::rsa as reg;
        let config = Config::decode(self.reg(reg::CONFIG)).ok_or_else(|| Error::fault("bad CONFIG"))?;
        if config.enc_alg != ALG_RSA {
            return Err(Error::fault("RSA operation without RSA selected"));
        }
        let slot = self.reg(reg::KEY_SLOT) as u8;
        let mod_words = (self.reg(reg::MOD_SIZE) as usize + 1) * 16;
        let exp_words = self.reg(reg::EXP_SIZE) as usize;
        let mod_len = mod_words * 4;
        let input = self.descriptor(reg::IN_ADDR);
        let output = self.descriptor(reg::OUT_ADDR);
        if input.len != mod_len || output.len < mod_len {
            return Err(Error::fault(format!(
                "RSA buffers {}/{} for a {}-byte modulus",
                input.len, output.len, mod_len
            )));
        }

        let (modulus, exponent) = {
            let keys = lock(&self.keys);
            (
                keys.rsa_words(slot, RsaKeyKind::Modulus, mod_words)?,
                keys.rsa_words(slot, RsaKeyKind::Exponent, exp_words)?,
            )
        };
        let base = bignum::from_be_bytes(&self.memory.read(input.addr, input.len)?);
        let result = bignum::mod_pow(&base, &exponent, &modulus)
            .ok_or_else(|| Error::fault(format!("RSA slot {} holds a zero modulus", slot)))?;
        self.memory.write(output.addr, &bignum::to_be_bytes(&result, mod_len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::encoder::aes::{KeyTarget, encode_cipher, load_key};
    use crate::se::encoder::incr_syncpt;
    use crate::se::encoder::sha::encode_digest;
    use crate::se::protocol::{CipherMode, Direction, IvPolicy, KeyRef};

    const SYNCPT: u32 = 0x21;

    fn machine(engine: EngineId) -> (Machine, Arc<DeviceMemory>) {
        let memory = DeviceMemory::new();
        let keys = Arc::new(Mutex::new(KeyStore::new(16, 2)));
        (
            Machine::new(engine, SYNCPT, Arc::clone(&memory), keys, &[9u8; 16]),
            memory,
        )
    }

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn cbc_stream_matches_sp800_38a() {
        let (mut m, mem) = machine(EngineId::Aes1);
        let key = unhex("2b7e151628aed2a6abf7158809cf4f3c");
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&unhex("000102030405060708090a0b0c0d0e0f"));
        let buf = mem.map(&unhex("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51")).unwrap();
        let slot_key = KeyRef {
            slot: 3,
            len: KeyLength::Aes128,
        };

        let mut words = Vec::new();
        load_key(&mut words, EngineId::Aes1, 3, KeyTarget::Key, &key, 15).unwrap();
        encode_cipher(
            &mut words,
            EngineId::Aes1,
            CipherMode::Cbc,
            Direction::Encrypt,
            slot_key,
            &IvPolicy::Explicit(iv),
            &[buf.descriptor()],
            &[buf.descriptor()],
        )
        .unwrap();
        incr_syncpt(&mut words, SYNCPT).unwrap();
        m.execute(&words).unwrap();
        assert_eq!(
            hex::encode(buf.to_vec()),
            "7649abac8119b246cee98e9b12e9197d5086cb9b507219ee95db113a917678b2"
        );
    }

    #[test]
    fn sha_stream_checks_length_and_writes_digest() {
        let (mut m, mem) = machine(EngineId::Sha);
        let msg = mem.map(b"abc").unwrap();
        let out = mem.alloc(32).unwrap();
        let mut words = Vec::new();
        encode_digest(&mut words, EngineId::Sha, ShaAlgorithm::Sha256, &[msg.descriptor()], out.descriptor()).unwrap();
        incr_syncpt(&mut words, SYNCPT).unwrap();
        m.execute(&words).unwrap();
        assert_eq!(
            hex::encode(out.to_vec()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );

        // Lie about the length.
        words[1] = 0;
        assert!(m.execute(&words).is_err());
    }

    #[test]
    fn missing_trailer_or_foreign_window_faults() {
        let (mut m, _mem) = machine(EngineId::Aes1);
        assert!(m.execute(&[]).is_err());
        let mut words = Vec::new();
        incr_syncpt(&mut words, SYNCPT + 1).unwrap();
        assert!(m.execute(&words).is_err());
        let foreign = vec![regs::opcode_nonincr(regs::window_base(EngineId::Sha), 1), 0];
        assert!(m.execute(&foreign).is_err());
        let mut ok = Vec::new();
        incr_syncpt(&mut ok, SYNCPT).unwrap();
        m.execute(&ok).unwrap();
    }
}
