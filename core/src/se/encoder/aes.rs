/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};
use crate::host::dma::LinkedListDescriptor;
use crate::host::utilities::bytes_to_words_le;
use crate::se::encoder::{CommandSink, descriptor, restart_op, write_incr, write_nonincr};
use crate::se::protocol::{
    AES_BLOCK_SIZE, AES_IV_SIZE, CipherMode, Direction, EngineId, IvPolicy, KeyLength, KeyRef,
    OpMode,
};
use crate::se::regs::{
    self, ALG_AES, ALG_NOP, ALG_RNG, Config, CoreSel, CryptoConfig, Destination, InputSel, IvSel,
    OpCode, Quad, VctramSel, XorPos, aes as reg,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTarget {
    Key,
    OriginalIv,
    UpdatedIv,
}

/// Writes key material or an IV into the key table of `slot`.
///
/// Keys fill the 128-bit quad first and spill into the 256 quad. A leading dummy op is
/// emitted when this is the first thing in the buffer so the engine is idle before the
/// key table changes.
pub fn load_key<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    slot: u8,
    target: KeyTarget,
    data: &[u8],
    ssk_slot: u8,
) -> Result<usize> {
    match target {
        KeyTarget::Key if slot == ssk_slot => {
            return Err(Error::config(format!(
                "slot {} holds the secure storage key and cannot be overwritten",
                slot
            )));
        }
        KeyTarget::Key => {
            KeyLength::from_len(data.len())?;
        }
        KeyTarget::OriginalIv | KeyTarget::UpdatedIv if data.len() != AES_IV_SIZE => {
            return Err(Error::config(format!("invalid IV length {}", data.len())));
        }
        _ => {}
    }

    let start = sink.len();
    if sink.is_empty() {
        write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Dummy, false))?;
    }

    for (quad_idx, quad_words) in bytes_to_words_le(data).chunks(4).enumerate() {
        let quad = match target {
            KeyTarget::Key if quad_idx == 0 => Quad::Keys128,
            KeyTarget::Key => Quad::Keys256,
            KeyTarget::OriginalIv => Quad::OriginalIv,
            KeyTarget::UpdatedIv => Quad::UpdatedIv,
        };
        for (j, word) in quad_words.iter().enumerate() {
            write_nonincr(sink, engine, reg::KEYTABLE_ADDR, regs::keytable_addr(slot, quad, j))?;
            write_incr(sink, engine, reg::KEYTABLE_DATA, &[*word])?;
        }
    }

    if target == KeyTarget::Key {
        write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Dummy, false))?;
    }
    Ok(sink.len() - start)
}

/// Seeds the linear counter used by CTR mode.
pub fn seed_ctr<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    counter: &[u8; AES_IV_SIZE],
) -> Result<usize> {
    let start = sink.len();
    write_nonincr(sink, engine, reg::CTR_SPARE, regs::CTR_LITTLE_ENDIAN)?;
    write_incr(sink, engine, reg::LINEAR_CTR, &bytes_to_words_le(counter))?;
    Ok(sink.len() - start)
}

/// Configuration of one AES-family bulk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkOp {
    pub mode: OpMode,
    pub config: u32,
    pub crypto_config: u32,
}

impl BulkOp {
    pub fn cipher(mode: CipherMode, direction: Direction, key: KeyRef, iv_sel: IvSel) -> Self {
        let key_mode = regs::key_mode(key.len);
        // CTR and OFB only ever run the forward cipher.
        let forward = direction == Direction::Encrypt
            || matches!(mode, CipherMode::Ctr | CipherMode::Ofb);
        let config = if forward {
            Config {
                enc_alg: ALG_AES,
                dec_alg: ALG_NOP,
                enc_mode: key_mode,
                dec_mode: 0,
                dst: Destination::Memory,
            }
        } else {
            Config {
                enc_alg: ALG_NOP,
                dec_alg: ALG_AES,
                enc_mode: 0,
                dec_mode: key_mode,
                dst: Destination::Memory,
            }
        };

        let (input_sel, vctram_sel, xor_pos, core_sel, ctr_cntn) = match (mode, direction) {
            (CipherMode::Cbc, Direction::Encrypt) => {
                (InputSel::Memory, VctramSel::AesOut, XorPos::Top, CoreSel::Encrypt, 0)
            }
            (CipherMode::Cbc, Direction::Decrypt) => (
                InputSel::Memory,
                VctramSel::PrevMemory,
                XorPos::Bottom,
                CoreSel::Decrypt,
                0,
            ),
            (CipherMode::Ecb, Direction::Encrypt) => {
                (InputSel::Memory, VctramSel::Memory, XorPos::Bypass, CoreSel::Encrypt, 0)
            }
            (CipherMode::Ecb, Direction::Decrypt) => {
                (InputSel::Memory, VctramSel::Memory, XorPos::Bypass, CoreSel::Decrypt, 0)
            }
            (CipherMode::Ctr, _) => {
                (InputSel::LinearCtr, VctramSel::Memory, XorPos::Bottom, CoreSel::Encrypt, 1)
            }
            (CipherMode::Ofb, _) => {
                (InputSel::AesOut, VctramSel::Memory, XorPos::Bottom, CoreSel::Encrypt, 0)
            }
        };
        let crypto = CryptoConfig {
            hash_enable: false,
            xor_pos,
            input_sel,
            vctram_sel,
            iv_sel,
            core_sel,
            ctr_cntn,
            key_index: key.slot,
        };
        Self {
            mode: mode.into(),
            config: config.encode(),
            crypto_config: crypto.encode(),
        }
    }

    /// CBC-MAC pass. Intermediate passes keep the state in the hash register,
    /// the final pass writes the tag to memory.
    pub fn cmac(key: KeyRef, iv_sel: IvSel, dst: Destination) -> Self {
        let config = Config {
            enc_alg: ALG_AES,
            dec_alg: ALG_NOP,
            enc_mode: regs::key_mode(key.len),
            dec_mode: 0,
            dst,
        };
        let crypto = CryptoConfig {
            hash_enable: true,
            xor_pos: XorPos::Top,
            input_sel: InputSel::Memory,
            vctram_sel: VctramSel::AesOut,
            iv_sel,
            core_sel: CoreSel::Encrypt,
            ctr_cntn: 0,
            key_index: key.slot,
        };
        Self {
            mode: OpMode::Cmac,
            config: config.encode(),
            crypto_config: crypto.encode(),
        }
    }

    pub fn drbg() -> Self {
        let config = Config {
            enc_alg: ALG_RNG,
            dec_alg: ALG_NOP,
            enc_mode: regs::MODE_KEY192,
            dec_mode: 0,
            dst: Destination::Memory,
        };
        let crypto = CryptoConfig {
            hash_enable: false,
            xor_pos: XorPos::Bypass,
            input_sel: InputSel::Random,
            vctram_sel: VctramSel::Memory,
            iv_sel: IvSel::Original,
            core_sel: CoreSel::Encrypt,
            ctr_cntn: 0,
            key_index: 0,
        };
        Self {
            mode: OpMode::Drbg,
            config: config.encode(),
            crypto_config: crypto.encode(),
        }
    }
}

/// Emits one bulk operation over `src`, one chunk per descriptor.
///
/// `dst` is either empty (result stays in the engine) or pairs with `src` one to one.
pub fn encode_bulk<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    op: &BulkOp,
    src: &[LinkedListDescriptor],
    dst: &[LinkedListDescriptor],
) -> Result<usize> {
    engine.check(op.mode)?;
    let total: usize = src.iter().map(|d| d.len).sum();
    if total == 0 || total % AES_BLOCK_SIZE != 0 {
        return Err(Error::config(format!(
            "{} needs a non-zero multiple of {} bytes, got {}",
            op.mode, AES_BLOCK_SIZE, total
        )));
    }
    if !dst.is_empty() && dst.len() != src.len() {
        return Err(Error::Internal(format!(
            "{} source descriptors but {} destination descriptors",
            src.len(),
            dst.len()
        )));
    }

    let start = sink.len();
    let mut remaining = total;
    for (i, s) in src.iter().enumerate() {
        let [in_lo, in_hi] = descriptor(s)?;
        let [out_lo, out_hi] = match dst.get(i) {
            Some(d) => descriptor(d)?,
            None => [0, 0],
        };
        if i == 0 {
            let last_block = (total / AES_BLOCK_SIZE - 1) as u32;
            write_nonincr(sink, engine, reg::LAST_BLOCK, last_block)?;
            write_incr(
                sink,
                engine,
                reg::CONFIG,
                &[op.config, op.crypto_config, in_lo, in_hi, out_lo, out_hi],
            )?;
        } else {
            write_incr(sink, engine, reg::IN_ADDR, &[in_lo, in_hi, out_lo, out_hi])?;
        }
        remaining -= s.len;
        let code = if i == 0 { OpCode::Start } else { restart_op(op.mode) };
        write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(code, remaining == 0))?;
    }
    Ok(sink.len() - start)
}

/// Full cipher request: optional IV setup followed by the bulk operation.
#[allow(clippy::too_many_arguments)]
pub fn encode_cipher<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    mode: CipherMode,
    direction: Direction,
    key: KeyRef,
    iv: &IvPolicy,
    src: &[LinkedListDescriptor],
    dst: &[LinkedListDescriptor],
) -> Result<usize> {
    engine.check(mode.into())?;
    let start = sink.len();
    let iv_sel = match (mode, iv) {
        (CipherMode::Ecb, _) => IvSel::Original,
        (CipherMode::Ctr, IvPolicy::Explicit(counter)) => {
            seed_ctr(sink, engine, counter)?;
            IvSel::Original
        }
        (_, IvPolicy::Explicit(iv)) => {
            // The SSK guard only covers key material.
            load_key(sink, engine, key.slot, KeyTarget::OriginalIv, iv, u8::MAX)?;
            IvSel::Original
        }
        (_, IvPolicy::Chained) => IvSel::Updated,
    };
    encode_bulk(sink, engine, &BulkOp::cipher(mode, direction, key, iv_sel), src, dst)?;
    Ok(sink.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::regs::{opcode_incr, opcode_nonincr};

    const KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn desc(addr: u64, len: usize) -> LinkedListDescriptor {
        LinkedListDescriptor { addr, len }
    }

    #[test]
    fn key_load_shape() {
        let mut words = Vec::new();
        let n = load_key(&mut words, EngineId::Aes1, 3, KeyTarget::Key, &KEY, 15).unwrap();
        assert_eq!(n, 2 + 4 * 4 + 2);
        let base = regs::window_base(EngineId::Aes1);
        assert_eq!(words[0], opcode_nonincr(base + reg::OPERATION, 1));
        assert_eq!(words[1], regs::operation_word(OpCode::Dummy, false));
        assert_eq!(words[2], opcode_nonincr(base + reg::KEYTABLE_ADDR, 1));
        assert_eq!(words[3], regs::keytable_addr(3, Quad::Keys128, 0));
        assert_eq!(words[4], opcode_incr(base + reg::KEYTABLE_DATA, 1));
        assert_eq!(words[5], 0x1615_7e2b);
    }

    #[test]
    fn long_keys_spill_into_second_quad() {
        let mut words = vec![0xdead_beef];
        let key = [0x11u8; 24];
        let n = load_key(&mut words, EngineId::Aes1, 4, KeyTarget::Key, &key, 15).unwrap();
        // No leading dummy: the buffer already had content.
        assert_eq!(n, 6 * 4 + 2);
        let addrs: Vec<u32> = words[1..].chunks(4).take(6).map(|c| c[1]).collect();
        assert_eq!(addrs[3], regs::keytable_addr(4, Quad::Keys128, 3));
        assert_eq!(addrs[4], regs::keytable_addr(4, Quad::Keys256, 0));
        assert_eq!(addrs[5], regs::keytable_addr(4, Quad::Keys256, 1));
    }

    #[test]
    fn key_load_into_ssk_slot_is_rejected() {
        let mut words = Vec::new();
        let err = load_key(&mut words, EngineId::Aes1, 15, KeyTarget::Key, &KEY, 15).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(words.is_empty());
        // IVs are fine.
        load_key(&mut words, EngineId::Aes1, 15, KeyTarget::OriginalIv, &[0u8; 16], 15).unwrap();
    }

    #[test]
    fn bad_key_length_is_rejected() {
        let mut words = Vec::new();
        assert!(load_key(&mut words, EngineId::Aes1, 2, KeyTarget::Key, &[0u8; 20], 15).is_err());
    }

    #[test]
    fn bulk_first_chunk_carries_config() {
        let key = KeyRef {
            slot: 2,
            len: KeyLength::Aes128,
        };
        let op = BulkOp::cipher(CipherMode::Cbc, Direction::Encrypt, key, IvSel::Original);
        let src = [desc(0x1_0000_0000, 32), desc(0x1_0000_0040, 16)];
        let dst = [desc(0x1_0000_1000, 32), desc(0x1_0000_1040, 16)];
        let mut words = Vec::new();
        let n = encode_bulk(&mut words, EngineId::Aes1, &op, &src, &dst).unwrap();
        let base = regs::window_base(EngineId::Aes1);
        assert_eq!(n, 2 + 7 + 2 + 5 + 2);
        assert_eq!(&words[..2], &[opcode_nonincr(base + reg::LAST_BLOCK, 1), 2]);
        assert_eq!(words[2], opcode_incr(base + reg::CONFIG, 6));
        assert_eq!(words[3], op.config);
        assert_eq!(words[4], op.crypto_config);
        assert_eq!(words[5], 0x0000_0000);
        assert_eq!(words[6], 0x0100_0020);
        assert_eq!(words[10], regs::operation_word(OpCode::Start, false));
        assert_eq!(words[11], opcode_incr(base + reg::IN_ADDR, 4));
        assert_eq!(words[17], regs::operation_word(OpCode::RestartInOut, true));
    }

    #[test]
    fn bulk_rejects_partial_blocks_and_wrong_engine() {
        let key = KeyRef {
            slot: 2,
            len: KeyLength::Aes256,
        };
        let op = BulkOp::cipher(CipherMode::Ecb, Direction::Decrypt, key, IvSel::Original);
        let mut words = Vec::new();
        assert!(encode_bulk(&mut words, EngineId::Aes1, &op, &[desc(0x1_0000_0000, 15)], &[]).is_err());
        let err = encode_bulk(&mut words, EngineId::Sha, &op, &[desc(0x1_0000_0000, 16)], &[])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(words.is_empty());
    }

    #[test]
    fn ctr_seeds_counter_instead_of_iv_quad() {
        let key = KeyRef {
            slot: 5,
            len: KeyLength::Aes128,
        };
        let counter = [0xf0u8; 16];
        let mut words = Vec::new();
        encode_cipher(
            &mut words,
            EngineId::Aes1,
            CipherMode::Ctr,
            Direction::Encrypt,
            key,
            &IvPolicy::Explicit(counter),
            &[desc(0x1_0000_0000, 16)],
            &[desc(0x1_0000_0000, 16)],
        )
        .unwrap();
        let base = regs::window_base(EngineId::Aes1);
        assert_eq!(&words[..2], &[opcode_nonincr(base + reg::CTR_SPARE, 1), 1]);
        assert_eq!(words[2], opcode_incr(base + reg::LINEAR_CTR, 4));
        assert_eq!(words[3], 0xf0f0_f0f0);
    }

    #[test]
    fn chained_iv_selects_updated_iv() {
        let key = KeyRef {
            slot: 5,
            len: KeyLength::Aes128,
        };
        let mut words = Vec::new();
        encode_cipher(
            &mut words,
            EngineId::Aes1,
            CipherMode::Cbc,
            Direction::Decrypt,
            key,
            &IvPolicy::Chained,
            &[desc(0x1_0000_0000, 16)],
            &[desc(0x1_0000_0000, 16)],
        )
        .unwrap();
        let crypto = CryptoConfig::decode(words[4]).unwrap();
        assert_eq!(crypto.iv_sel, IvSel::Updated);
        assert_eq!(crypto.key_index, 5);
        assert_eq!(crypto.core_sel, CoreSel::Decrypt);
    }
}
