/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Command word layout and engine register map.
//!
//! Opcode words: bits 31..28 kind, 27..16 register word offset, 15..0 payload count.
use crate::host::dma::LinkedListDescriptor;
use crate::se::protocol::{EngineId, KeyLength, ShaAlgorithm};

pub const OPCODE_INCR: u32 = 1;
pub const OPCODE_NONINCR: u32 = 2;

pub const fn opcode_incr(offset: u32, count: u32) -> u32 {
    (OPCODE_INCR << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

pub const fn opcode_nonincr(offset: u32, count: u32) -> u32 {
    (OPCODE_NONINCR << 28) | ((offset & 0xfff) << 16) | (count & 0xffff)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Incr { offset: u32, count: u32 },
    NonIncr { offset: u32, count: u32 },
}

impl Opcode {
    pub fn decode(word: u32) -> Option<Self> {
        let offset = (word >> 16) & 0xfff;
        let count = word & 0xffff;
        match word >> 28 {
            OPCODE_INCR => Some(Opcode::Incr { offset, count }),
            OPCODE_NONINCR => Some(Opcode::NonIncr { offset, count }),
            _ => None,
        }
    }
}

/// Host class syncpoint increment register.
pub const HOST_INCR_SYNCPT: u32 = 0x000;
pub const SYNCPT_COND_OP_DONE: u32 = 1;

pub const fn incr_syncpt_word(syncpt: u32) -> u32 {
    (SYNCPT_COND_OP_DONE << 8) | (syncpt & 0xff)
}

/// Words in one engine register window.
pub const WINDOW_WORDS: u32 = 0x20;

pub fn window_base(engine: EngineId) -> u32 {
    match engine {
        EngineId::Aes0 => 0x040,
        EngineId::Aes1 => 0x080,
        EngineId::Rsa => 0x0c0,
        EngineId::Sha => 0x100,
    }
}

/// Maps an absolute register offset back to its engine and window-relative offset.
pub fn locate(offset: u32) -> Option<(EngineId, u32)> {
    EngineId::ALL.iter().find_map(|engine| {
        let base = window_base(*engine);
        (offset >= base && offset < base + WINDOW_WORDS).then(|| (*engine, offset - base))
    })
}

pub mod aes {
    pub const CONFIG: u32 = 0x00;
    pub const CRYPTO_CONFIG: u32 = 0x01;
    pub const IN_ADDR: u32 = 0x02;
    pub const IN_ADDR_HI: u32 = 0x03;
    pub const OUT_ADDR: u32 = 0x04;
    pub const OUT_ADDR_HI: u32 = 0x05;
    pub const LAST_BLOCK: u32 = 0x06;
    pub const OPERATION: u32 = 0x07;
    pub const KEYTABLE_ADDR: u32 = 0x08;
    pub const KEYTABLE_DATA: u32 = 0x09;
    pub const CTR_SPARE: u32 = 0x0a;
    pub const LINEAR_CTR: u32 = 0x0b;
    pub const RNG_CONFIG: u32 = 0x10;
    pub const RNG_RESEED_INTERVAL: u32 = 0x11;
}

pub mod sha {
    pub const CONFIG: u32 = 0x00;
    pub const HW_INIT_HASH: u32 = 0x01;
    pub const IN_ADDR: u32 = 0x02;
    pub const IN_ADDR_HI: u32 = 0x03;
    pub const OUT_ADDR: u32 = 0x04;
    pub const OUT_ADDR_HI: u32 = 0x05;
    pub const OPERATION: u32 = 0x07;
    pub const MSG_LENGTH: u32 = 0x10;
    pub const MSG_LEFT: u32 = 0x14;
}

pub mod rsa {
    pub const CONFIG: u32 = 0x00;
    pub const KEY_SLOT: u32 = 0x01;
    pub const MOD_SIZE: u32 = 0x02;
    pub const EXP_SIZE: u32 = 0x03;
    pub const IN_ADDR: u32 = 0x04;
    pub const IN_ADDR_HI: u32 = 0x05;
    pub const OUT_ADDR: u32 = 0x06;
    pub const OUT_ADDR_HI: u32 = 0x07;
    pub const OPERATION: u32 = 0x08;
    pub const KEYTABLE_ADDR: u32 = 0x09;
    pub const KEYTABLE_DATA: u32 = 0x0a;
}

pub const CTR_LITTLE_ENDIAN: u32 = 1;
pub const HW_INIT_HASH_ENABLE: u32 = 1;

/// Largest length one descriptor can express.
pub const MAX_DESCRIPTOR_LEN: usize = 0x00ff_ffff;

/// High address word: address bits 39..32 in 31..24, length in 23..0.
pub fn descriptor_hi(desc: &LinkedListDescriptor) -> u32 {
    ((((desc.addr >> 32) & 0xff) as u32) << 24) | (desc.len as u32 & 0x00ff_ffff)
}

pub fn descriptor_words(desc: &LinkedListDescriptor) -> [u32; 2] {
    [desc.addr as u32, descriptor_hi(desc)]
}

pub fn decode_descriptor(lo: u32, hi: u32) -> LinkedListDescriptor {
    LinkedListDescriptor {
        addr: (((hi >> 24) as u64) << 32) | lo as u64,
        len: (hi & 0x00ff_ffff) as usize,
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Dummy = 0,
    Start = 1,
    RestartOut = 2,
    RestartIn = 3,
    RestartInOut = 4,
}

pub const OP_WRSTALL: u32 = 1 << 15;
pub const OP_LASTBUF: u32 = 1 << 16;

pub fn operation_word(op: OpCode, lastbuf: bool) -> u32 {
    OP_WRSTALL | (if lastbuf { OP_LASTBUF } else { 0 }) | op as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub op: OpCode,
    pub lastbuf: bool,
}

impl Operation {
    pub fn decode(word: u32) -> Option<Self> {
        let op = match word & 0x7 {
            0 => OpCode::Dummy,
            1 => OpCode::Start,
            2 => OpCode::RestartOut,
            3 => OpCode::RestartIn,
            4 => OpCode::RestartInOut,
            _ => return None,
        };
        Some(Self {
            op,
            lastbuf: word & OP_LASTBUF != 0,
        })
    }
}

// CONFIG register fields.
pub const ALG_NOP: u32 = 0;
pub const ALG_AES: u32 = 1;
pub const ALG_RNG: u32 = 2;
pub const ALG_SHA: u32 = 3;
pub const ALG_RSA: u32 = 4;

pub const MODE_KEY128: u32 = 0;
pub const MODE_KEY192: u32 = 1;
pub const MODE_KEY256: u32 = 2;
pub const MODE_SHA1: u32 = 0;
pub const MODE_SHA224: u32 = 4;
pub const MODE_SHA256: u32 = 5;
pub const MODE_SHA384: u32 = 6;
pub const MODE_SHA512: u32 = 7;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Memory = 0,
    HashReg = 1,
    KeyTable = 2,
    Srk = 3,
    RsaReg = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub enc_alg: u32,
    pub dec_alg: u32,
    pub enc_mode: u32,
    pub dec_mode: u32,
    pub dst: Destination,
}

impl Config {
    pub fn encode(&self) -> u32 {
        ((self.enc_mode & 0xff) << 24)
            | ((self.dec_mode & 0xff) << 16)
            | ((self.enc_alg & 0xf) << 12)
            | ((self.dec_alg & 0xf) << 8)
            | ((self.dst as u32) << 2)
    }

    pub fn decode(word: u32) -> Option<Self> {
        let dst = match (word >> 2) & 0x7 {
            0 => Destination::Memory,
            1 => Destination::HashReg,
            2 => Destination::KeyTable,
            3 => Destination::Srk,
            4 => Destination::RsaReg,
            _ => return None,
        };
        Some(Self {
            enc_mode: word >> 24,
            dec_mode: (word >> 16) & 0xff,
            enc_alg: (word >> 12) & 0xf,
            dec_alg: (word >> 8) & 0xf,
            dst,
        })
    }
}

pub fn key_mode(len: KeyLength) -> u32 {
    match len {
        KeyLength::Aes128 => MODE_KEY128,
        KeyLength::Aes192 => MODE_KEY192,
        KeyLength::Aes256 => MODE_KEY256,
    }
}

pub fn key_mode_len(mode: u32) -> Option<KeyLength> {
    match mode {
        MODE_KEY128 => Some(KeyLength::Aes128),
        MODE_KEY192 => Some(KeyLength::Aes192),
        MODE_KEY256 => Some(KeyLength::Aes256),
        _ => None,
    }
}

pub fn sha_mode(alg: ShaAlgorithm) -> u32 {
    match alg {
        ShaAlgorithm::Sha1 => MODE_SHA1,
        ShaAlgorithm::Sha224 => MODE_SHA224,
        ShaAlgorithm::Sha256 => MODE_SHA256,
        ShaAlgorithm::Sha384 => MODE_SHA384,
        ShaAlgorithm::Sha512 => MODE_SHA512,
    }
}

pub fn sha_mode_alg(mode: u32) -> Option<ShaAlgorithm> {
    ShaAlgorithm::ALL.into_iter().find(|alg| sha_mode(*alg) == mode)
}

// CRYPTO_CONFIG register fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XorPos {
    Bypass = 0,
    Top = 2,
    Bottom = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSel {
    Memory = 0,
    Random = 1,
    AesOut = 2,
    LinearCtr = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VctramSel {
    Memory = 0,
    AesOut = 2,
    PrevMemory = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IvSel {
    Original = 0,
    Updated = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreSel {
    Decrypt = 0,
    Encrypt = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoConfig {
    pub hash_enable: bool,
    pub xor_pos: XorPos,
    pub input_sel: InputSel,
    pub vctram_sel: VctramSel,
    pub iv_sel: IvSel,
    pub core_sel: CoreSel,
    pub ctr_cntn: u8,
    pub key_index: u8,
}

impl CryptoConfig {
    pub fn encode(&self) -> u32 {
        (self.hash_enable as u32)
            | ((self.xor_pos as u32) << 1)
            | ((self.input_sel as u32) << 3)
            | ((self.vctram_sel as u32) << 5)
            | ((self.iv_sel as u32) << 7)
            | ((self.core_sel as u32) << 8)
            | ((self.ctr_cntn as u32) << 11)
            | (((self.key_index & 0xf) as u32) << 24)
    }

    pub fn decode(word: u32) -> Option<Self> {
        let xor_pos = match (word >> 1) & 0x3 {
            0 => XorPos::Bypass,
            2 => XorPos::Top,
            3 => XorPos::Bottom,
            _ => return None,
        };
        let input_sel = match (word >> 3) & 0x3 {
            0 => InputSel::Memory,
            1 => InputSel::Random,
            2 => InputSel::AesOut,
            _ => InputSel::LinearCtr,
        };
        let vctram_sel = match (word >> 5) & 0x3 {
            0 => VctramSel::Memory,
            2 => VctramSel::AesOut,
            3 => VctramSel::PrevMemory,
            _ => return None,
        };
        Some(Self {
            hash_enable: word & 1 != 0,
            xor_pos,
            input_sel,
            vctram_sel,
            iv_sel: if (word >> 7) & 1 != 0 {
                IvSel::Updated
            } else {
                IvSel::Original
            },
            core_sel: if (word >> 8) & 1 != 0 {
                CoreSel::Encrypt
            } else {
                CoreSel::Decrypt
            },
            ctr_cntn: ((word >> 11) & 0xff) as u8,
            key_index: ((word >> 24) & 0xf) as u8,
        })
    }
}

/// Key table quads of one symmetric slot.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quad {
    Keys128 = 0,
    Keys256 = 1,
    OriginalIv = 2,
    UpdatedIv = 3,
}

pub fn keytable_addr(slot: u8, quad: Quad, word: usize) -> u32 {
    ((((slot as u32 & 0xf) << 4) | quad as u32) << 2) | (word as u32 & 0x3)
}

pub fn decode_keytable_addr(addr: u32) -> (u8, Quad, usize) {
    let pkt = addr >> 2;
    let quad = match pkt & 0x3 {
        0 => Quad::Keys128,
        1 => Quad::Keys256,
        2 => Quad::OriginalIv,
        _ => Quad::UpdatedIv,
    };
    (((pkt >> 4) & 0xf) as u8, quad, (addr & 0x3) as usize)
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RsaKeyKind {
    Exponent = 0,
    Modulus = 1,
}

/// Words per RSA key table entry (2048 bits).
pub const RSA_KEY_WORDS: usize = 64;

pub fn rsa_keytable_addr(slot: u8, kind: RsaKeyKind, word: usize) -> u32 {
    ((slot as u32 & 0x1) << 7) | ((kind as u32) << 6) | (word as u32 & 0x3f)
}

pub fn decode_rsa_keytable_addr(addr: u32) -> (u8, RsaKeyKind, usize) {
    let kind = if (addr >> 6) & 1 != 0 {
        RsaKeyKind::Modulus
    } else {
        RsaKeyKind::Exponent
    };
    (((addr >> 7) & 1) as u8, kind, (addr & 0x3f) as usize)
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RngMode {
    Normal = 0,
    ForceInstantiation = 1,
    ForceReseed = 2,
}

pub const RNG_SRC_ENTROPY: u32 = 1 << 2;

pub fn rng_config_word(mode: RngMode) -> u32 {
    mode as u32 | RNG_SRC_ENTROPY
}

pub fn decode_rng_mode(word: u32) -> RngMode {
    match word & 0x3 {
        1 => RngMode::ForceInstantiation,
        2 => RngMode::ForceReseed,
        _ => RngMode::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_decode() {
        assert_eq!(
            Opcode::decode(opcode_incr(0x085, 6)),
            Some(Opcode::Incr {
                offset: 0x085,
                count: 6
            })
        );
        assert_eq!(Opcode::decode(0), None);
        assert_eq!(locate(0x087), Some((EngineId::Aes1, 7)));
        assert_eq!(locate(HOST_INCR_SYNCPT), None);
    }

    #[test]
    fn descriptor_hi_packs_msb_and_length() {
        let desc = LinkedListDescriptor {
            addr: 0x12_3456_7890,
            len: 48,
        };
        let [lo, hi] = descriptor_words(&desc);
        assert_eq!(lo, 0x3456_7890);
        assert_eq!(hi, 0x1200_0030);
        assert_eq!(decode_descriptor(lo, hi), desc);
    }

    #[test]
    fn config_words_decode() {
        let cfg = CryptoConfig {
            hash_enable: true,
            xor_pos: XorPos::Top,
            input_sel: InputSel::Memory,
            vctram_sel: VctramSel::AesOut,
            iv_sel: IvSel::Updated,
            core_sel: CoreSel::Encrypt,
            ctr_cntn: 0,
            key_index: 7,
        };
        assert_eq!(CryptoConfig::decode(cfg.encode()), Some(cfg));
        let (slot, quad, word) = decode_keytable_addr(keytable_addr(9, Quad::OriginalIv, 3));
        assert_eq!((slot, quad, word), (9, Quad::OriginalIv, 3));
    }
}
