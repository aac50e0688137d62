/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};
use crate::host::dma::LinkedListDescriptor;
use crate::se::encoder::{CommandSink, descriptor, restart_op, write_incr, write_nonincr};
use crate::se::protocol::{EngineId, OpMode, ShaAlgorithm};
use crate::se::regs::{self, ALG_NOP, ALG_SHA, Config, Destination, OpCode, sha as reg};

const SHA1_EMPTY: [u8; 20] = [
    0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60, 0x18, 0x90,
    0xaf, 0xd8, 0x07, 0x09,
];

const SHA224_EMPTY: [u8; 28] = [
    0xd1, 0x4a, 0x02, 0x8c, 0x2a, 0x3a, 0x2b, 0xc9, 0x47, 0x61, 0x02, 0xbb, 0x28, 0x82, 0x34, 0xc4,
    0x15, 0xa2, 0xb0, 0x1f, 0x82, 0x8e, 0xa6, 0x2a, 0xc5, 0xb3, 0xe4, 0x2f,
];

const SHA256_EMPTY: [u8; 32] = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

const SHA384_EMPTY: [u8; 48] = [
    0x38, 0xb0, 0x60, 0xa7, 0x51, 0xac, 0x96, 0x38, 0x4c, 0xd9, 0x32, 0x7e, 0xb1, 0xb1, 0xe3, 0x6a,
    0x21, 0xfd, 0xb7, 0x11, 0x14, 0xbe, 0x07, 0x43, 0x4c, 0x0c, 0xc7, 0xbf, 0x63, 0xf6, 0xe1, 0xda,
    0x27, 0x4e, 0xde, 0xbf, 0xe7, 0x6f, 0x65, 0xfb, 0xd5, 0x1a, 0xd2, 0xf1, 0x48, 0x98, 0xb9, 0x5b,
];

const SHA512_EMPTY: [u8; 64] = [
    0xcf, 0x83, 0xe1, 0x35, 0x7e, 0xef, 0xb8, 0xbd, 0xf1, 0x54, 0x28, 0x50, 0xd6, 0x6d, 0x80, 0x07,
    0xd6, 0x20, 0xe4, 0x05, 0x0b, 0x57, 0x15, 0xdc, 0x83, 0xf4, 0xa9, 0x21, 0xd3, 0x6c, 0xe9, 0xce,
    0x47, 0xd0, 0xd1, 0x3c, 0x5d, 0x85, 0xf2, 0xb0, 0xff, 0x83, 0x18, 0xd2, 0x87, 0x7e, 0xec, 0x2f,
    0x63, 0xb9, 0x31, 0xbd, 0x47, 0x41, 0x7a, 0x81, 0xa5, 0x38, 0x32, 0x7a, 0xf9, 0x27, 0xda, 0x3e,
];

/// Digest of the empty message. The engine cannot hash zero bytes.
pub fn zero_length_digest(alg: ShaAlgorithm) -> &'static [u8] {
    match alg {
        ShaAlgorithm::Sha1 => &SHA1_EMPTY,
        ShaAlgorithm::Sha224 => &SHA224_EMPTY,
        ShaAlgorithm::Sha256 => &SHA256_EMPTY,
        ShaAlgorithm::Sha384 => &SHA384_EMPTY,
        ShaAlgorithm::Sha512 => &SHA512_EMPTY,
    }
}

pub fn sha_config(alg: ShaAlgorithm) -> u32 {
    Config {
        enc_alg: ALG_SHA,
        dec_alg: ALG_NOP,
        enc_mode: regs::sha_mode(alg),
        dec_mode: 0,
        dst: Destination::HashReg,
    }
    .encode()
}

/// Hashes the bytes behind `src` and writes the digest to `out`.
pub fn encode_digest<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    alg: ShaAlgorithm,
    src: &[LinkedListDescriptor],
    out: LinkedListDescriptor,
) -> Result<usize> {
    let mode = OpMode::Sha(alg);
    engine.check(mode)?;
    let total: usize = src.iter().map(|d| d.len).sum();
    if total == 0 {
        return Err(Error::Internal("empty message reached the hash encoder".into()));
    }
    if out.len < alg.digest_len() {
        return Err(Error::Internal(format!(
            "{}-byte digest buffer for {}",
            out.len,
            alg.name()
        )));
    }

    let start = sink.len();
    let [out_lo, out_hi] = descriptor(&out)?;
    let bits = total as u64 * 8;
    let (lo, hi) = (bits as u32, (bits >> 32) as u32);
    let mut remaining = total;
    for (i, s) in src.iter().enumerate() {
        let [in_lo, in_hi] = descriptor(s)?;
        if i == 0 {
            write_incr(sink, engine, reg::MSG_LENGTH, &[lo, hi, 0, 0, lo, hi, 0, 0])?;
            write_incr(
                sink,
                engine,
                reg::CONFIG,
                &[sha_config(alg), regs::HW_INIT_HASH_ENABLE, in_lo, in_hi, out_lo, out_hi],
            )?;
        } else {
            write_incr(sink, engine, reg::IN_ADDR, &[in_lo, in_hi])?;
        }
        remaining -= s.len;
        let code = if i == 0 { OpCode::Start } else { restart_op(mode) };
        write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(code, remaining == 0))?;
    }
    Ok(sink.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::regs::opcode_incr;

    #[test]
    fn zero_digests_have_the_right_sizes() {
        for alg in ShaAlgorithm::ALL {
            assert_eq!(zero_length_digest(alg).len(), alg.digest_len());
        }
        assert_eq!(
            hex::encode(zero_length_digest(ShaAlgorithm::Sha256)),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn length_only_on_first_chunk() {
        let src = [
            LinkedListDescriptor {
                addr: 0x1_0000_0000,
                len: 64,
            },
            LinkedListDescriptor {
                addr: 0x1_0000_0040,
                len: 3,
            },
        ];
        let out = LinkedListDescriptor {
            addr: 0x1_0000_1000,
            len: 32,
        };
        let mut words = Vec::new();
        encode_digest(&mut words, EngineId::Sha, ShaAlgorithm::Sha256, &src, out).unwrap();
        let base = regs::window_base(EngineId::Sha);
        let length_op = opcode_incr(base + reg::MSG_LENGTH, 8);
        assert_eq!(words.iter().filter(|w| **w == length_op).count(), 1);
        assert_eq!(&words[1..9], &[536, 0, 0, 0, 536, 0, 0, 0]);
        assert_eq!(words[9], opcode_incr(base + reg::CONFIG, 6));
        assert_eq!(words[17], regs::operation_word(OpCode::Start, false));
        assert_eq!(words[18], opcode_incr(base + reg::IN_ADDR, 2));
        assert_eq!(words[22], regs::operation_word(OpCode::RestartIn, true));
        assert_eq!(words.len(), 23);
    }

    #[test]
    fn wide_lengths_split_into_hi_word() {
        let src = [LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 0x00ff_ffff,
        }; 64];
        let out = LinkedListDescriptor {
            addr: 0x2_0000_0000,
            len: 64,
        };
        let mut words = Vec::new();
        encode_digest(&mut words, EngineId::Sha, ShaAlgorithm::Sha512, &src, out).unwrap();
        let bits = 64u64 * 0x00ff_ffff * 8;
        assert_eq!(words[1], bits as u32);
        assert_eq!(words[2], (bits >> 32) as u32);
    }

    #[test]
    fn hashing_on_cipher_engine_fails() {
        let desc = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 32,
        };
        let mut words = Vec::new();
        assert!(encode_digest(&mut words, EngineId::Aes1, ShaAlgorithm::Sha1, &[desc], desc).is_err());
    }
}
