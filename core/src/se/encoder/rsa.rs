/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};
use crate::host::dma::LinkedListDescriptor;
use crate::host::utilities::bytes_to_words_be;
use crate::se::encoder::{CommandSink, descriptor, write_incr, write_nonincr};
use crate::se::protocol::{EngineId, OpMode, RSA_MAX_BYTES, RSA_MIN_BYTES};
use crate::se::regs::{self, ALG_NOP, ALG_RSA, Config, Destination, OpCode, RsaKeyKind, rsa as reg};

/// Checks a key against what the RSA engine can hold. Lengths are in bytes.
pub fn validate_key(mod_len: usize, exp_len: usize) -> Result<()> {
    let units = mod_len / 64;
    if mod_len % 64 != 0 || !(1..=4).contains(&units) {
        return Err(Error::config(format!(
            "RSA modulus of {} bits is not supported",
            mod_len * 8
        )));
    }
    if exp_len == 0 || exp_len > mod_len {
        return Err(Error::config(format!(
            "RSA exponent of {} bytes does not fit a {}-byte modulus",
            exp_len, mod_len
        )));
    }
    Ok(())
}

pub fn validate_input(mod_len: usize, input_len: usize) -> Result<()> {
    if !(RSA_MIN_BYTES..=RSA_MAX_BYTES).contains(&input_len) {
        return Err(Error::config(format!(
            "RSA input of {} bytes outside {}..={}",
            input_len, RSA_MIN_BYTES, RSA_MAX_BYTES
        )));
    }
    if input_len != mod_len {
        return Err(Error::config(format!(
            "RSA input of {} bytes for a {}-byte modulus",
            input_len, mod_len
        )));
    }
    Ok(())
}

/// Exponent length as the engine sees it, padded to whole words.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

/// Loads modulus and exponent (big-endian byte strings) into an RSA key slot.
pub fn encode_set_key<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    slot: u8,
    modulus: &[u8],
    exponent: &[u8],
) -> Result<usize> {
    engine.check(OpMode::Rsa)?;
    validate_key(modulus.len(), padded_len(exponent.len()))?;

    let start = sink.len();
    write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Dummy, false))?;
    for (kind, data) in [(RsaKeyKind::Exponent, exponent), (RsaKeyKind::Modulus, modulus)] {
        let words = bytes_to_words_be(data);
        let n = words.len();
        // Most significant word first, into the highest word address.
        for (i, word) in words.iter().enumerate() {
            let addr = regs::rsa_keytable_addr(slot, kind, n - 1 - i);
            write_nonincr(sink, engine, reg::KEYTABLE_ADDR, addr)?;
            write_incr(sink, engine, reg::KEYTABLE_DATA, &[*word])?;
        }
    }
    write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Dummy, true))?;
    Ok(sink.len() - start)
}

pub fn rsa_config() -> u32 {
    Config {
        enc_alg: ALG_RSA,
        dec_alg: ALG_NOP,
        enc_mode: 0,
        dec_mode: 0,
        dst: Destination::Memory,
    }
    .encode()
}

/// One modular exponentiation of `src` with the key in `slot`, result to `dst`.
pub fn encode_rsa_op<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    slot: u8,
    mod_len: usize,
    exp_len: usize,
    src: LinkedListDescriptor,
    dst: LinkedListDescriptor,
) -> Result<usize> {
    engine.check(OpMode::Rsa)?;
    validate_key(mod_len, exp_len)?;
    validate_input(mod_len, src.len)?;
    if dst.len < mod_len {
        return Err(Error::Internal(format!(
            "{}-byte RSA result buffer for a {}-byte modulus",
            dst.len, mod_len
        )));
    }

    let start = sink.len();
    let [in_lo, in_hi] = descriptor(&src)?;
    let [out_lo, out_hi] = descriptor(&dst)?;
    write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Dummy, false))?;
    write_incr(
        sink,
        engine,
        reg::CONFIG,
        &[
            rsa_config(),
            slot as u32,
            (mod_len / 64 - 1) as u32,
            (exp_len / 4) as u32,
            in_lo,
            in_hi,
        ],
    )?;
    write_incr(sink, engine, reg::OUT_ADDR, &[out_lo, out_hi])?;
    write_nonincr(sink, engine, reg::OPERATION, regs::operation_word(OpCode::Start, true))?;
    Ok(sink.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sizes() {
        for mod_len in [64, 128, 192, 256] {
            validate_key(mod_len, 4).unwrap();
        }
        assert!(validate_key(32, 4).is_err());
        assert!(validate_key(320, 4).is_err());
        assert!(validate_key(100, 4).is_err());
        assert!(validate_key(64, 68).is_err());
        assert!(validate_key(64, 0).is_err());
    }

    #[test]
    fn input_length_must_match_modulus() {
        validate_input(128, 128).unwrap();
        assert!(validate_input(128, 64).is_err());
        assert!(validate_input(32, 32).is_err());
    }

    #[test]
    fn key_words_go_most_significant_first() {
        let modulus: Vec<u8> = (1..=64).collect();
        let exponent = [0x01, 0x00, 0x01];
        let mut words = Vec::new();
        let n = encode_set_key(&mut words, EngineId::Rsa, 1, &modulus, &exponent).unwrap();
        assert_eq!(n, 2 + 4 * (1 + 16) + 2);
        // Exponent: one word, address 0.
        assert_eq!(words[3], regs::rsa_keytable_addr(1, RsaKeyKind::Exponent, 0));
        assert_eq!(words[5], 0x0001_0001);
        // Modulus: first written word is the top one.
        assert_eq!(words[7], regs::rsa_keytable_addr(1, RsaKeyKind::Modulus, 15));
        assert_eq!(words[9], 0x0102_0304);
        let last_data = words[words.len() - 3];
        assert_eq!(last_data, 0x3d3e_3f40);
        assert_eq!(words[words.len() - 1], regs::operation_word(OpCode::Dummy, true));
    }

    #[test]
    fn op_derives_sizes_from_key() {
        let src = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 256,
        };
        let dst = LinkedListDescriptor {
            addr: 0x1_0000_1000,
            len: 256,
        };
        let mut words = Vec::new();
        encode_rsa_op(&mut words, EngineId::Rsa, 0, 256, 4, src, dst).unwrap();
        assert_eq!(&words[3..7], &[rsa_config(), 0, 3, 1]);
        assert!(encode_rsa_op(&mut words, EngineId::Aes1, 0, 256, 4, src, dst).is_err());
    }
}
