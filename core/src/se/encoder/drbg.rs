/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::{Error, Result};
use crate::host::dma::LinkedListDescriptor;
use crate::se::encoder::aes::{BulkOp, encode_bulk};
use crate::se::encoder::{CommandSink, write_nonincr};
use crate::se::protocol::{DRBG_BLOCK_SIZE, EngineId, OpMode};
use crate::se::regs::{self, RngMode, aes as reg};

/// Blocks generated by one submission.
pub const DRBG_BLOCKS_PER_SUBMIT: usize = 256;

/// Generates `out.len` bytes (a multiple of the block size) into `out`.
///
/// `seed` is the 16-byte DT input block; each output block is its own chunk.
pub fn encode_generate<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    mode: RngMode,
    reseed_interval: u32,
    seed: LinkedListDescriptor,
    out: LinkedListDescriptor,
) -> Result<usize> {
    engine.check(OpMode::Drbg)?;
    let blocks = out.len / DRBG_BLOCK_SIZE;
    if out.len % DRBG_BLOCK_SIZE != 0 || blocks == 0 || blocks > DRBG_BLOCKS_PER_SUBMIT {
        return Err(Error::Internal(format!("DRBG output of {} bytes", out.len)));
    }
    if seed.len != DRBG_BLOCK_SIZE {
        return Err(Error::Internal(format!("DRBG seed block of {} bytes", seed.len)));
    }

    let start = sink.len();
    write_nonincr(sink, engine, reg::RNG_CONFIG, regs::rng_config_word(mode))?;
    write_nonincr(sink, engine, reg::RNG_RESEED_INTERVAL, reseed_interval)?;
    let src = vec![seed; blocks];
    let dst: Vec<_> = (0..blocks)
        .map(|i| LinkedListDescriptor {
            addr: out.addr + (i * DRBG_BLOCK_SIZE) as u64,
            len: DRBG_BLOCK_SIZE,
        })
        .collect();
    encode_bulk(sink, engine, &BulkOp::drbg(), &src, &dst)?;
    Ok(sink.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::regs::OpCode;

    #[test]
    fn block_per_chunk_with_restart_out() {
        let seed = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 16,
        };
        let out = LinkedListDescriptor {
            addr: 0x1_0000_1000,
            len: 48,
        };
        let mut words = Vec::new();
        encode_generate(&mut words, EngineId::Aes0, RngMode::ForceReseed, 7, seed, out).unwrap();
        assert_eq!(words[1], regs::rng_config_word(RngMode::ForceReseed));
        assert_eq!(words[3], 7);
        let ops: Vec<u32> = words
            .iter()
            .copied()
            .filter(|w| {
                *w == regs::operation_word(OpCode::RestartOut, false)
                    || *w == regs::operation_word(OpCode::RestartOut, true)
            })
            .collect();
        assert_eq!(ops.len(), 2);
        assert_eq!(*words.last().unwrap(), regs::operation_word(OpCode::RestartOut, true));
    }

    #[test]
    fn drbg_lives_on_aes0_only() {
        let seed = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 16,
        };
        let mut words = Vec::new();
        assert!(encode_generate(&mut words, EngineId::Aes1, RngMode::Normal, 1, seed, seed).is_err());
        assert!(encode_generate(&mut words, EngineId::Aes0, RngMode::Normal, 1, seed, LinkedListDescriptor { addr: 0x1_0000_0000, len: 20 }).is_err());
    }
}
