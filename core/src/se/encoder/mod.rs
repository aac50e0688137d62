/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Pure translation of logical operations into command words.
//!
//! Every encoder appends to a caller supplied [`CommandSink`] and returns the
//! number of words it wrote.
pub mod aes;
pub mod cmac;
pub mod drbg;
pub mod rsa;
pub mod sha;

use crate::error::{Error, Result};
use crate::host::dma::LinkedListDescriptor;
use crate::se::protocol::{EngineId, OpMode};
use crate::se::regs::{self, OpCode};

pub use aes::{BulkOp, KeyTarget};
pub use cmac::{CmacPlan, CmacSubkeys};

/// Destination for encoded command words.
pub trait CommandSink {
    fn push(&mut self, word: u32) -> Result<()>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&mut self, words: &[u32]) -> Result<()> {
        for word in words {
            self.push(*word)?;
        }
        Ok(())
    }
}

impl CommandSink for Vec<u32> {
    fn push(&mut self, word: u32) -> Result<()> {
        Vec::push(self, word);
        Ok(())
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

/// Writes `data` to consecutive registers starting at `offset` in the engine window.
pub(crate) fn write_incr<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    offset: u32,
    data: &[u32],
) -> Result<()> {
    sink.push(regs::opcode_incr(
        regs::window_base(engine) + offset,
        data.len() as u32,
    ))?;
    sink.extend(data)
}

pub(crate) fn write_nonincr<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    offset: u32,
    value: u32,
) -> Result<()> {
    sink.push(regs::opcode_nonincr(regs::window_base(engine) + offset, 1))?;
    sink.push(value)
}

/// Trailer that makes the command processor bump `syncpt` once everything before it retired.
pub fn incr_syncpt<S: CommandSink + ?Sized>(sink: &mut S, syncpt: u32) -> Result<usize> {
    sink.push(regs::opcode_nonincr(regs::HOST_INCR_SYNCPT, 1))?;
    sink.push(regs::incr_syncpt_word(syncpt))?;
    Ok(2)
}

/// Op used by every chunk after the first one.
pub fn restart_op(mode: OpMode) -> OpCode {
    match mode {
        OpMode::Cmac | OpMode::Sha(_) => OpCode::RestartIn,
        OpMode::Drbg => OpCode::RestartOut,
        OpMode::Cbc | OpMode::Ecb | OpMode::Ctr | OpMode::Ofb | OpMode::Rsa => {
            OpCode::RestartInOut
        }
    }
}

pub(crate) fn descriptor(desc: &LinkedListDescriptor) -> Result<[u32; 2]> {
    if desc.len > regs::MAX_DESCRIPTOR_LEN {
        return Err(Error::config(format!(
            "segment of {} bytes exceeds the descriptor limit",
            desc.len
        )));
    }
    Ok(regs::descriptor_words(desc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syncpt_trailer() {
        let mut words = Vec::new();
        assert_eq!(incr_syncpt(&mut words, 0x21).unwrap(), 2);
        assert_eq!(words, vec![0x2000_0001, 0x0000_0121]);
    }

    #[test]
    fn restart_ops_follow_data_direction() {
        assert_eq!(restart_op(OpMode::Cmac), OpCode::RestartIn);
        assert_eq!(restart_op(OpMode::Drbg), OpCode::RestartOut);
        assert_eq!(restart_op(OpMode::Cbc), OpCode::RestartInOut);
    }

    #[test]
    fn oversized_descriptor_rejected() {
        let desc = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: regs::MAX_DESCRIPTOR_LEN + 1,
        };
        assert!(descriptor(&desc).is_err());
    }
}
