/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use crate::error::Result;
use crate::host::dma::LinkedListDescriptor;
use crate::host::utilities::xor_in_place;
use crate::se::encoder::aes::{BulkOp, KeyTarget, encode_bulk, load_key};
use crate::se::encoder::CommandSink;
use crate::se::protocol::{AES_BLOCK_SIZE, EngineId, KeyRef, OpMode};
use crate::se::regs::{Destination, IvSel};

/// Reduction constant for a 128-bit block.
const CMAC_RB: u8 = 0x87;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmacSubkeys {
    pub k1: [u8; AES_BLOCK_SIZE],
    pub k2: [u8; AES_BLOCK_SIZE],
}

/// Shifts a block left by one bit. Returns the shifted block and the bit that fell off.
fn left_shift_one_bit(input: &[u8; AES_BLOCK_SIZE]) -> ([u8; AES_BLOCK_SIZE], bool) {
    let mut out = [0u8; AES_BLOCK_SIZE];
    let mut carry = 0u8;
    for i in (0..AES_BLOCK_SIZE).rev() {
        out[i] = (input[i] << 1) | carry;
        carry = input[i] >> 7;
    }
    (out, carry != 0)
}

/// Derives K1/K2 from `l`, the encryption of the zero block under the CMAC key.
pub fn derive_subkeys(l: &[u8; AES_BLOCK_SIZE]) -> CmacSubkeys {
    let (mut k1, msb) = left_shift_one_bit(l);
    if msb {
        k1[AES_BLOCK_SIZE - 1] ^= CMAC_RB;
    }
    let (mut k2, msb) = left_shift_one_bit(&k1);
    if msb {
        k2[AES_BLOCK_SIZE - 1] ^= CMAC_RB;
    }
    CmacSubkeys { k1, k2 }
}

/// How a message of a given length is split between the two passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmacPlan {
    /// Whole blocks run through the first pass.
    pub blocks_to_process: usize,
    /// Final block is padded and masked with K2 (otherwise masked with K1).
    pub padded: bool,
    /// Message bytes that end up in the final block.
    pub last_block_bytes: usize,
}

impl CmacPlan {
    pub fn new(msg_len: usize) -> Self {
        let blocks = msg_len / AES_BLOCK_SIZE;
        if msg_len % AES_BLOCK_SIZE != 0 || blocks == 0 {
            Self {
                blocks_to_process: blocks,
                padded: true,
                last_block_bytes: msg_len % AES_BLOCK_SIZE,
            }
        } else {
            Self {
                blocks_to_process: blocks - 1,
                padded: false,
                last_block_bytes: AES_BLOCK_SIZE,
            }
        }
    }

    /// The final pass starts from the zero IV when nothing ran before it.
    pub fn use_original_iv(&self) -> bool {
        self.blocks_to_process == 0
    }

    pub fn head_len(&self) -> usize {
        self.blocks_to_process * AES_BLOCK_SIZE
    }

    /// Bytes staged for the request: the whole blocks then the prepared final block.
    pub fn payload_len(&self) -> usize {
        self.head_len() + AES_BLOCK_SIZE
    }
}

/// Builds the staged payload for `msg`.
pub fn prepare_payload(msg: &[u8], subkeys: &CmacSubkeys) -> (CmacPlan, Vec<u8>) {
    let plan = CmacPlan::new(msg.len());
    let head = plan.head_len();
    let mut payload = Vec::with_capacity(plan.payload_len());
    payload.extend_from_slice(&msg[..head]);

    let mut last = [0u8; AES_BLOCK_SIZE];
    last[..plan.last_block_bytes].copy_from_slice(&msg[head..head + plan.last_block_bytes]);
    if plan.padded {
        last[plan.last_block_bytes] = 0x80;
        xor_in_place(&mut last, &subkeys.k2);
    } else {
        xor_in_place(&mut last, &subkeys.k1);
    }
    payload.extend_from_slice(&last);
    (plan, payload)
}

/// Encodes both CMAC passes over a staged payload and writes the tag to `result`.
pub fn encode_cmac<S: CommandSink + ?Sized>(
    sink: &mut S,
    engine: EngineId,
    key: KeyRef,
    plan: &CmacPlan,
    payload: LinkedListDescriptor,
    result: LinkedListDescriptor,
) -> Result<usize> {
    engine.check(OpMode::Cmac)?;
    let start = sink.len();
    let zero_iv = [0u8; AES_BLOCK_SIZE];

    if plan.blocks_to_process > 0 {
        load_key(sink, engine, key.slot, KeyTarget::OriginalIv, &zero_iv, u8::MAX)?;
        let head = LinkedListDescriptor {
            addr: payload.addr,
            len: plan.head_len(),
        };
        let op = BulkOp::cmac(key, IvSel::Original, Destination::HashReg);
        encode_bulk(sink, engine, &op, &[head], &[])?;
    }

    let iv_sel = if plan.use_original_iv() {
        load_key(sink, engine, key.slot, KeyTarget::OriginalIv, &zero_iv, u8::MAX)?;
        IvSel::Original
    } else {
        IvSel::Updated
    };
    let last = LinkedListDescriptor {
        addr: payload.addr + plan.head_len() as u64,
        len: AES_BLOCK_SIZE,
    };
    let op = BulkOp::cmac(key, iv_sel, Destination::Memory);
    encode_bulk(sink, engine, &op, &[last], &[result])?;
    Ok(sink.len() - start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::se::protocol::KeyLength;
    use crate::se::regs::{CryptoConfig, window_base};
    use crate::se::regs::aes as reg;

    fn block(hex_str: &str) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(&hex::decode(hex_str).unwrap());
        out
    }

    fn rfc4493_subkeys() -> CmacSubkeys {
        derive_subkeys(&block("7df76b0c1ab899b33e42f047b91b546f"))
    }

    #[test]
    fn subkeys_match_rfc4493() {
        let keys = rfc4493_subkeys();
        assert_eq!(keys.k1, block("fbeed618357133667c85e08f7236a8de"));
        assert_eq!(keys.k2, block("f7ddac306ae266ccf90bc11ee46d513b"));
        assert_eq!(rfc4493_subkeys(), keys);
    }

    #[test]
    fn shift_carries_across_bytes() {
        let (out, msb) = left_shift_one_bit(&block("80000000000000000000000000000081"));
        assert!(msb);
        assert_eq!(out, block("00000000000000000000000000000102"));
    }

    #[test]
    fn plan_edges() {
        // Empty message: a single padded final block, zero IV.
        let empty = CmacPlan::new(0);
        assert_eq!((empty.blocks_to_process, empty.padded, empty.last_block_bytes), (0, true, 0));
        assert!(empty.use_original_iv());
        // Exactly one block: no padding, K1, zero IV.
        let one = CmacPlan::new(16);
        assert_eq!((one.blocks_to_process, one.padded, one.last_block_bytes), (0, false, 16));
        assert!(one.use_original_iv());
        let partial = CmacPlan::new(40);
        assert_eq!((partial.blocks_to_process, partial.padded, partial.last_block_bytes), (2, true, 8));
        assert!(!partial.use_original_iv());
        let whole = CmacPlan::new(64);
        assert_eq!((whole.blocks_to_process, whole.padded), (3, false));
    }

    #[test]
    fn empty_payload_is_pad_xor_k2() {
        let keys = rfc4493_subkeys();
        let (_, payload) = prepare_payload(&[], &keys);
        let mut expected = [0u8; 16];
        expected[0] = 0x80;
        xor_in_place(&mut expected, &keys.k2);
        assert_eq!(payload, expected.to_vec());
    }

    #[test]
    fn whole_block_payload_is_xor_k1() {
        let keys = rfc4493_subkeys();
        let msg = [0x5au8; 16];
        let (_, payload) = prepare_payload(&msg, &keys);
        let mut expected = msg;
        xor_in_place(&mut expected, &keys.k1);
        assert_eq!(payload, expected.to_vec());
    }

    fn encode(len: usize) -> Vec<u32> {
        let keys = rfc4493_subkeys();
        let msg: Vec<u8> = (0..len as u8).collect();
        let (plan, payload) = prepare_payload(&msg, &keys);
        let key = KeyRef {
            slot: 4,
            len: KeyLength::Aes128,
        };
        let payload_desc = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: payload.len(),
        };
        let result = LinkedListDescriptor {
            addr: 0x1_0000_1000,
            len: 16,
        };
        let mut words = Vec::new();
        encode_cmac(&mut words, EngineId::Aes1, key, &plan, payload_desc, result).unwrap();
        words
    }

    fn crypto_configs(words: &[u32]) -> Vec<CryptoConfig> {
        let config_op = crate::se::regs::opcode_incr(window_base(EngineId::Aes1) + reg::CONFIG, 6);
        words
            .windows(3)
            .filter(|w| w[0] == config_op)
            .filter_map(|w| CryptoConfig::decode(w[2]))
            .collect()
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(encode(40), encode(40));
        assert_eq!(encode(0), encode(0));
    }

    #[test]
    fn two_passes_only_when_blocks_precede_the_last() {
        let passes = crypto_configs(&encode(40));
        assert_eq!(passes.len(), 2);
        assert_eq!(passes[0].iv_sel, IvSel::Original);
        assert_eq!(passes[1].iv_sel, IvSel::Updated);
        assert!(passes.iter().all(|p| p.hash_enable));

        for len in [0, 16] {
            let passes = crypto_configs(&encode(len));
            assert_eq!(passes.len(), 1, "len {}", len);
            assert_eq!(passes[0].iv_sel, IvSel::Original);
        }
    }

    #[test]
    fn wrong_engine_is_rejected() {
        let plan = CmacPlan::new(16);
        let desc = LinkedListDescriptor {
            addr: 0x1_0000_0000,
            len: 16,
        };
        let key = KeyRef {
            slot: 4,
            len: KeyLength::Aes128,
        };
        let mut words = Vec::new();
        assert!(encode_cmac(&mut words, EngineId::Sha, key, &plan, desc, desc).is_err());
    }
}
