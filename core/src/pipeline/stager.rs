/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::error::{Error, Exhaustion, Result};
use crate::host::dma::{DeviceMemory, DmaBuffer, LinkedListDescriptor, ScatterList};
use crate::host::utilities::round_up;
use crate::pipeline::request::{Operation, PendingRequest};
use crate::se::encoder::CmacPlan;
use crate::se::encoder::cmac::prepare_payload;
use crate::se::protocol::AES_BLOCK_SIZE;
use crate::se::regs::MAX_DESCRIPTOR_LEN;

/// Largest block-aligned span one descriptor may cover.
pub const MAX_CHUNK: usize = MAX_DESCRIPTOR_LEN & !(AES_BLOCK_SIZE - 1);
const REGION_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLimits {
    pub max_src: usize,
    pub max_dst: usize,
}

impl SegmentLimits {
    fn check(count: usize, max: usize) -> Result<()> {
        if count > max {
            return Err(Exhaustion::TooManySegments { count, max }.into());
        }
        Ok(())
    }
}

/// Descriptors of one request inside a staged batch.
#[derive(Debug, Clone)]
pub struct StagedRequest {
    pub src: Vec<LinkedListDescriptor>,
    pub dst: Vec<LinkedListDescriptor>,
    pub cmac: Option<CmacPlan>,
    /// Where the result sits in the bounce buffer.
    output: Option<(usize, usize)>,
}

/// Device view of a batch. The bounce mapping is released exactly once, by
/// [`StagedBatch::unstage`] or on drop.
pub struct StagedBatch {
    memory: Arc<DeviceMemory>,
    bounce: Option<DmaBuffer>,
    requests: Vec<StagedRequest>,
    unstaged: bool,
}

impl fmt::Debug for StagedBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StagedBatch")
            .field("bounce", &self.bounce)
            .field("requests", &self.requests.len())
            .field("unstaged", &self.unstaged)
            .finish()
    }
}

impl StagedBatch {
    pub fn requests(&self) -> &[StagedRequest] {
        &self.requests
    }

    pub fn is_zero_copy(&self) -> bool {
        self.bounce.is_none()
    }

    pub fn bounce_len(&self) -> usize {
        self.bounce.as_ref().map_or(0, DmaBuffer::len)
    }

    /// Result bytes of request `index`. `None` when the engine wrote straight
    /// into the caller's buffers.
    pub fn output(&self, index: usize) -> Result<Option<Vec<u8>>> {
        let region = self.requests.get(index).and_then(|r| r.output);
        match (&self.bounce, region) {
            (Some(bounce), Some((offset, len))) => bounce.read_at(offset, len).map(Some),
            _ => Ok(None),
        }
    }

    pub fn unstage(&mut self) {
        if self.unstaged {
            return;
        }
        self.unstaged = true;
        if let Some(bounce) = &self.bounce {
            self.memory.unmap(bounce);
        }
    }
}

impl Drop for StagedBatch {
    fn drop(&mut self) {
        self.unstage();
    }
}

fn chunked(base: &DmaBuffer, offset: usize, len: usize) -> Vec<LinkedListDescriptor> {
    (0..len)
        .step_by(MAX_CHUNK)
        .map(|at| base.sub_descriptor(offset + at, MAX_CHUNK.min(len - at)))
        .collect()
}

/// Zero-copy is only possible for a lone cipher request whose buffers are all
/// device mapped, block aligned and laid out the same way on both sides.
fn zero_copy(request: &PendingRequest) -> Option<StagedRequest> {
    if !matches!(request.op, Operation::Cipher { .. }) {
        return None;
    }
    let src = request.src.device_segments()?;
    let fits = |b: &&DmaBuffer| b.len() % AES_BLOCK_SIZE == 0 && b.len() <= MAX_CHUNK && !b.is_empty();
    if !src.iter().all(fits) {
        return None;
    }
    let src: Vec<_> = src.iter().map(|b| b.descriptor()).collect();
    let dst = match &request.dst {
        None => src.clone(),
        Some(list) => {
            if list.segment_lengths() != request.src.segment_lengths() {
                return None;
            }
            list.device_segments()?.iter().map(|b| b.descriptor()).collect()
        }
    };
    Some(StagedRequest {
        src,
        dst,
        cmac: None,
        output: None,
    })
}

/// Maps a batch for the engine. Fails before touching device memory if any
/// request carries more segments than the engine can describe.
pub fn stage(
    memory: &Arc<DeviceMemory>,
    requests: &[PendingRequest],
    limits: SegmentLimits,
) -> Result<StagedBatch> {
    for request in requests {
        SegmentLimits::check(request.src.nents(), limits.max_src)?;
        if let Some(dst) = &request.dst {
            SegmentLimits::check(dst.nents(), limits.max_dst)?;
            if dst.len() != request.src.len() {
                return Err(Error::config(format!(
                    "destination of {} bytes for a {}-byte source",
                    dst.len(),
                    request.src.len()
                )));
            }
        }
    }

    if let [only] = requests {
        if let Some(staged) = zero_copy(only) {
            debug!("Staged zero-copy request ({} segments)", staged.src.len());
            return Ok(StagedBatch {
                memory: Arc::clone(memory),
                bounce: None,
                requests: vec![staged],
                unstaged: true,
            });
        }
    }

    // Lay out every input, then its result region, in one bounce buffer.
    let mut image = Vec::new();
    let mut layout = Vec::with_capacity(requests.len());
    for request in requests {
        let (input, plan) = match &request.op {
            Operation::Cmac { subkeys, .. } => {
                let (plan, payload) = prepare_payload(&request.src.gather(), subkeys);
                (payload, Some(plan))
            }
            _ => (request.src.gather(), None),
        };
        let in_offset = image.len();
        let in_len = input.len();
        image.extend_from_slice(&input);
        image.resize(round_up(image.len(), REGION_ALIGN), 0);

        let out = match request.op.result_len() {
            None => None,
            Some(len) => {
                let offset = image.len();
                image.resize(round_up(offset + len, REGION_ALIGN), 0);
                Some((offset, len))
            }
        };
        layout.push((in_offset, in_len, out, plan));
    }

    let bounce = memory.map(&image)?;
    let mut staged = Vec::with_capacity(layout.len());
    for (in_offset, in_len, out, plan) in layout {
        let src = chunked(&bounce, in_offset, in_len);
        let (dst, output) = match out {
            // Ciphers run in place.
            None => (src.clone(), Some((in_offset, in_len))),
            Some((offset, len)) => (vec![bounce.sub_descriptor(offset, len)], Some((offset, len))),
        };
        let within = SegmentLimits::check(src.len(), limits.max_src)
            .and_then(|_| SegmentLimits::check(dst.len(), limits.max_dst));
        if let Err(err) = within {
            memory.unmap(&bounce);
            return Err(err);
        }
        staged.push(StagedRequest {
            src,
            dst,
            cmac: plan,
            output,
        });
    }
    debug!(
        "Staged {} requests through a {}-byte bounce buffer",
        staged.len(),
        bounce.len()
    );
    Ok(StagedBatch {
        memory: Arc::clone(memory),
        bounce: Some(bounce),
        requests: staged,
        unstaged: false,
    })
}

/// Copies a cipher result into the caller's destination list (or a fresh list
/// shaped like the source).
pub fn write_back(request: &mut PendingRequest, bytes: &[u8]) -> Result<ScatterList> {
    let mut dst = match request.dst.take() {
        Some(list) => list,
        None => request.src.zeroed_like(),
    };
    dst.scatter(bytes)?;
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::dma::Segment;
    use crate::se::encoder::cmac::derive_subkeys;
    use crate::se::protocol::{
        CipherMode, Direction, IvPolicy, KeyLength, KeyRef, ShaAlgorithm,
    };

    const LIMITS: SegmentLimits = SegmentLimits {
        max_src: 4,
        max_dst: 4,
    };

    fn cbc() -> Operation {
        Operation::Cipher {
            mode: CipherMode::Cbc,
            direction: Direction::Encrypt,
            key: KeyRef {
                slot: 1,
                len: KeyLength::Aes128,
            },
            iv: IvPolicy::Explicit([0u8; 16]),
        }
    }

    fn request(op: Operation, src: ScatterList) -> PendingRequest {
        let (mut req, _completion) = PendingRequest::new(op, src, None);
        req.fail(Error::InProgress);
        req
    }

    #[test]
    fn too_many_segments_fails_before_mapping() {
        let mem = DeviceMemory::new();
        let req = request(cbc(), ScatterList::from_chunks(&[0u8; 80], 16));
        let err = stage(&mem, &[req], LIMITS).unwrap_err();
        assert_eq!(
            err,
            Error::ResourceExhausted(Exhaustion::TooManySegments { count: 5, max: 4 })
        );
        assert_eq!(mem.mapped_count(), 0);
    }

    #[test]
    fn lone_device_cipher_goes_zero_copy() {
        let mem = DeviceMemory::new();
        let a = mem.alloc(32).unwrap();
        let b = mem.alloc(16).unwrap();
        let mut list = ScatterList::from(a.clone());
        list.push(Segment::Device(b.clone()));
        let before = mem.mapped_count();
        let batch = stage(&mem, &[request(cbc(), list)], LIMITS).unwrap();
        assert!(batch.is_zero_copy());
        assert_eq!(mem.mapped_count(), before);
        let staged = &batch.requests()[0];
        assert_eq!(staged.src, vec![a.descriptor(), b.descriptor()]);
        assert_eq!(staged.dst, staged.src);
        assert_eq!(batch.output(0).unwrap(), None);
    }

    #[test]
    fn coalesced_batch_uses_one_bounce_buffer() {
        let mem = DeviceMemory::new();
        let first = request(cbc(), ScatterList::from_chunks(&[1u8; 32], 16));
        let second = request(cbc(), vec![2u8; 16].into());
        let mut batch = stage(&mem, &[first, second], LIMITS).unwrap();
        assert!(!batch.is_zero_copy());
        assert_eq!(mem.mapped_count(), 1);
        let r = batch.requests();
        assert_eq!(r[0].src.len(), 1);
        assert_eq!(r[0].src[0].len, 32);
        assert_eq!(r[1].src[0].addr, r[0].src[0].addr + 64);
        assert_eq!(batch.output(1).unwrap(), Some(vec![2u8; 16]));
        batch.unstage();
        batch.unstage();
        assert_eq!(mem.mapped_count(), 0);
    }

    #[test]
    fn digest_gets_a_separate_result_region() {
        let mem = DeviceMemory::new();
        let req = request(
            Operation::Digest {
                alg: ShaAlgorithm::Sha384,
            },
            vec![0x61u8; 3].into(),
        );
        let batch = stage(&mem, &[req], LIMITS).unwrap();
        let r = &batch.requests()[0];
        assert_eq!(r.src[0].len, 3);
        assert_eq!(r.dst[0].len, 48);
        assert_ne!(r.src[0].addr, r.dst[0].addr);
        drop(batch);
        assert_eq!(mem.mapped_count(), 0);
    }

    #[test]
    fn cmac_stages_the_prepared_payload() {
        let mem = DeviceMemory::new();
        let subkeys = derive_subkeys(&[0x11u8; 16]);
        let op = Operation::Cmac {
            key: KeyRef {
                slot: 2,
                len: KeyLength::Aes128,
            },
            subkeys,
        };
        let batch = stage(&mem, &[request(op, vec![0u8; 40].into())], LIMITS).unwrap();
        let r = &batch.requests()[0];
        let plan = r.cmac.unwrap();
        assert_eq!(plan.blocks_to_process, 2);
        assert_eq!(r.src[0].len, plan.payload_len());
        assert_eq!(r.dst[0].len, 16);
    }

    #[test]
    fn mismatched_destination_is_rejected() {
        let mem = DeviceMemory::new();
        let (mut req, _c) = PendingRequest::new(cbc(), vec![0u8; 32].into(), Some(vec![0u8; 16].into()));
        req.fail(Error::InProgress);
        assert!(matches!(
            stage(&mem, &[req], LIMITS),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn write_back_follows_destination_layout() {
        let mut req = request(cbc(), ScatterList::from_chunks(&[0u8; 32], 8));
        let out = write_back(&mut req, &[7u8; 32]).unwrap();
        assert_eq!(out.segment_lengths(), vec![8, 8, 8, 8]);
        assert_eq!(out.gather(), vec![7u8; 32]);
    }
}
