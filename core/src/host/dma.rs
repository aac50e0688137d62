/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::host::utilities::lock;

pub type DeviceAddr = u64;

/// Start of the device-visible window. Above 4 GiB so the high address bits get used.
const DEVICE_BASE: DeviceAddr = 0x1_0000_0000;
const DMA_ALIGN: u64 = 64;
/// Descriptors carry 40-bit addresses.
const DEVICE_ADDR_MASK: DeviceAddr = (1 << 40) - 1;

type Backing = Arc<Mutex<Vec<u8>>>;

/// Host model of the bus mapping layer: hands out device addresses for
/// buffers and resolves accesses made by the accelerator.
#[derive(Debug)]
pub struct DeviceMemory {
    regions: Mutex<BTreeMap<DeviceAddr, Backing>>,
    next: AtomicU64,
}

impl DeviceMemory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(DEVICE_BASE),
        })
    }

    /// Maps a zero-filled buffer of `len` bytes.
    pub fn alloc(&self, len: usize) -> Result<DmaBuffer> {
        self.map(&vec![0u8; len])
    }

    /// Maps a copy of `data` into device-visible memory.
    pub fn map(&self, data: &[u8]) -> Result<DmaBuffer> {
        let span = (data.len() as u64).max(1).div_ceil(DMA_ALIGN) * DMA_ALIGN;
        let addr = self.next.fetch_add(span, Ordering::Relaxed);
        if addr + span > DEVICE_ADDR_MASK {
            return Err(Error::fault("device address space exhausted"));
        }
        let data: Backing = Arc::new(Mutex::new(data.to_vec()));
        lock(&self.regions).insert(addr, Arc::clone(&data));
        Ok(DmaBuffer {
            addr,
            len: span_len(&data),
            data,
        })
    }

    pub fn unmap(&self, buf: &DmaBuffer) {
        lock(&self.regions).remove(&buf.addr);
    }

    pub fn mapped_count(&self) -> usize {
        lock(&self.regions).len()
    }

    fn resolve(&self, addr: DeviceAddr, len: usize) -> Result<(Backing, usize)> {
        let regions = lock(&self.regions);
        let (base, backing) = regions
            .range(..=addr)
            .next_back()
            .ok_or_else(|| Error::fault(format!("unmapped device address 0x{:010X}", addr)))?;
        let offset = (addr - base) as usize;
        if offset + len > span_len(backing) {
            return Err(Error::fault(format!(
                "access 0x{:010X}+{} runs past its mapping",
                addr, len
            )));
        }
        Ok((Arc::clone(backing), offset))
    }

    pub fn read(&self, addr: DeviceAddr, len: usize) -> Result<Vec<u8>> {
        let (backing, offset) = self.resolve(addr, len)?;
        let data = lock(&backing);
        Ok(data[offset..offset + len].to_vec())
    }

    pub fn write(&self, addr: DeviceAddr, bytes: &[u8]) -> Result<()> {
        let (backing, offset) = self.resolve(addr, bytes.len())?;
        lock(&backing)[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

fn span_len(backing: &Backing) -> usize {
    lock(backing).len()
}

/// A device-mapped buffer. Clones share the same memory.
#[derive(Clone)]
pub struct DmaBuffer {
    addr: DeviceAddr,
    len: usize,
    data: Backing,
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DmaBuffer(0x{:010X}, {} bytes)", self.addr, self.len)
    }
}

impl DmaBuffer {
    pub fn addr(&self) -> DeviceAddr {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }

    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let data = lock(&self.data);
        data.get(offset..offset + len)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Error::Internal(format!("read {}+{} past {:?}", offset, len, self)))
    }

    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut data = lock(&self.data);
        let dst = data
            .get_mut(offset..offset + bytes.len())
            .ok_or_else(|| Error::Internal(format!("write {}+{} past buffer", offset, bytes.len())))?;
        dst.copy_from_slice(bytes);
        Ok(())
    }

    pub fn descriptor(&self) -> LinkedListDescriptor {
        LinkedListDescriptor {
            addr: self.addr,
            len: self.len,
        }
    }

    pub fn sub_descriptor(&self, offset: usize, len: usize) -> LinkedListDescriptor {
        LinkedListDescriptor {
            addr: self.addr + offset as u64,
            len,
        }
    }
}

/// One contiguous device-visible segment used as a bulk source or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedListDescriptor {
    pub addr: DeviceAddr,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub enum Segment {
    Host(Vec<u8>),
    Device(DmaBuffer),
}

impl Segment {
    pub fn len(&self) -> usize {
        match self {
            Segment::Host(data) => data.len(),
            Segment::Device(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Caller buffer made of host and/or device-mapped segments.
#[derive(Debug, Clone, Default)]
pub struct ScatterList {
    segments: Vec<Segment>,
}

impl From<Vec<u8>> for ScatterList {
    fn from(data: Vec<u8>) -> Self {
        Self {
            segments: vec![Segment::Host(data)],
        }
    }
}

impl From<&[u8]> for ScatterList {
    fn from(data: &[u8]) -> Self {
        data.to_vec().into()
    }
}

impl From<DmaBuffer> for ScatterList {
    fn from(buf: DmaBuffer) -> Self {
        Self {
            segments: vec![Segment::Device(buf)],
        }
    }
}

impl ScatterList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits `data` into host segments of at most `chunk` bytes.
    pub fn from_chunks(data: &[u8], chunk: usize) -> Self {
        let segments = data
            .chunks(chunk.max(1))
            .map(|c| Segment::Host(c.to_vec()))
            .collect();
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn nents(&self) -> usize {
        self.segments.len()
    }

    /// Total payload bytes.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn segment_lengths(&self) -> Vec<usize> {
        self.segments.iter().map(Segment::len).collect()
    }

    /// The device buffers backing this list, if every segment is already mapped.
    pub fn device_segments(&self) -> Option<Vec<&DmaBuffer>> {
        self.segments
            .iter()
            .map(|s| match s {
                Segment::Device(buf) => Some(buf),
                Segment::Host(_) => None,
            })
            .collect()
    }

    /// Host segments with the same layout, zero-filled.
    pub fn zeroed_like(&self) -> Self {
        let segments = self
            .segments
            .iter()
            .map(|s| Segment::Host(vec![0u8; s.len()]))
            .collect();
        Self { segments }
    }

    /// Concatenates every segment.
    pub fn gather(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for segment in &self.segments {
            match segment {
                Segment::Host(data) => out.extend_from_slice(data),
                Segment::Device(buf) => out.extend_from_slice(&buf.to_vec()),
            }
        }
        out
    }

    /// Spreads `data` over the segments in order.
    pub fn scatter(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.len() {
            return Err(Error::Internal(format!(
                "scatter of {} bytes into a {}-byte list",
                data.len(),
                self.len()
            )));
        }
        let mut rest = data;
        for segment in &mut self.segments {
            if rest.is_empty() {
                break;
            }
            let take = segment.len().min(rest.len());
            let (head, tail) = rest.split_at(take);
            match segment {
                Segment::Host(buf) => buf[..take].copy_from_slice(head),
                Segment::Device(buf) => buf.write_at(0, head)?,
            }
            rest = tail;
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_are_unique_and_high() {
        let mem = DeviceMemory::new();
        let a = mem.alloc(16).unwrap();
        let b = mem.alloc(1).unwrap();
        assert!(a.addr() >= DEVICE_BASE);
        assert!(b.addr() >= a.addr() + 16);
        assert_eq!(b.addr() % DMA_ALIGN, 0);
        assert_eq!(mem.mapped_count(), 2);
        mem.unmap(&a);
        assert_eq!(mem.mapped_count(), 1);
    }

    #[test]
    fn device_side_access_hits_the_buffer() {
        let mem = DeviceMemory::new();
        let buf = mem.map(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        mem.write(buf.addr() + 2, &[0xaa, 0xbb]).unwrap();
        assert_eq!(buf.to_vec(), vec![1, 2, 0xaa, 0xbb, 5, 6, 7, 8]);
        assert_eq!(mem.read(buf.addr() + 6, 2).unwrap(), vec![7, 8]);
        assert!(mem.read(buf.addr() + 6, 3).is_err());
        mem.unmap(&buf);
        assert!(mem.read(buf.addr(), 1).is_err());
    }

    #[test]
    fn scatter_follows_segment_layout() {
        let mem = DeviceMemory::new();
        let mut list = ScatterList::from_chunks(&[0u8; 5], 3);
        list.push(Segment::Device(mem.alloc(4).unwrap()));
        assert_eq!(list.segment_lengths(), vec![3, 2, 4]);
        list.scatter(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(list.gather(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert!(list.device_segments().is_none());
        assert!(list.scatter(&[0u8; 10]).is_err());
    }
}
