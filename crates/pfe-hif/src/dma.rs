//! DMA-visible memory as seen by the host CPU and by the HIF engine.
//!
//! The host side ([`DmaMemory`]) goes through the CPU data cache and therefore needs explicit
//! maintenance: buffers written by the host must be flushed before the hardware is told about
//! them, and buffers written by the hardware must be invalidated before the host reads them.
//! The device side ([`BusMaster`]) always sees memory as it is, never the CPU cache.
//!
//! [`HeapDma`] implements both sides over a heap arena. In non-coherent mode it keeps a
//! write-back model of the CPU cache so that a missing flush or invalidate shows up as stale data
//! in tests instead of passing by accident.

use std::collections::BTreeMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{HifError, Result};
use crate::lock;

/// 32-bit bus address as stored in descriptor `data`/`next` fields.
pub type DmaAddr = u32;

/// Minimum alignment of every DMA allocation. Matches the CPU cache line so that two allocations
/// never share a line.
pub const DMA_ALIGN: usize = 64;

/// Host view of DMA memory.
pub trait DmaMemory: Send + Sync {
    /// Allocates `len` zeroed bytes aligned to at least `align` (and [`DMA_ALIGN`]).
    fn alloc(&self, len: usize, align: usize) -> Result<DmaAddr>;

    fn free(&self, addr: DmaAddr);

    fn read(&self, addr: DmaAddr, buf: &mut [u8]);

    fn write(&self, addr: DmaAddr, buf: &[u8]);

    /// Writes back host modifications of `[addr, addr + len)` so the device can observe them.
    fn flush(&self, addr: DmaAddr, len: usize);

    /// Discards the host's cached view of `[addr, addr + len)`.
    fn invalidate(&self, addr: DmaAddr, len: usize);

    /// Orders every preceding memory access before every following one, as observed by the
    /// device.
    fn barrier(&self) {
        fence(Ordering::SeqCst);
    }

    fn read_vec(&self, addr: DmaAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf);
        buf
    }
}

/// Device (bus master) view of DMA memory. Used by the engine model.
pub trait BusMaster: Send + Sync {
    fn dma_read(&self, addr: DmaAddr, buf: &mut [u8]);
    fn dma_write(&self, addr: DmaAddr, buf: &[u8]);
}

impl<T: DmaMemory + ?Sized> DmaMemory for Arc<T> {
    fn alloc(&self, len: usize, align: usize) -> Result<DmaAddr> {
        (**self).alloc(len, align)
    }

    fn free(&self, addr: DmaAddr) {
        (**self).free(addr)
    }

    fn read(&self, addr: DmaAddr, buf: &mut [u8]) {
        (**self).read(addr, buf)
    }

    fn write(&self, addr: DmaAddr, buf: &[u8]) {
        (**self).write(addr, buf)
    }

    fn flush(&self, addr: DmaAddr, len: usize) {
        (**self).flush(addr, len)
    }

    fn invalidate(&self, addr: DmaAddr, len: usize) {
        (**self).invalidate(addr, len)
    }

    fn barrier(&self) {
        (**self).barrier()
    }
}

impl<T: BusMaster + ?Sized> BusMaster for Arc<T> {
    fn dma_read(&self, addr: DmaAddr, buf: &mut [u8]) {
        (**self).dma_read(addr, buf)
    }

    fn dma_write(&self, addr: DmaAddr, buf: &[u8]) {
        (**self).dma_write(addr, buf)
    }
}

const CACHE_LINE: usize = DMA_ALIGN;

/// Bus address of the first arena byte. Zero is never handed out.
const ARENA_BASE: DmaAddr = 0x1000;

#[derive(Clone)]
struct CacheLine {
    data: [u8; CACHE_LINE],
    /// One bit per byte written by the host and not yet flushed.
    dirty: u64,
}

struct HeapState {
    ram: Vec<u8>,
    next: usize,
    live: BTreeMap<usize, usize>,
    free_blocks: Vec<(usize, usize)>,
    /// `None` when host and device share a coherent view.
    cache: Option<BTreeMap<usize, CacheLine>>,
}

/// Heap-backed DMA arena shared between host code and the engine model.
///
/// Cloning is cheap; all clones refer to the same memory.
#[derive(Clone)]
pub struct HeapDma {
    state: Arc<Mutex<HeapState>>,
}

impl HeapDma {
    /// Arena of `capacity` bytes where the host view is always coherent with the device view.
    pub fn coherent(capacity: usize) -> Self {
        Self::with_cache(capacity, None)
    }

    /// Arena of `capacity` bytes behind a write-back host cache model.
    pub fn non_coherent(capacity: usize) -> Self {
        Self::with_cache(capacity, Some(BTreeMap::new()))
    }

    fn with_cache(capacity: usize, cache: Option<BTreeMap<usize, CacheLine>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HeapState {
                ram: vec![0u8; capacity],
                next: 0,
                live: BTreeMap::new(),
                free_blocks: Vec::new(),
                cache,
            })),
        }
    }

    /// Number of allocations not yet freed.
    pub fn live_allocations(&self) -> usize {
        lock(&self.state).live.len()
    }
}

impl HeapState {
    /// Translates a bus address range into an arena range, or `None` if any part falls outside.
    fn range(&self, addr: DmaAddr, len: usize) -> Option<core::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(ARENA_BASE)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.ram.len()).then_some(start..end)
    }

    fn line_span(range: &core::ops::Range<usize>) -> core::ops::Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        (range.start / CACHE_LINE)..(range.end - 1) / CACHE_LINE + 1
    }

    fn load_line(ram: &[u8], cache: &mut BTreeMap<usize, CacheLine>, line: usize) -> usize {
        let base = line * CACHE_LINE;
        cache.entry(line).or_insert_with(|| {
            let mut data = [0u8; CACHE_LINE];
            let end = (base + CACHE_LINE).min(ram.len());
            data[..end - base].copy_from_slice(&ram[base..end]);
            CacheLine { data, dirty: 0 }
        });
        base
    }

    fn cpu_read(&mut self, range: core::ops::Range<usize>, buf: &mut [u8]) {
        let Some(cache) = self.cache.as_mut() else {
            buf.copy_from_slice(&self.ram[range]);
            return;
        };
        for (i, pos) in range.enumerate() {
            let line = pos / CACHE_LINE;
            let base = Self::load_line(&self.ram, cache, line);
            buf[i] = cache[&line].data[pos - base];
        }
    }

    fn cpu_write(&mut self, range: core::ops::Range<usize>, buf: &[u8]) {
        let Some(cache) = self.cache.as_mut() else {
            self.ram[range].copy_from_slice(buf);
            return;
        };
        for (i, pos) in range.enumerate() {
            let line = pos / CACHE_LINE;
            let base = Self::load_line(&self.ram, cache, line);
            if let Some(entry) = cache.get_mut(&line) {
                entry.data[pos - base] = buf[i];
                entry.dirty |= 1u64 << (pos - base);
            }
        }
    }

    fn writeback(&mut self, range: core::ops::Range<usize>) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        for line in Self::line_span(&range) {
            let Some(entry) = cache.get_mut(&line) else {
                continue;
            };
            let base = line * CACHE_LINE;
            for off in 0..CACHE_LINE {
                if entry.dirty & (1u64 << off) != 0 && base + off < self.ram.len() {
                    self.ram[base + off] = entry.data[off];
                }
            }
            entry.dirty = 0;
        }
    }

    fn discard(&mut self, range: core::ops::Range<usize>) {
        let Some(cache) = self.cache.as_mut() else {
            return;
        };
        for line in Self::line_span(&range) {
            cache.remove(&line);
        }
    }
}

impl DmaMemory for HeapDma {
    fn alloc(&self, len: usize, align: usize) -> Result<DmaAddr> {
        let align = align.max(DMA_ALIGN).next_power_of_two();
        let len = len.max(1);
        let mut state = lock(&self.state);

        let reuse = state
            .free_blocks
            .iter()
            .position(|&(off, size)| size >= len && off % align == 0);
        let (offset, size) = match reuse {
            Some(i) => state.free_blocks.swap_remove(i),
            None => {
                let offset = state
                    .next
                    .checked_add(align - 1)
                    .map(|v| v & !(align - 1))
                    .ok_or(HifError::OutOfMemory { len })?;
                let end = offset
                    .checked_add(len)
                    .filter(|&end| end <= state.ram.len())
                    .ok_or(HifError::OutOfMemory { len })?;
                let addr_end = u32::try_from(end)
                    .ok()
                    .and_then(|end| end.checked_add(ARENA_BASE));
                if addr_end.is_none() {
                    return Err(HifError::OutOfMemory { len });
                }
                state.next = end;
                (offset, len)
            }
        };

        state.ram[offset..offset + size].fill(0);
        state.discard(offset..offset + size);
        state.live.insert(offset, size);
        // Every block was checked against the 32-bit bus window when it was first carved out.
        Ok(ARENA_BASE + offset as u32)
    }

    fn free(&self, addr: DmaAddr) {
        let mut state = lock(&self.state);
        let offset = addr.checked_sub(ARENA_BASE).map(|off| off as usize);
        match offset.and_then(|off| state.live.remove(&off).map(|size| (off, size))) {
            Some(block) => state.free_blocks.push(block),
            None => tracing::warn!(addr, "free of unknown DMA block"),
        }
    }

    fn read(&self, addr: DmaAddr, buf: &mut [u8]) {
        let mut state = lock(&self.state);
        match state.range(addr, buf.len()) {
            Some(range) => state.cpu_read(range, buf),
            None => {
                tracing::warn!(addr, len = buf.len(), "DMA read out of bounds");
                buf.fill(0);
            }
        }
    }

    fn write(&self, addr: DmaAddr, buf: &[u8]) {
        let mut state = lock(&self.state);
        match state.range(addr, buf.len()) {
            Some(range) => state.cpu_write(range, buf),
            None => {
                tracing::warn!(addr, len = buf.len(), "DMA write out of bounds")
            }
        }
    }

    fn flush(&self, addr: DmaAddr, len: usize) {
        let mut state = lock(&self.state);
        if let Some(range) = state.range(addr, len) {
            state.writeback(range);
        }
    }

    fn invalidate(&self, addr: DmaAddr, len: usize) {
        let mut state = lock(&self.state);
        if let Some(range) = state.range(addr, len) {
            state.discard(range);
        }
    }
}

impl BusMaster for HeapDma {
    fn dma_read(&self, addr: DmaAddr, buf: &mut [u8]) {
        let state = lock(&self.state);
        match state.range(addr, buf.len()) {
            Some(range) => buf.copy_from_slice(&state.ram[range]),
            None => buf.fill(0),
        }
    }

    fn dma_write(&self, addr: DmaAddr, buf: &[u8]) {
        let mut state = lock(&self.state);
        if let Some(range) = state.range(addr, buf.len()) {
            state.ram[range].copy_from_slice(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_reused() {
        let dma = HeapDma::coherent(4096);
        let a = dma.alloc(10, 1).unwrap();
        let b = dma.alloc(100, 256).unwrap();
        assert_eq!(a as usize % DMA_ALIGN, 0);
        assert_eq!(b as usize % 256, 0);
        assert_eq!(dma.live_allocations(), 2);

        dma.write(a, &[0xAA; 10]);
        dma.free(a);
        let c = dma.alloc(8, 1).unwrap();
        assert_eq!(c, a);
        assert_eq!(dma.read_vec(c, 8), vec![0u8; 8]);
    }

    #[test]
    fn exhausting_the_arena_reports_out_of_memory() {
        let dma = HeapDma::coherent(256);
        dma.alloc(200, 1).unwrap();
        assert_eq!(dma.alloc(100, 1), Err(HifError::OutOfMemory { len: 100 }));
    }

    #[test]
    fn non_coherent_writes_need_a_flush() {
        let dma = HeapDma::non_coherent(4096);
        let addr = dma.alloc(64, 1).unwrap();
        dma.write(addr, &[1, 2, 3, 4]);

        let mut dev = [0u8; 4];
        dma.dma_read(addr, &mut dev);
        assert_eq!(dev, [0; 4]);

        dma.flush(addr, 4);
        dma.dma_read(addr, &mut dev);
        assert_eq!(dev, [1, 2, 3, 4]);
    }

    #[test]
    fn non_coherent_reads_need_an_invalidate() {
        let dma = HeapDma::non_coherent(4096);
        let addr = dma.alloc(64, 1).unwrap();
        assert_eq!(dma.read_vec(addr, 2), vec![0, 0]);

        dma.dma_write(addr, &[9, 9]);
        assert_eq!(dma.read_vec(addr, 2), vec![0, 0]);

        dma.invalidate(addr, 2);
        assert_eq!(dma.read_vec(addr, 2), vec![9, 9]);
    }

    #[test]
    fn flush_only_writes_back_bytes_the_host_touched() {
        let dma = HeapDma::non_coherent(4096);
        let addr = dma.alloc(64, 1).unwrap();
        assert_eq!(dma.read_vec(addr, 16), vec![0; 16]);

        dma.dma_write(addr + 8, &[7; 8]);
        dma.write(addr, &[5; 8]);
        dma.flush(addr, 64);

        let mut dev = [0u8; 16];
        dma.dma_read(addr, &mut dev);
        assert_eq!(&dev[..8], &[5; 8]);
        assert_eq!(&dev[8..], &[7; 8]);
    }
}
