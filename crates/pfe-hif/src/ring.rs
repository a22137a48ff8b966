//! One directional HIF descriptor ring.
//!
//! The ring is an arena of `len` BD/WB-BD pairs allocated once at creation and addressed only by
//! slot index. `write_idx` and `read_idx` are free-running `u32` counters; the slot of an index is
//! `index & (len - 1)`, which stays correct across counter wrap-around because `len` is a power of
//! two.
//!
//! Slot ownership:
//!
//! - TX: slots in `[read_idx, write_idx)` are owned by hardware (BD `DESC_EN` set). `submit_tx`
//!   hands two slots over per frame; `reclaim_tx` takes them back once their WB-BD reports
//!   completion.
//! - RX: slots in `[read_idx, write_idx + len)` are armed for hardware. `claim_rx` takes the slot
//!   at `read_idx` once hardware filled it; `rearm_rx` returns a buffer at `write_idx`.
//!
//! Every ownership flip is written as: descriptor fields (flushed), then a barrier, then the
//! ownership bit (flushed).

use std::time::Duration;

use pfe_ct::HIF_HEADER_SIZE;
use tracing::{debug, warn};

use crate::desc::{BdCtrl, BufferDesc, WbCtrl, WbDesc, WB_INITIAL_SEQNUM};
use crate::dma::{DmaAddr, DmaMemory, DMA_ALIGN};
use crate::error::{HifError, Result};
use crate::header::TxHeader;
use crate::poll::poll_timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingDirection {
    Tx,
    Rx,
}

/// Where a ring's descriptor arrays live. This is what gets programmed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingLayout {
    pub direction: RingDirection,
    pub len: u32,
    pub bd_base: DmaAddr,
    pub wb_base: DmaAddr,
}

impl RingLayout {
    pub fn slot(&self, index: u32) -> usize {
        (index & (self.len - 1)) as usize
    }

    pub fn bd_addr(&self, slot: usize) -> DmaAddr {
        debug_assert!(slot < self.len as usize);
        self.bd_base + (slot * BufferDesc::SIZE) as u32
    }

    pub fn wb_addr(&self, slot: usize) -> DmaAddr {
        debug_assert!(slot < self.len as usize);
        self.wb_base + (slot * WbDesc::SIZE) as u32
    }
}

/// A received packet buffer, detached from its ring slot until handed back with
/// [`HifRing::rearm_rx`].
#[must_use = "received buffers must be returned to the ring"]
#[derive(Debug, PartialEq, Eq)]
pub struct RxBuffer {
    addr: DmaAddr,
    capacity: usize,
    offset: usize,
    len: usize,
}

impl RxBuffer {
    /// Start of the whole buffer (the RX header, when present).
    pub fn addr(&self) -> DmaAddr {
        self.addr
    }

    /// Start of the bytes reported by [`len`](Self::len).
    pub fn data_addr(&self) -> DmaAddr {
        self.addr + self.offset as u32
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug)]
pub struct HifRing {
    layout: RingLayout,
    buffer_size: usize,
    /// Buffer currently attached to each slot. `None` while an RX buffer is out with the caller.
    buffers: Vec<Option<DmaAddr>>,
    /// Buffers that could not be re-armed; released with the ring.
    parked: Vec<DmaAddr>,
    write_idx: u32,
    read_idx: u32,
    seqnum: u16,
}

impl HifRing {
    /// Allocates and initializes a ring of `len` slots, each backed by a `buffer_size` byte
    /// buffer. RX slots start armed for hardware, TX slots start owned by the host.
    pub fn create<M: DmaMemory + ?Sized>(
        mem: &M,
        direction: RingDirection,
        len: usize,
        buffer_size: usize,
    ) -> Result<Self> {
        if len < 2 || !len.is_power_of_two() || len > usize::from(u16::MAX) {
            return Err(HifError::InvalidRingLength(len));
        }
        if buffer_size < HIF_HEADER_SIZE || buffer_size > usize::from(u16::MAX) {
            return Err(HifError::InvalidBufferSize(buffer_size));
        }

        let bd_base = mem.alloc(len * BufferDesc::SIZE, DMA_ALIGN)?;
        let wb_base = match mem.alloc(len * WbDesc::SIZE, DMA_ALIGN) {
            Ok(addr) => addr,
            Err(err) => {
                mem.free(bd_base);
                return Err(err);
            }
        };

        let mut ring = Self {
            layout: RingLayout {
                direction,
                len: len as u32,
                bd_base,
                wb_base,
            },
            buffer_size,
            buffers: vec![None; len],
            parked: Vec::new(),
            write_idx: 0,
            read_idx: 0,
            seqnum: 0,
        };

        for slot in 0..len {
            match mem.alloc(buffer_size, DMA_ALIGN) {
                Ok(addr) => ring.buffers[slot] = Some(addr),
                Err(err) => {
                    ring.release(mem);
                    return Err(err);
                }
            }
        }

        let mut bds = Vec::with_capacity(len * BufferDesc::SIZE);
        let mut wbs = Vec::with_capacity(len * WbDesc::SIZE);
        for (slot, buffer) in ring.buffers.iter().enumerate() {
            let mut bd = BufferDesc {
                seqnum: 0,
                ctrl: BdCtrl::CBD_INT_EN,
                buflen: 0,
                status: 0,
                data: buffer.unwrap_or(0),
                next: ring.layout.bd_addr((slot + 1) % len),
            };
            if slot == len - 1 {
                bd.ctrl |= BdCtrl::LAST_BD;
            }
            if direction == RingDirection::Rx {
                bd.ctrl |= BdCtrl::DIR | BdCtrl::LIFM | BdCtrl::DESC_EN;
                bd.buflen = buffer_size as u16;
            }
            bds.extend_from_slice(&bd.to_bytes());
            wbs.extend_from_slice(&WbDesc::armed(WB_INITIAL_SEQNUM).to_bytes());
        }
        mem.write(wb_base, &wbs);
        mem.flush(wb_base, wbs.len());
        mem.barrier();
        mem.write(bd_base, &bds);
        mem.flush(bd_base, bds.len());

        debug!(?direction, len, buffer_size, "HIF ring created");
        Ok(ring)
    }

    pub fn layout(&self) -> RingLayout {
        self.layout
    }

    pub fn len(&self) -> usize {
        self.layout.len as usize
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn write_index(&self) -> u32 {
        self.write_idx
    }

    pub fn read_index(&self) -> u32 {
        self.read_idx
    }

    /// TX: slots handed to hardware and not yet reclaimed. RX: buffers out with the caller.
    pub fn outstanding(&self) -> u32 {
        match self.layout.direction {
            RingDirection::Tx => self.write_idx.wrapping_sub(self.read_idx),
            RingDirection::Rx => self.read_idx.wrapping_sub(self.write_idx),
        }
    }

    fn hw_owned<M: DmaMemory + ?Sized>(&self, mem: &M, slot: usize) -> bool {
        self.layout.load_bd(mem, slot).ctrl.contains(BdCtrl::DESC_EN)
    }

    /// Queues one frame: `header` in the slot at `write_idx`, `payload` in the next one.
    ///
    /// Never overwrites a slot hardware still owns: if a reclaim attempt bounded by `timeout`
    /// cannot free it, `TransportBusy` is returned and the ring is left untouched.
    pub fn submit_tx<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &M,
        header: &TxHeader,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        debug_assert_eq!(self.layout.direction, RingDirection::Tx);
        if payload.len() > self.buffer_size {
            return Err(HifError::PayloadTooLarge {
                len: payload.len(),
                max: self.buffer_size,
            });
        }

        let hdr_slot = self.layout.slot(self.write_idx);
        let pkt_slot = self.layout.slot(self.write_idx.wrapping_add(1));
        for slot in [hdr_slot, pkt_slot] {
            if self.hw_owned(mem, slot) {
                self.reclaim_tx(mem, timeout);
                if self.hw_owned(mem, slot) {
                    debug!(slot, "TX slot still owned by hardware");
                    return Err(HifError::TransportBusy { slot });
                }
            }
        }
        let hdr_buf = self.buffers[hdr_slot].ok_or(HifError::IoError { slot: hdr_slot })?;
        let pkt_buf = self.buffers[pkt_slot].ok_or(HifError::IoError { slot: pkt_slot })?;

        self.post_tx(mem, hdr_slot, hdr_buf, &header.to_bytes(), false);
        self.post_tx(mem, pkt_slot, pkt_buf, payload, true);
        self.write_idx = self.write_idx.wrapping_add(2);

        self.reclaim_tx(mem, timeout);
        Ok(())
    }

    fn post_tx<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &M,
        slot: usize,
        buffer: DmaAddr,
        bytes: &[u8],
        last: bool,
    ) {
        mem.write(buffer, bytes);
        mem.flush(buffer, bytes.len());

        let mut bd = self.layout.load_bd(mem, slot);
        bd.seqnum = self.seqnum;
        self.seqnum = self.seqnum.wrapping_add(1);
        bd.data = buffer;
        bd.buflen = bytes.len() as u16;
        bd.status = 0;
        bd.ctrl.remove(BdCtrl::DESC_EN | BdCtrl::DIR);
        bd.ctrl.set(BdCtrl::LIFM, last);
        self.layout.store_bd(mem, slot, &bd);
        self.layout.store_wb(mem, slot, &WbDesc::armed(WB_INITIAL_SEQNUM));

        mem.barrier();
        bd.ctrl.insert(BdCtrl::DESC_EN);
        self.layout.store_bd(mem, slot, &bd);
    }

    /// Takes back, in index order, every TX slot hardware has completed. Each slot gets `timeout`
    /// to complete; the first one that does not stops the walk and stays owned by hardware.
    pub fn reclaim_tx<M: DmaMemory + ?Sized>(&mut self, mem: &M, timeout: Duration) -> usize {
        let mut reclaimed = 0;
        while self.read_idx != self.write_idx {
            let slot = self.layout.slot(self.read_idx);
            let layout = self.layout;
            let done = poll_timeout(timeout, || {
                !layout.load_wb(mem, slot).ctrl.contains(WbCtrl::DESC_EN)
            });
            if let Err(err) = done {
                debug!(slot, read_idx = self.read_idx, "TX confirmation timed out: {err}");
                break;
            }

            let mut bd = self.layout.load_bd(mem, slot);
            bd.ctrl.remove(BdCtrl::DESC_EN);
            self.layout.store_bd(mem, slot, &bd);
            self.read_idx = self.read_idx.wrapping_add(1);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Claims the RX slot at `read_idx` if hardware has filled it.
    ///
    /// With `strip_header` the returned buffer skips the firmware RX header. Multi-buffer frames
    /// are consumed but reported as empty.
    pub fn claim_rx<M: DmaMemory + ?Sized>(
        &mut self,
        mem: &M,
        strip_header: bool,
    ) -> Result<RxBuffer> {
        debug_assert_eq!(self.layout.direction, RingDirection::Rx);
        let slot = self.layout.slot(self.read_idx);
        let wb = self.layout.load_wb(mem, slot);
        if wb.ctrl.contains(WbCtrl::DESC_EN) {
            return Err(HifError::WouldBlock);
        }
        let mut bd = self.layout.load_bd(mem, slot);
        if !bd.ctrl.contains(BdCtrl::DESC_EN) {
            return Err(HifError::WouldBlock);
        }
        let Some(addr) = self.buffers[slot].take() else {
            warn!(slot, "armed RX slot has no buffer attached");
            return Err(HifError::IoError { slot });
        };

        bd.ctrl.remove(BdCtrl::DESC_EN);
        self.layout.store_bd(mem, slot, &bd);
        self.layout.store_wb(mem, slot, &WbDesc::armed(wb.seqnum));
        mem.barrier();

        mem.invalidate(addr, self.buffer_size);
        self.read_idx = self.read_idx.wrapping_add(1);

        let mut rx = RxBuffer {
            addr,
            capacity: self.buffer_size,
            offset: 0,
            len: usize::from(wb.buflen).min(self.buffer_size),
        };
        if !wb.ctrl.contains(WbCtrl::LIFM) {
            warn!(slot, "multi-buffer frames are not supported, dropping");
            rx.len = 0;
        } else if strip_header {
            if rx.len < HIF_HEADER_SIZE {
                warn!(slot, len = rx.len, "RX frame shorter than its header");
                rx.len = 0;
            } else {
                rx.offset = HIF_HEADER_SIZE;
                rx.len -= HIF_HEADER_SIZE;
            }
        }
        Ok(rx)
    }

    /// Arms the RX slot at `write_idx` with `buffer`.
    ///
    /// Fails with `IoError` if that slot is already armed; the buffer is then kept by the ring and
    /// released on destroy.
    pub fn rearm_rx<M: DmaMemory + ?Sized>(&mut self, mem: &M, buffer: RxBuffer) -> Result<()> {
        debug_assert_eq!(self.layout.direction, RingDirection::Rx);
        if buffer.capacity < self.buffer_size {
            let err = HifError::InvalidBuffer {
                capacity: buffer.capacity,
                required: self.buffer_size,
            };
            self.parked.push(buffer.addr);
            return Err(err);
        }

        let slot = self.layout.slot(self.write_idx);
        let mut bd = self.layout.load_bd(mem, slot);
        if bd.ctrl.contains(BdCtrl::DESC_EN) || self.buffers[slot].is_some() {
            warn!(slot, "RX slot is already armed");
            self.parked.push(buffer.addr);
            return Err(HifError::IoError { slot });
        }

        bd.data = buffer.addr;
        bd.buflen = self.buffer_size as u16;
        bd.status = 0;
        bd.ctrl.insert(BdCtrl::LIFM | BdCtrl::DIR);
        self.layout.store_bd(mem, slot, &bd);
        self.layout.store_wb(mem, slot, &WbDesc::armed(WB_INITIAL_SEQNUM));
        mem.barrier();
        bd.ctrl.insert(BdCtrl::DESC_EN);
        self.layout.store_bd(mem, slot, &bd);

        self.buffers[slot] = Some(buffer.addr);
        self.write_idx = self.write_idx.wrapping_add(1);
        Ok(())
    }

    /// Releases descriptor arrays and every buffer the ring still holds. Hardware must no longer
    /// be using the ring.
    pub fn destroy<M: DmaMemory + ?Sized>(mut self, mem: &M) {
        self.release(mem);
    }

    pub(crate) fn release<M: DmaMemory + ?Sized>(&mut self, mem: &M) {
        for addr in self.buffers.iter_mut().filter_map(Option::take) {
            mem.free(addr);
        }
        for addr in self.parked.drain(..) {
            mem.free(addr);
        }
        if self.layout.bd_base != 0 {
            mem.free(self.layout.bd_base);
            mem.free(self.layout.wb_base);
            self.layout.bd_base = 0;
            self.layout.wb_base = 0;
        }
    }
}
