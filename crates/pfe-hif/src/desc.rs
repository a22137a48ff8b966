//! HIF buffer descriptor (BD) and write-back descriptor (WB-BD) layouts.
//!
//! Both live in DMA memory in the CPU's (little-endian) byte order. The BD array is written by the
//! host and read by the engine; the WB-BD array is armed by the host and completed by the engine.

use bitflags::bitflags;

use crate::dma::{BusMaster, DmaAddr, DmaMemory};
use crate::ring::RingLayout;

bitflags! {
    /// `ctrl` word of a buffer descriptor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BdCtrl: u16 {
        const PKT_INT_EN = 1 << 0;
        const CBD_INT_EN = 1 << 1;
        /// Last fragment of a frame.
        const LIFM = 1 << 2;
        /// Last descriptor in the ring.
        const LAST_BD = 1 << 3;
        /// Set for RX descriptors.
        const DIR = 1 << 4;
        /// Ownership bit: set hands the slot to hardware.
        const DESC_EN = 1 << 15;
    }
}

bitflags! {
    /// `ctrl` word of a write-back descriptor.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct WbCtrl: u32 {
        const CBD_INT_EN = 1 << 4;
        const PKT_INT_EN = 1 << 5;
        const LIFM = 1 << 6;
        const LAST_BD = 1 << 7;
        const DIR = 1 << 8;
        /// Armed by the host, cleared by hardware on completion.
        const DESC_EN = 1 << 9;
    }
}

/// Sequence tag a write-back descriptor carries before hardware has ever completed it.
pub const WB_INITIAL_SEQNUM: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub seqnum: u16,
    pub ctrl: BdCtrl,
    pub buflen: u16,
    pub status: u16,
    pub data: DmaAddr,
    pub next: DmaAddr,
}

impl BufferDesc {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..2].copy_from_slice(&self.seqnum.to_le_bytes());
        out[2..4].copy_from_slice(&self.ctrl.bits().to_le_bytes());
        out[4..6].copy_from_slice(&self.buflen.to_le_bytes());
        out[6..8].copy_from_slice(&self.status.to_le_bytes());
        out[8..12].copy_from_slice(&self.data.to_le_bytes());
        out[12..16].copy_from_slice(&self.next.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            seqnum: u16::from_le_bytes([raw[0], raw[1]]),
            ctrl: BdCtrl::from_bits_retain(u16::from_le_bytes([raw[2], raw[3]])),
            buflen: u16::from_le_bytes([raw[4], raw[5]]),
            status: u16::from_le_bytes([raw[6], raw[7]]),
            data: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            next: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WbDesc {
    pub ctrl: WbCtrl,
    pub buflen: u16,
    pub seqnum: u16,
}

impl WbDesc {
    pub const SIZE: usize = 8;

    /// Write-back record handed to hardware, waiting for completion.
    pub const fn armed(seqnum: u16) -> Self {
        Self {
            ctrl: WbCtrl::DESC_EN,
            buflen: 0,
            seqnum,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.ctrl.bits().to_le_bytes());
        out[4..6].copy_from_slice(&self.buflen.to_le_bytes());
        out[6..8].copy_from_slice(&self.seqnum.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        Self {
            ctrl: WbCtrl::from_bits_retain(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
            buflen: u16::from_le_bytes([raw[4], raw[5]]),
            seqnum: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }
}

// Host-side accessors. Loads invalidate first so the host never acts on a stale cached copy;
// stores flush so the engine observes them.
impl RingLayout {
    pub fn load_bd<M: DmaMemory + ?Sized>(&self, mem: &M, slot: usize) -> BufferDesc {
        let addr = self.bd_addr(slot);
        mem.invalidate(addr, BufferDesc::SIZE);
        let mut raw = [0u8; BufferDesc::SIZE];
        mem.read(addr, &mut raw);
        BufferDesc::from_bytes(&raw)
    }

    pub fn store_bd<M: DmaMemory + ?Sized>(&self, mem: &M, slot: usize, bd: &BufferDesc) {
        let addr = self.bd_addr(slot);
        mem.write(addr, &bd.to_bytes());
        mem.flush(addr, BufferDesc::SIZE);
    }

    pub fn load_wb<M: DmaMemory + ?Sized>(&self, mem: &M, slot: usize) -> WbDesc {
        let addr = self.wb_addr(slot);
        mem.invalidate(addr, WbDesc::SIZE);
        let mut raw = [0u8; WbDesc::SIZE];
        mem.read(addr, &mut raw);
        WbDesc::from_bytes(&raw)
    }

    pub fn store_wb<M: DmaMemory + ?Sized>(&self, mem: &M, slot: usize, wb: &WbDesc) {
        let addr = self.wb_addr(slot);
        mem.write(addr, &wb.to_bytes());
        mem.flush(addr, WbDesc::SIZE);
    }

    pub(crate) fn dev_load_bd<B: BusMaster + ?Sized>(&self, bus: &B, slot: usize) -> BufferDesc {
        let mut raw = [0u8; BufferDesc::SIZE];
        bus.dma_read(self.bd_addr(slot), &mut raw);
        BufferDesc::from_bytes(&raw)
    }

    pub(crate) fn dev_load_wb<B: BusMaster + ?Sized>(&self, bus: &B, slot: usize) -> WbDesc {
        let mut raw = [0u8; WbDesc::SIZE];
        bus.dma_read(self.wb_addr(slot), &mut raw);
        WbDesc::from_bytes(&raw)
    }

    pub(crate) fn dev_store_wb<B: BusMaster + ?Sized>(&self, bus: &B, slot: usize, wb: &WbDesc) {
        bus.dma_write(self.wb_addr(slot), &wb.to_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bd_layout_matches_hardware() {
        let bd = BufferDesc {
            seqnum: 0x0102,
            ctrl: BdCtrl::DESC_EN | BdCtrl::LIFM,
            buflen: 0x0304,
            status: 0,
            data: 0x1122_3344,
            next: 0x5566_7788,
        };
        let raw = bd.to_bytes();
        assert_eq!(
            raw,
            [
                0x02, 0x01, 0x04, 0x80, 0x04, 0x03, 0x00, 0x00, 0x44, 0x33, 0x22, 0x11, 0x88,
                0x77, 0x66, 0x55
            ]
        );
        assert_eq!(BufferDesc::from_bytes(&raw), bd);
    }

    #[test]
    fn wb_ownership_is_bit_nine() {
        let raw = WbDesc::armed(WB_INITIAL_SEQNUM).to_bytes();
        assert_eq!(&raw[0..4], &[0x00, 0x02, 0x00, 0x00]);
        assert_eq!(&raw[6..8], &[0xFF, 0xFF]);
    }

    #[test]
    fn reserved_ctrl_bits_survive_decode() {
        let mut raw = [0u8; BufferDesc::SIZE];
        raw[2..4].copy_from_slice(&0x0420u16.to_le_bytes());
        assert_eq!(BufferDesc::from_bytes(&raw).ctrl.bits(), 0x0420);
    }
}
