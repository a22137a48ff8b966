//! Per-packet headers exchanged with the firmware. Multi-byte fields are big-endian.

use bitflags::bitflags;
use pfe_ct::{PhyIfId, HIF_HEADER_SIZE};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct TxFlags: u8 {
        /// Bypass classification and egress on the interfaces in the mask.
        const INJECT = 1 << 6;
        /// Inter-driver (IHC) traffic.
        const IHC = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RxFlags: u32 {
        const IHC = 1 << 8;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxHeader {
    pub flags: TxFlags,
    pub queue: u8,
    pub chid: u8,
    pub refnum: u16,
    pub egress_mask: u32,
    pub cookie: u32,
}

impl TxHeader {
    pub fn to_bytes(&self) -> [u8; HIF_HEADER_SIZE] {
        let mut out = [0u8; HIF_HEADER_SIZE];
        out[0] = self.flags.bits();
        out[1] = self.queue;
        out[2] = self.chid;
        // out[3..6] reserved
        out[6..8].copy_from_slice(&self.refnum.to_be_bytes());
        out[8..12].copy_from_slice(&self.egress_mask.to_be_bytes());
        out[12..16].copy_from_slice(&self.cookie.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..HIF_HEADER_SIZE)?;
        Some(Self {
            flags: TxFlags::from_bits_retain(raw[0]),
            queue: raw[1],
            chid: raw[2],
            refnum: u16::from_be_bytes([raw[6], raw[7]]),
            egress_mask: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            cookie: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxHeader {
    pub flags: RxFlags,
    pub i_phy_if: PhyIfId,
    pub i_log_if: u8,
    pub queue: u8,
    pub timestamp_ns: u32,
    pub timestamp_s: u32,
}

impl RxHeader {
    pub fn to_bytes(&self) -> [u8; HIF_HEADER_SIZE] {
        let mut out = [0u8; HIF_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.flags.bits().to_be_bytes());
        out[4] = self.i_phy_if.raw();
        out[5] = self.i_log_if;
        out[6] = self.queue;
        out[8..12].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        out[12..16].copy_from_slice(&self.timestamp_s.to_be_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        let raw = raw.get(..HIF_HEADER_SIZE)?;
        Some(Self {
            flags: RxFlags::from_bits_retain(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
            i_phy_if: PhyIfId::from_raw(raw[4]),
            i_log_if: raw[5],
            queue: raw[6],
            timestamp_ns: u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]),
            timestamp_s: u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]),
        })
    }
}
