//! Constants and identifiers shared between the PFE host driver and the PFE firmware.
//!
//! Everything in this crate is part of the host/firmware ABI: changing a value here changes what
//! goes on the wire.

#![forbid(unsafe_code)]

use core::fmt;

/// Size of the transport header the host prepends to every transmitted packet, and of the header
/// the firmware prepends to every received packet.
pub const HIF_HEADER_SIZE: usize = 16;

/// Size of every packet buffer attached to a HIF ring slot.
pub const PKTSIZE_ALIGN: usize = 1536;

/// Physical interface identifier as understood by the classifier firmware.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PhyIfId(u8);

impl PhyIfId {
    pub const EMAC0: Self = Self(0);
    pub const EMAC1: Self = Self(1);
    pub const EMAC2: Self = Self(2);
    pub const HIF: Self = Self(3);
    pub const HIF_NOCPY: Self = Self(4);
    pub const UTIL: Self = Self(5);
    pub const HIF0: Self = Self(6);
    pub const HIF1: Self = Self(7);
    pub const HIF2: Self = Self(8);
    pub const HIF3: Self = Self(9);
    pub const INVALID: Self = Self(10);

    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 < Self::INVALID.0
    }

    /// Interface id of HIF channel `chid`, or `None` for channels the hardware does not have.
    pub const fn hif_channel(chid: u8) -> Option<Self> {
        if chid <= 3 {
            Some(Self(Self::HIF0.0 + chid))
        } else {
            None
        }
    }

    /// Bit of this interface in an egress interface mask (zero for invalid ids).
    pub const fn egress_bit(self) -> u32 {
        if self.is_valid() {
            1u32 << self.0
        } else {
            0
        }
    }

    /// Iterates over the valid interfaces selected by an egress mask, lowest id first.
    pub fn iter_mask(mask: u32) -> impl Iterator<Item = Self> {
        (0..Self::INVALID.0)
            .map(Self)
            .filter(move |id| mask & id.egress_bit() != 0)
    }

    pub const fn name(self) -> &'static str {
        match self.0 {
            0 => "EMAC0",
            1 => "EMAC1",
            2 => "EMAC2",
            3 => "HIF",
            4 => "HIF_NOCPY",
            5 => "UTIL",
            6 => "HIF0",
            7 => "HIF1",
            8 => "HIF2",
            9 => "HIF3",
            _ => "INVALID",
        }
    }
}

impl fmt::Display for PhyIfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host interfaces probed for an IDEX master when nothing else is configured.
pub const IDEX_DISCOVERY_CANDIDATES: [PhyIfId; 2] = [PhyIfId::HIF0, PhyIfId::HIF1];

/// Well-known IDEX RPC identifiers.
pub mod rpc_id {
    pub const IF_LOCK: u32 = 0xBE;
    pub const IF_UNLOCK: u32 = 0xBF;
    pub const IF_DISABLE: u32 = 0x66;
}
