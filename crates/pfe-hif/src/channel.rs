use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use pfe_ct::{PhyIfId, PKTSIZE_ALIGN};
use tracing::debug;

use crate::dma::DmaMemory;
use crate::error::Result;
use crate::header::{RxHeader, TxFlags, TxHeader};
use crate::lock;
use crate::ring::{HifRing, RingDirection, RingLayout, RxBuffer};

#[derive(Debug, Clone)]
pub struct HifConfig {
    /// HIF channel number; channel `n` is physical interface `HIFn`.
    pub channel_id: u8,
    pub ring_len: usize,
    pub buffer_size: usize,
    /// Upper bound for one TX completion poll.
    pub bd_timeout: Duration,
}

impl Default for HifConfig {
    fn default() -> Self {
        Self {
            channel_id: 0,
            ring_len: 16,
            buffer_size: PKTSIZE_ALIGN,
            bd_timeout: Duration::from_micros(1000),
        }
    }
}

impl HifConfig {
    pub fn phy_if(&self) -> PhyIfId {
        PhyIfId::hif_channel(self.channel_id).unwrap_or(PhyIfId::INVALID)
    }
}

/// Descriptor ring addresses of one channel, as programmed into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLayout {
    pub tx: RingLayout,
    pub rx: RingLayout,
}

/// A HIF channel: one TX ring and one RX ring over shared DMA memory.
///
/// Each ring sits behind its own lock, so any number of threads may transmit while one drain task
/// receives.
pub struct HifChannel<M: DmaMemory> {
    mem: M,
    config: HifConfig,
    tx: Mutex<HifRing>,
    rx: Mutex<HifRing>,
}

impl<M: DmaMemory> HifChannel<M> {
    pub fn create(mem: M, config: HifConfig) -> Result<Self> {
        let tx = HifRing::create(&mem, RingDirection::Tx, config.ring_len, config.buffer_size)?;
        let rx = match HifRing::create(&mem, RingDirection::Rx, config.ring_len, config.buffer_size)
        {
            Ok(rx) => rx,
            Err(err) => {
                tx.destroy(&mem);
                return Err(err);
            }
        };
        debug!(chid = config.channel_id, ring_len = config.ring_len, "HIF channel created");
        Ok(Self {
            mem,
            config,
            tx: Mutex::new(tx),
            rx: Mutex::new(rx),
        })
    }

    pub fn config(&self) -> &HifConfig {
        &self.config
    }

    pub fn phy_if(&self) -> PhyIfId {
        self.config.phy_if()
    }

    pub fn memory(&self) -> &M {
        &self.mem
    }

    pub fn layout(&self) -> ChannelLayout {
        ChannelLayout {
            tx: lock(&self.tx).layout(),
            rx: lock(&self.rx).layout(),
        }
    }

    /// Sends `payload` to the interfaces in `egress_mask`.
    pub fn transmit(&self, payload: &[u8], egress_mask: u32, flags: TxFlags) -> Result<()> {
        let header = TxHeader {
            flags,
            queue: 0,
            chid: self.config.channel_id,
            refnum: 0,
            egress_mask,
            cookie: 0,
        };
        lock(&self.tx).submit_tx(&self.mem, &header, payload, self.config.bd_timeout)
    }

    /// Reclaims completed TX slots without sending anything.
    pub fn reclaim_tx(&self) -> usize {
        lock(&self.tx).reclaim_tx(&self.mem, self.config.bd_timeout)
    }

    pub fn receive(&self, strip_header: bool) -> Result<RxBuffer> {
        lock(&self.rx).claim_rx(&self.mem, strip_header)
    }

    /// Copies the bytes described by `buffer` out of DMA memory.
    pub fn read_rx(&self, buffer: &RxBuffer) -> Vec<u8> {
        self.mem.read_vec(buffer.data_addr(), buffer.len())
    }

    /// Decodes the firmware header at the start of a received buffer.
    pub fn rx_header(&self, buffer: &RxBuffer) -> Option<RxHeader> {
        RxHeader::from_bytes(&self.mem.read_vec(buffer.addr(), pfe_ct::HIF_HEADER_SIZE))
    }

    /// Returns a received buffer to the RX ring.
    pub fn free(&self, buffer: RxBuffer) -> Result<()> {
        lock(&self.rx).rearm_rx(&self.mem, buffer)
    }

    /// `(write_index, read_index)` of the TX ring.
    pub fn tx_indices(&self) -> (u32, u32) {
        let ring = lock(&self.tx);
        (ring.write_index(), ring.read_index())
    }

    /// `(write_index, read_index)` of the RX ring.
    pub fn rx_indices(&self) -> (u32, u32) {
        let ring = lock(&self.rx);
        (ring.write_index(), ring.read_index())
    }

    /// Releases both rings. Hardware DMA for this channel must already be stopped.
    pub fn destroy(self) {
        debug!(chid = self.config.channel_id, "HIF channel destroyed");
    }
}

impl<M: DmaMemory> Drop for HifChannel<M> {
    fn drop(&mut self) {
        self.tx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.mem);
        self.rx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .release(&self.mem);
    }
}
