//! Software model of the HIF DMA engine and the firmware's IHC routing.
//!
//! The model plays the hardware side of every attached channel. It only ever touches memory
//! through [`BusMaster`], so it sees exactly what the host flushed and nothing the host left in
//! its cache.
//!
//! One [`step`](HifEngineModel::step):
//! 1. walks each channel's TX ring from its own fetch index, taking every complete frame (armed
//!    descriptors up to one flagged `LIFM`),
//! 2. completes the frame's write-back descriptors,
//! 3. delivers the payload to every attached channel named in the TX header's egress mask,
//!    prefixed with an RX header naming the source interface.

use pfe_ct::{PhyIfId, HIF_HEADER_SIZE};
use tracing::trace;

use crate::channel::ChannelLayout;
use crate::desc::{BdCtrl, WbCtrl, WbDesc};
use crate::dma::BusMaster;
use crate::header::{RxFlags, RxHeader, TxFlags, TxHeader};
use crate::ring::RingLayout;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub tx_frames: u64,
    pub rx_frames: u64,
    /// Frames that could not be delivered: no armed RX slot, buffer too small, or an egress
    /// interface that is not attached.
    pub dropped: u64,
}

struct EngineChannel {
    phy_if: PhyIfId,
    tx: RingLayout,
    rx: RingLayout,
    tx_fetch: u32,
    rx_fill: u32,
}

type RxNotify = Box<dyn FnMut(PhyIfId) + Send>;

pub struct HifEngineModel<B: BusMaster> {
    bus: B,
    channels: Vec<EngineChannel>,
    paused: bool,
    on_rx: Option<RxNotify>,
    stats: EngineStats,
}

impl<B: BusMaster> HifEngineModel<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            channels: Vec::new(),
            paused: false,
            on_rx: None,
            stats: EngineStats::default(),
        }
    }

    /// Programs the rings of the channel serving `phy_if`. Replaces an earlier attachment.
    pub fn attach(&mut self, phy_if: PhyIfId, layout: ChannelLayout) {
        self.channels.retain(|ch| ch.phy_if != phy_if);
        self.channels.push(EngineChannel {
            phy_if,
            tx: layout.tx,
            rx: layout.rx,
            tx_fetch: 0,
            rx_fill: 0,
        });
    }

    pub fn detach(&mut self, phy_if: PhyIfId) {
        self.channels.retain(|ch| ch.phy_if != phy_if);
    }

    /// A paused engine neither fetches nor completes anything, like a stalled DMA.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Registers the "RX data available" interrupt line.
    pub fn on_rx(&mut self, notify: impl FnMut(PhyIfId) + Send + 'static) {
        self.on_rx = Some(Box::new(notify));
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Processes everything currently queued. Returns the number of TX frames consumed.
    pub fn step(&mut self) -> usize {
        if self.paused {
            return 0;
        }
        let mut consumed = 0;
        for ch in 0..self.channels.len() {
            while let Some(frame) = self.fetch_tx(ch) {
                consumed += 1;
                self.route(ch, &frame);
            }
        }
        consumed
    }

    fn fetch_tx(&mut self, ch: usize) -> Option<Vec<u8>> {
        let chan = &self.channels[ch];
        let ring = chan.tx;
        let mut idx = chan.tx_fetch;
        let mut parts = Vec::new();
        loop {
            if parts.len() == ring.len as usize {
                // A full lap without LIFM: the host is still building the chain.
                return None;
            }
            let slot = ring.slot(idx);
            let bd = ring.dev_load_bd(&self.bus, slot);
            let wb = ring.dev_load_wb(&self.bus, slot);
            if !bd.ctrl.contains(BdCtrl::DESC_EN) || !wb.ctrl.contains(WbCtrl::DESC_EN) {
                return None;
            }
            idx = idx.wrapping_add(1);
            let last = bd.ctrl.contains(BdCtrl::LIFM);
            parts.push((slot, bd));
            if last {
                break;
            }
        }

        let mut frame = Vec::new();
        for (slot, bd) in &parts {
            let start = frame.len();
            frame.resize(start + usize::from(bd.buflen), 0);
            self.bus.dma_read(bd.data, &mut frame[start..]);

            let mut ctrl = WbCtrl::empty();
            ctrl.set(WbCtrl::LIFM, bd.ctrl.contains(BdCtrl::LIFM));
            ctrl.set(WbCtrl::LAST_BD, bd.ctrl.contains(BdCtrl::LAST_BD));
            let done = WbDesc {
                ctrl,
                buflen: bd.buflen,
                seqnum: bd.seqnum,
            };
            ring.dev_store_wb(&self.bus, *slot, &done);
        }
        self.channels[ch].tx_fetch = idx;
        self.stats.tx_frames += 1;
        Some(frame)
    }

    fn route(&mut self, src: usize, frame: &[u8]) {
        let Some(header) = TxHeader::from_bytes(frame) else {
            trace!("runt TX frame dropped");
            self.stats.dropped += 1;
            return;
        };
        let payload = &frame[HIF_HEADER_SIZE..];
        let rx_header = RxHeader {
            flags: if header.flags.contains(TxFlags::IHC) {
                RxFlags::IHC
            } else {
                RxFlags::empty()
            },
            i_phy_if: self.channels[src].phy_if,
            i_log_if: 0,
            queue: header.queue,
            timestamp_ns: 0,
            timestamp_s: 0,
        };

        for dst_phy in PhyIfId::iter_mask(header.egress_mask) {
            let target = self.channels.iter().position(|ch| ch.phy_if == dst_phy);
            let delivered = match target {
                Some(dst) => self.deliver(dst, &rx_header, payload),
                None => false,
            };
            if !delivered {
                trace!(%dst_phy, "frame not delivered");
                self.stats.dropped += 1;
            }
        }
    }

    fn deliver(&mut self, dst: usize, header: &RxHeader, payload: &[u8]) -> bool {
        let chan = &self.channels[dst];
        let ring = chan.rx;
        let slot = ring.slot(chan.rx_fill);
        let bd = ring.dev_load_bd(&self.bus, slot);
        let wb = ring.dev_load_wb(&self.bus, slot);
        if !bd.ctrl.contains(BdCtrl::DESC_EN) || !wb.ctrl.contains(WbCtrl::DESC_EN) {
            return false;
        }
        let total = HIF_HEADER_SIZE + payload.len();
        if total > usize::from(bd.buflen) {
            return false;
        }

        self.bus.dma_write(bd.data, &header.to_bytes());
        self.bus.dma_write(bd.data + HIF_HEADER_SIZE as u32, payload);
        let done = WbDesc {
            ctrl: WbCtrl::LIFM | WbCtrl::DIR,
            buflen: total as u16,
            seqnum: bd.seqnum,
        };
        ring.dev_store_wb(&self.bus, slot, &done);

        let phy_if = chan.phy_if;
        self.channels[dst].rx_fill = self.channels[dst].rx_fill.wrapping_add(1);
        self.stats.rx_frames += 1;
        if let Some(notify) = self.on_rx.as_mut() {
            notify(phy_if);
        }
        true
    }
}
