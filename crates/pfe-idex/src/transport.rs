use std::sync::Arc;

use pfe_ct::{PhyIfId, HIF_HEADER_SIZE};
use pfe_hif::{DmaMemory, HifChannel, HifError, RxFlags, TxFlags};
use pfe_idex_protocol::MIN_IHC_FRAME_LEN;
use tracing::{debug, error};

/// An IHC frame delivered to this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IhcPacket {
    /// Interface the frame came in on, as reported by the firmware.
    pub ingress: PhyIfId,
    pub frame: Vec<u8>,
}

/// Carries IDEX frames between driver instances.
pub trait IhcTransport: Send + Sync {
    /// Queues `frame` for `dst`. Must not block beyond a bounded descriptor poll.
    fn send(&self, dst: PhyIfId, frame: &[u8]) -> Result<(), HifError>;

    /// Next pending IHC frame, or `None` when nothing is queued.
    fn recv(&self) -> Result<Option<IhcPacket>, HifError>;

    /// The interface this transport is bound to, when it knows it.
    fn local_phy_if(&self) -> Option<PhyIfId> {
        None
    }
}

impl<T: IhcTransport + ?Sized> IhcTransport for Arc<T> {
    fn send(&self, dst: PhyIfId, frame: &[u8]) -> Result<(), HifError> {
        (**self).send(dst, frame)
    }

    fn recv(&self) -> Result<Option<IhcPacket>, HifError> {
        (**self).recv()
    }

    fn local_phy_if(&self) -> Option<PhyIfId> {
        (**self).local_phy_if()
    }
}

impl<M: DmaMemory> IhcTransport for HifChannel<M> {
    fn send(&self, dst: PhyIfId, frame: &[u8]) -> Result<(), HifError> {
        if frame.len() >= MIN_IHC_FRAME_LEN {
            return self.transmit(frame, dst.egress_bit(), TxFlags::IHC);
        }
        let mut padded = [0u8; MIN_IHC_FRAME_LEN];
        padded[..frame.len()].copy_from_slice(frame);
        self.transmit(&padded, dst.egress_bit(), TxFlags::IHC)
    }

    fn recv(&self) -> Result<Option<IhcPacket>, HifError> {
        loop {
            let buffer = match self.receive(false) {
                Ok(buffer) => buffer,
                Err(HifError::WouldBlock) => return Ok(None),
                Err(err) => return Err(err),
            };

            let header = if buffer.len() > HIF_HEADER_SIZE {
                self.rx_header(&buffer)
            } else {
                None
            };
            let packet = match header {
                Some(header) if header.flags.contains(RxFlags::IHC) => {
                    let bytes = self.read_rx(&buffer);
                    Some(IhcPacket {
                        ingress: header.i_phy_if,
                        frame: bytes[HIF_HEADER_SIZE..].to_vec(),
                    })
                }
                Some(header) => {
                    debug!(flags = ?header.flags, phy_if = %header.i_phy_if, "dropping non-IHC frame");
                    None
                }
                None => {
                    debug!(len = buffer.len(), "dropping RX frame without payload");
                    None
                }
            };

            if let Err(err) = self.free(buffer) {
                error!(%err, "failed to return RX buffer to the ring");
            }
            if packet.is_some() {
                return Ok(packet);
            }
        }
    }

    fn local_phy_if(&self) -> Option<PhyIfId> {
        Some(self.phy_if()).filter(|id| id.is_valid())
    }
}
