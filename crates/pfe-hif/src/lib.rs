//! Host side of the PFE HIF (host interface) DMA channel.
//!
//! A channel is a pair of descriptor rings shared with the HIF DMA engine: the host queues frames
//! on the TX ring and the engine delivers frames on the RX ring. Ownership of each ring slot is
//! carried by the `DESC_EN` bit of its buffer descriptor; completion is reported through the
//! matching write-back descriptor.
//!
//! Memory access is abstracted behind [`DmaMemory`] so the same ring code runs on real DMA memory
//! and on [`HeapDma`] in tests, where [`HifEngineModel`] stands in for the hardware.

#![forbid(unsafe_code)]

mod channel;
mod desc;
mod dma;
mod error;
mod header;
mod model;
mod poll;
mod ring;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use channel::{ChannelLayout, HifChannel, HifConfig};
pub use desc::{BdCtrl, BufferDesc, WbCtrl, WbDesc, WB_INITIAL_SEQNUM};
pub use dma::{BusMaster, DmaAddr, DmaMemory, HeapDma, DMA_ALIGN};
pub use error::{HifError, Result};
pub use header::{RxFlags, RxHeader, TxFlags, TxHeader};
pub use model::{EngineStats, HifEngineModel};
pub use poll::{poll_timeout, PollTimeout};
pub use ring::{HifRing, RingDirection, RingLayout, RxBuffer};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
