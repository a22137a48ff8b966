use thiserror::Error;

/// Errors reported by the HIF ring transport.
///
/// Only `OutOfMemory`, `InvalidRingLength` and `InvalidBufferSize` are fatal, and only at ring
/// creation. Everything else is transient and can be retried by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HifError {
    #[error("out of DMA memory (requested {len} bytes)")]
    OutOfMemory { len: usize },

    #[error("ring length {0} is not a power of two of at least 2")]
    InvalidRingLength(usize),

    #[error("buffer size {0} does not fit a descriptor length field")]
    InvalidBufferSize(usize),

    #[error("ring slot {slot} is still owned by hardware")]
    TransportBusy { slot: usize },

    #[error("no received data available")]
    WouldBlock,

    #[error("ring slot {slot} is already armed")]
    IoError { slot: usize },

    #[error("payload of {len} bytes exceeds the {max} byte slot buffer")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("buffer of {capacity} bytes cannot back a {required} byte ring slot")]
    InvalidBuffer { capacity: usize, required: usize },
}

pub type Result<T> = std::result::Result<T, HifError>;
