use pfe_hif::HifError;
use pfe_idex_protocol::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdexError {
    /// The frame could not be handed to the HIF channel.
    #[error("transport failure: {0}")]
    Transport(#[from] HifError),

    #[error("remote rejected the call with code {code}")]
    RemoteRejected { code: i32 },

    #[error("no response before the request timed out")]
    TimedOut,

    #[error("response of {len} bytes does not fit a {capacity} byte buffer")]
    ResponseTooLarge { len: usize, capacity: usize },

    #[error("response answers rpc {got:#x}, expected {expected:#x}")]
    ResponseMismatch { expected: u32, got: u32 },

    #[error("malformed response: {0}")]
    MalformedResponse(#[from] DecodeError),

    #[error("request of {0} bytes does not fit an IDEX frame")]
    RequestTooLarge(usize),

    #[error("no IDEX master found")]
    NoMasterFound,

    #[error("IDEX engine is shutting down")]
    Shutdown,

    #[error("failed to start IDEX worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl IdexError {
    /// Whether another attempt with a fresh sequence number may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            // The frame will not fit on any attempt.
            Self::Transport(HifError::PayloadTooLarge { .. }) => false,
            Self::Transport(_)
            | Self::RemoteRejected { .. }
            | Self::TimedOut
            | Self::ResponseMismatch { .. }
            | Self::MalformedResponse(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("request {0} not found")]
    NotFound(u32),

    #[error("request {seq} is {state:?}, cannot become {target:?}")]
    InvalidTransition {
        seq: u32,
        state: crate::registry::RequestState,
        target: crate::registry::RequestState,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}
