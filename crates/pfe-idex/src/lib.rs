//! IDEX: RPC between PFE driver instances over IHC frames.
//!
//! A node runs an [`IdexEngine`] on top of an [`IhcTransport`] (normally a
//! [`pfe_hif::HifChannel`]). One node in the system is the master; slaves discover it with
//! [`IdexEngine::discover_master`] and call into it with [`IdexEngine::master_rpc`].
//! Outstanding requests live in a [`RequestRegistry`] that a [`TimeoutSupervisor`] ages
//! periodically; [`IdexRuntime`] owns the threads that keep both moving.

#![forbid(unsafe_code)]

mod config;
mod engine;
mod error;
mod registry;
mod runtime;
mod supervisor;
mod transport;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use config::{IdexConfig, Role};
pub use engine::{IdexEngine, InboundRpc, RpcHandler, RpcReply};
pub use error::{ConfigError, IdexError, RegistryError};
pub use registry::{
    AgeReport, Completion, RegistryStats, RequestRegistry, RequestResult, RequestState, Waiter,
};
pub use runtime::{IdexRuntime, RxNotifier};
pub use supervisor::{SupervisorHandle, TickReport, TimeoutSupervisor};
pub use transport::{IhcPacket, IhcTransport};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
