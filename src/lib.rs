//! PFE host-interface transport and IDEX inter-driver RPC.
//!
//! The pieces live in their own crates and are re-exported here:
//!
//! * [`ct`]: interface ids and shared constants.
//! * [`hif`]: descriptor rings, DMA memory and the software engine model.
//! * [`idex_protocol`]: the IDEX wire format.
//! * [`idex`]: request registry, timeout supervisor and RPC engine.
//!
//! [`IdexNode`] wires an engine to a HIF channel; [`Loopback`] runs the engine model so several
//! nodes can talk to each other in one process.

#![forbid(unsafe_code)]

pub use pfe_ct as ct;
pub use pfe_hif as hif;
pub use pfe_idex as idex;
pub use pfe_idex_protocol as idex_protocol;

mod loopback;
mod node;

pub use loopback::Loopback;
pub use node::{IdexNode, NodeError};
