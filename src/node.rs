use std::sync::Arc;

use pfe_ct::PhyIfId;
use pfe_hif::{DmaMemory, HifChannel, HifConfig, HifError};
use pfe_idex::{IdexConfig, IdexEngine, IdexError, IdexRuntime, RxNotifier};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("HIF channel setup failed: {0}")]
    Hif(#[from] HifError),
    #[error(transparent)]
    Idex(#[from] IdexError),
}

/// One driver instance: a HIF channel with an IDEX engine and its background threads on top.
pub struct IdexNode<M: DmaMemory + 'static> {
    runtime: IdexRuntime<Arc<HifChannel<M>>>,
}

impl<M: DmaMemory + 'static> IdexNode<M> {
    /// Creates the channel and starts the runtime. The master is not resolved yet.
    pub fn create(mem: M, hif: HifConfig, idex: IdexConfig) -> Result<Self, NodeError> {
        let channel = Arc::new(HifChannel::create(mem, hif)?);
        let engine = IdexEngine::new(channel, idex);
        let runtime = IdexRuntime::start(&engine)?;
        info!(
            phy_if = %engine.transport().phy_if(),
            role = ?engine.config().role,
            "IDEX node up"
        );
        Ok(Self { runtime })
    }

    pub fn engine(&self) -> &IdexEngine<Arc<HifChannel<M>>> {
        self.runtime.engine()
    }

    pub fn channel(&self) -> &HifChannel<M> {
        self.engine().transport()
    }

    /// Doorbell to hook into the channel's RX interrupt.
    pub fn notifier(&self) -> RxNotifier {
        self.runtime.notifier()
    }

    /// Finds the master: immediate for a master or a fixed master interface, otherwise by
    /// discovery over the configured candidates.
    pub fn resolve_master(&self) -> Result<PhyIfId, NodeError> {
        let engine = self.engine();
        let candidates = engine.config().discovery_candidates.clone();
        Ok(engine.discover_master(&candidates)?)
    }

    /// Stops the runtime. Returns the number of requests abandoned.
    pub fn shutdown(self) -> usize {
        let phy_if = self.channel().phy_if();
        let dropped = self.runtime.shutdown();
        info!(%phy_if, dropped, "IDEX node down");
        dropped
    }
}
