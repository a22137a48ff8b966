#![forbid(unsafe_code)]

//! Two IDEX nodes on one simulated HIF engine: a master on HIF1 and a slave on HIF0. The slave
//! discovers the master, takes the interface lock, then releases it.
//!
//! `PFE_IDEX_*` variables configure the slave; `RUST_LOG` controls logging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context};
use pfeng::ct::{rpc_id, PhyIfId};
use pfeng::hif::{HeapDma, HifConfig};
use pfeng::idex::{IdexConfig, InboundRpc};
use pfeng::{IdexNode, Loopback};

const EBUSY: i32 = -16;
const EINVAL: i32 = -22;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let slave_config = IdexConfig::from_env().context("invalid IDEX configuration")?;
    let mem = HeapDma::non_coherent(1 << 20);

    let master = IdexNode::create(
        mem.clone(),
        HifConfig {
            channel_id: 1,
            ..HifConfig::default()
        },
        IdexConfig::master(),
    )
    .context("failed to start master node")?;
    let slave = IdexNode::create(
        mem.clone(),
        HifConfig {
            channel_id: 0,
            ..HifConfig::default()
        },
        slave_config,
    )
    .context("failed to start slave node")?;

    let locked = AtomicBool::new(false);
    master.engine().set_rpc_handler(move |rpc: InboundRpc<'_>| {
        let code = match rpc.rpc_id() {
            rpc_id::IF_LOCK if locked.swap(true, Ordering::AcqRel) => EBUSY,
            rpc_id::IF_LOCK => 0,
            rpc_id::IF_UNLOCK if locked.swap(false, Ordering::AcqRel) => 0,
            rpc_id::IF_UNLOCK => EINVAL,
            _ => EINVAL,
        };
        tracing::info!(rpc_id = rpc.rpc_id(), from = %rpc.requester(), code, "master handled RPC");
        if let Err(err) = rpc.set_rpc_result(code, &[]) {
            tracing::error!(%err, "failed to answer RPC");
        }
    });

    let loopback = Loopback::start(
        &mem,
        vec![
            (PhyIfId::HIF1, master.channel().layout(), master.notifier()),
            (PhyIfId::HIF0, slave.channel().layout(), slave.notifier()),
        ],
        Duration::from_micros(100),
    )
    .context("failed to start HIF engine model")?;

    let found = slave.resolve_master().context("master discovery failed")?;
    if found != PhyIfId::HIF1 {
        bail!("discovered master on {found}, expected HIF1");
    }
    tracing::info!(master = %found, "slave found master");

    for (name, id) in [("lock", rpc_id::IF_LOCK), ("unlock", rpc_id::IF_UNLOCK)] {
        let reply = slave
            .engine()
            .master_rpc(id, &[], &mut [])
            .with_context(|| format!("{name} RPC failed"))?;
        tracing::info!(rpc = name, code = reply.return_code, "RPC completed");
    }

    let stats = loopback.stop();
    tracing::info!(
        tx = stats.tx_frames,
        rx = stats.rx_frames,
        dropped = stats.dropped,
        "engine model stopped"
    );
    slave.shutdown();
    master.shutdown();
    Ok(())
}
