use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pfe_ct::PhyIfId;
use pfe_hif::{ChannelLayout, EngineStats, HeapDma, HifEngineModel};
use pfe_idex::RxNotifier;
use tracing::trace;

/// Runs [`HifEngineModel`] on a thread, ringing each port's RX doorbell on delivery.
pub struct Loopback {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<EngineStats>>,
}

impl Loopback {
    pub fn start(
        mem: &HeapDma,
        ports: Vec<(PhyIfId, ChannelLayout, RxNotifier)>,
        period: Duration,
    ) -> std::io::Result<Self> {
        let mut model = HifEngineModel::new(mem.clone());
        let mut notifiers = HashMap::with_capacity(ports.len());
        for (phy_if, layout, notifier) in ports {
            model.attach(phy_if, layout);
            notifiers.insert(phy_if, notifier);
        }
        model.on_rx(move |phy_if| {
            if let Some(notifier) = notifiers.get(&phy_if) {
                notifier.notify();
            }
        });

        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("hif-loopback".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    let consumed = model.step();
                    if consumed == 0 {
                        thread::sleep(period);
                    } else {
                        trace!(consumed, "loopback step");
                    }
                }
                model.stats()
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stops the engine thread and returns its counters.
    pub fn stop(mut self) -> EngineStats {
        self.halt()
    }

    fn halt(&mut self) -> EngineStats {
        self.stop.store(true, Ordering::Relaxed);
        self.thread
            .take()
            .and_then(|thread| thread.join().ok())
            .unwrap_or_default()
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.halt();
        }
    }
}
