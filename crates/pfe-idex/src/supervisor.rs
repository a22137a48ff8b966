//! Periodic request ageing.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace};

use crate::registry::{AgeReport, RequestRegistry};

pub type TickReport = AgeReport;

#[derive(Clone)]
pub struct TimeoutSupervisor {
    registry: Arc<RequestRegistry>,
}

impl TimeoutSupervisor {
    pub fn new(registry: Arc<RequestRegistry>) -> Self {
        Self { registry }
    }

    /// Runs one ageing pass. Driven by the supervisor thread, or directly from tests.
    pub fn tick(&self) -> TickReport {
        let report = self.registry.age();
        if !report.expired.is_empty() || report.disposed > 0 {
            debug!(
                expired = report.expired.len(),
                disposed = report.disposed,
                "IDEX supervisor tick"
            );
        }
        report
    }

    /// Ticks every `period` on a dedicated thread until the handle is shut down.
    pub fn spawn(self, period: Duration) -> std::io::Result<SupervisorHandle> {
        let (quit_tx, quit_rx) = mpsc::channel::<()>();
        let registry = Arc::clone(&self.registry);
        let thread = thread::Builder::new()
            .name("idex-supervisor".into())
            .spawn(move || loop {
                match quit_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        let _ = self.tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        trace!("IDEX supervisor stopping");
                        break;
                    }
                }
            })?;
        Ok(SupervisorHandle {
            registry,
            quit_tx: Some(quit_tx),
            thread: Some(thread),
        })
    }
}

/// Owns the supervisor thread. Stopping it drains every outstanding request.
pub struct SupervisorHandle {
    registry: Arc<RequestRegistry>,
    quit_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SupervisorHandle {
    /// Stops the thread and drains the registry; blocked callers wake with a shutdown error.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        if let Some(tx) = self.quit_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let drained = self.registry.drain();
        if drained > 0 {
            debug!(drained, "IDEX requests dropped at shutdown");
        }
        drained
    }
}

impl Drop for SupervisorHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
