use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

use tracing::{debug, trace};

use crate::engine::IdexEngine;
use crate::error::IdexError;
use crate::supervisor::SupervisorHandle;
use crate::transport::IhcTransport;

enum Job {
    Drain,
    Quit,
}

/// Doorbell for the drain thread; cheap to clone into RX interrupt callbacks.
#[derive(Clone)]
pub struct RxNotifier {
    jobs: Sender<Job>,
}

impl RxNotifier {
    /// Signals that the RX ring has data. Ignored once the runtime is shut down.
    pub fn notify(&self) {
        let _ = self.jobs.send(Job::Drain);
    }
}

/// Background threads of one IDEX node: the inbound drain worker and the timeout supervisor.
pub struct IdexRuntime<T: IhcTransport + 'static> {
    engine: IdexEngine<T>,
    jobs: Sender<Job>,
    drain_thread: Option<JoinHandle<()>>,
    supervisor: Option<SupervisorHandle>,
}

impl<T: IhcTransport + 'static> IdexRuntime<T> {
    pub fn start(engine: &IdexEngine<T>) -> Result<Self, IdexError> {
        let (jobs, rx) = mpsc::channel::<Job>();
        let worker = engine.clone();
        let drain_thread = thread::Builder::new()
            .name("idex-drain".into())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    match job {
                        Job::Drain => {
                            let handled = worker.drain();
                            trace!(handled, "IDEX drain pass");
                        }
                        Job::Quit => break,
                    }
                }
            })?;

        let supervisor = match engine.supervisor().spawn(engine.config().tick_period) {
            Ok(handle) => handle,
            Err(err) => {
                let _ = jobs.send(Job::Quit);
                let _ = drain_thread.join();
                return Err(err.into());
            }
        };

        debug!("IDEX runtime started");
        Ok(Self {
            engine: engine.clone(),
            jobs,
            drain_thread: Some(drain_thread),
            supervisor: Some(supervisor),
        })
    }

    pub fn engine(&self) -> &IdexEngine<T> {
        &self.engine
    }

    /// Schedules a drain pass on the worker thread.
    pub fn rx_event(&self) {
        let _ = self.jobs.send(Job::Drain);
    }

    pub fn notifier(&self) -> RxNotifier {
        RxNotifier {
            jobs: self.jobs.clone(),
        }
    }

    /// Stops both threads and drains the registry. Returns the number of requests dropped.
    pub fn shutdown(mut self) -> usize {
        self.stop()
    }

    fn stop(&mut self) -> usize {
        self.engine.close();
        let _ = self.jobs.send(Job::Quit);
        if let Some(thread) = self.drain_thread.take() {
            let _ = thread.join();
        }
        let dropped = self.supervisor.take().map_or(0, SupervisorHandle::shutdown);
        debug!(dropped, "IDEX runtime stopped");
        dropped
    }
}

impl<T: IhcTransport + 'static> Drop for IdexRuntime<T> {
    fn drop(&mut self) {
        if self.drain_thread.is_some() || self.supervisor.is_some() {
            self.stop();
        }
    }
}
