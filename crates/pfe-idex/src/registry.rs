//! In-flight IDEX requests keyed by sequence number.
//!
//! Every record ends exactly once: it is either finalized (response, timeout) and its waiter
//! completed, or invalidated after a failed transmit and later disposed of by the supervisor.
//! Both paths remove the record under the table lock, so a late response racing a timeout finds
//! nothing to complete the second time.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pfe_ct::PhyIfId;
use pfe_idex_protocol::RequestType;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::RegistryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Registered, not yet handed to the transport.
    New,
    /// About to be sent.
    Committed,
    /// Taken by the transport.
    Transmitted,
    /// Transmit failed; waiting for the supervisor to dispose of it.
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
    Success,
    Timeout,
}

/// What a blocked caller receives when its request is finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: RequestResult,
    /// Response message bytes (after the response record).
    pub response: Option<Vec<u8>>,
}

pub type Waiter = oneshot::Receiver<Completion>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub registered: u64,
    /// Successful finalizations, timeouts included.
    pub finalized: u64,
    pub timed_out: u64,
    pub invalidated: u64,
    /// Records removed without signaling (invalid ones, and everything left at shutdown).
    pub disposed: u64,
}

struct Record {
    request_type: RequestType,
    dst_phy_if: PhyIfId,
    state: RequestState,
    countdown: u32,
    waiter: Option<oneshot::Sender<Completion>>,
}

struct Table {
    next_seq: u32,
    records: HashMap<u32, Record>,
    stats: RegistryStats,
}

/// Result of one supervisor pass over the table.
#[must_use]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AgeReport {
    /// Requests finalized with a timeout, in no particular order.
    pub expired: Vec<u32>,
    pub disposed: usize,
}

pub struct RequestRegistry {
    table: Mutex<Table>,
    timeout_ticks: u32,
}

impl RequestRegistry {
    /// Registry whose sequence numbers start at a random value.
    pub fn new(timeout_ticks: u32) -> Self {
        Self::with_seed(timeout_ticks, rand::random())
    }

    pub fn with_seed(timeout_ticks: u32, first_seq: u32) -> Self {
        Self {
            table: Mutex::new(Table {
                next_seq: first_seq,
                records: HashMap::new(),
                stats: RegistryStats::default(),
            }),
            timeout_ticks: timeout_ticks.max(1),
        }
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a `NEW` record. With `blocking`, the returned waiter completes on finalize.
    pub fn register(
        &self,
        request_type: RequestType,
        dst_phy_if: PhyIfId,
        blocking: bool,
    ) -> (u32, Option<Waiter>) {
        let (sender, waiter) = if blocking {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut table = self.table();
        let mut seq = table.next_seq;
        while table.records.contains_key(&seq) {
            seq = seq.wrapping_add(1);
        }
        table.next_seq = seq.wrapping_add(1);
        table.records.insert(
            seq,
            Record {
                request_type,
                dst_phy_if,
                state: RequestState::New,
                countdown: self.timeout_ticks,
                waiter: sender,
            },
        );
        table.stats.registered += 1;
        (seq, waiter)
    }

    fn transition(&self, seq: u32, from: RequestState, to: RequestState) -> Result<(), RegistryError> {
        let mut table = self.table();
        let record = table.records.get_mut(&seq).ok_or(RegistryError::NotFound(seq))?;
        if record.state != from {
            return Err(RegistryError::InvalidTransition {
                seq,
                state: record.state,
                target: to,
            });
        }
        record.state = to;
        Ok(())
    }

    pub fn mark_committed(&self, seq: u32) -> Result<(), RegistryError> {
        self.transition(seq, RequestState::New, RequestState::Committed)
    }

    pub fn mark_transmitted(&self, seq: u32) -> Result<(), RegistryError> {
        self.transition(seq, RequestState::Committed, RequestState::Transmitted)
    }

    /// Removes the record and completes its waiter, if any.
    pub fn finalize(
        &self,
        seq: u32,
        result: RequestResult,
        response: Option<Vec<u8>>,
    ) -> Result<(), RegistryError> {
        let record = {
            let mut table = self.table();
            let record = table.records.remove(&seq).ok_or(RegistryError::NotFound(seq))?;
            table.stats.finalized += 1;
            if result == RequestResult::Timeout {
                table.stats.timed_out += 1;
            }
            record
        };
        complete(seq, record, Completion { result, response });
        Ok(())
    }

    /// Marks a request whose transmit failed. The supervisor disposes of it on its next pass.
    pub fn invalidate(&self, seq: u32) -> Result<(), RegistryError> {
        let mut table = self.table();
        let record = table.records.get_mut(&seq).ok_or(RegistryError::NotFound(seq))?;
        if record.state == RequestState::Invalid {
            return Err(RegistryError::InvalidTransition {
                seq,
                state: RequestState::Invalid,
                target: RequestState::Invalid,
            });
        }
        record.state = RequestState::Invalid;
        table.stats.invalidated += 1;
        Ok(())
    }

    pub fn state(&self, seq: u32) -> Option<RequestState> {
        self.table().records.get(&seq).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.table().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.table().stats
    }

    /// One supervisor tick: counts down sent requests, expires those reaching zero and disposes
    /// of invalid ones. `NEW` records are left alone.
    pub fn age(&self) -> AgeReport {
        let (expired, disposed) = {
            let mut table = self.table();
            let mut expiring = Vec::new();
            let mut invalid = Vec::new();
            for (&seq, record) in table.records.iter_mut() {
                match record.state {
                    RequestState::New => {}
                    RequestState::Committed | RequestState::Transmitted => {
                        record.countdown = record.countdown.saturating_sub(1);
                        if record.countdown == 0 {
                            expiring.push(seq);
                        }
                    }
                    RequestState::Invalid => invalid.push(seq),
                }
            }
            for seq in &invalid {
                table.records.remove(seq);
            }
            let expired: Vec<(u32, Record)> = expiring
                .into_iter()
                .filter_map(|seq| table.records.remove(&seq).map(|record| (seq, record)))
                .collect();
            table.stats.disposed += invalid.len() as u64;
            table.stats.finalized += expired.len() as u64;
            table.stats.timed_out += expired.len() as u64;
            (expired, invalid.len())
        };

        let mut report = AgeReport {
            expired: Vec::with_capacity(expired.len()),
            disposed,
        };
        for (seq, record) in expired {
            if record.state == RequestState::Committed {
                warn!(seq, phy_if = %record.dst_phy_if, "IDEX request timed out before transmit completed");
            } else {
                debug!(seq, phy_if = %record.dst_phy_if, kind = ?record.request_type, "IDEX request timed out");
            }
            report.expired.push(seq);
            complete(
                seq,
                record,
                Completion {
                    result: RequestResult::Timeout,
                    response: None,
                },
            );
        }
        report
    }

    /// Removes every record without completing its waiter; blocked callers observe a closed
    /// channel. Returns the number of records removed.
    pub fn drain(&self) -> usize {
        let records: Vec<(u32, Record)> = {
            let mut table = self.table();
            let records: Vec<_> = table.records.drain().collect();
            table.stats.disposed += records.len() as u64;
            records
        };
        for (seq, record) in &records {
            if record.state == RequestState::New {
                warn!(seq, "IDEX request still NEW at shutdown");
            }
        }
        records.len()
    }
}

fn complete(seq: u32, record: Record, completion: Completion) {
    if let Some(waiter) = record.waiter {
        if waiter.send(completion).is_err() {
            debug!(seq, "IDEX waiter already gone");
        }
    }
}
