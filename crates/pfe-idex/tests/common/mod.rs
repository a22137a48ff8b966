#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pfe_ct::PhyIfId;
use pfe_hif::HifError;
use pfe_idex::{IdexEngine, IhcPacket, IhcTransport};
use pfe_idex_protocol::{
    decode_frame, encode_response_into, Frame, MasterDiscovery, RequestType, RpcEnvelope,
};

/// What the scripted peer does with a request.
pub enum Reply {
    Silent,
    Rpc { code: i32, payload: Vec<u8> },
    /// Answers with a different rpc id than asked for.
    WrongRpc,
    Master(PhyIfId),
}

type Peer = Box<dyn Fn(u32, RequestType) -> Reply + Send + Sync>;

/// In-memory transport with scripted send failures and a scripted remote peer.
pub struct FakeTransport {
    local: PhyIfId,
    failures: Mutex<VecDeque<HifError>>,
    sent: Mutex<Vec<(PhyIfId, Vec<u8>)>>,
    inbox: Mutex<VecDeque<IhcPacket>>,
    peer: Peer,
}

impl FakeTransport {
    pub fn new(local: PhyIfId, peer: impl Fn(u32, RequestType) -> Reply + Send + Sync + 'static) -> Self {
        Self {
            local,
            failures: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(VecDeque::new()),
            peer: Box::new(peer),
        }
    }

    pub fn silent(local: PhyIfId) -> Self {
        Self::new(local, |_, _| Reply::Silent)
    }

    /// The next `send` calls fail with these errors, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = HifError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn push_inbound(&self, ingress: PhyIfId, frame: Vec<u8>) {
        self.inbox.lock().unwrap().push_back(IhcPacket { ingress, frame });
    }

    pub fn sent(&self) -> Vec<(PhyIfId, Vec<u8>)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl IhcTransport for FakeTransport {
    fn send(&self, dst: PhyIfId, frame: &[u8]) -> Result<(), HifError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push((dst, frame.to_vec()));

        let Ok(Frame::Request { record, message, .. }) = decode_frame(frame) else {
            return Ok(());
        };
        let rpc_id = RpcEnvelope::decode(message).map(|env| env.rpc_id).unwrap_or(0);
        let reply = match (self.peer)(rpc_id, record.request_type) {
            Reply::Silent => return Ok(()),
            Reply::Rpc { code, payload } => RpcEnvelope {
                rpc_id,
                return_code: code,
                payload: &payload,
            }
            .encode()
            .unwrap(),
            Reply::WrongRpc => RpcEnvelope {
                rpc_id: rpc_id ^ 1,
                return_code: 0,
                payload: &[],
            }
            .encode()
            .unwrap(),
            Reply::Master(phy_if) => MasterDiscovery { phy_if }.encode().to_vec(),
        };
        let mut response = Vec::new();
        encode_response_into(self.local, record.seq, record.request_type, &reply, &mut response)
            .unwrap();
        self.push_inbound(dst, response);
        Ok(())
    }

    fn recv(&self) -> Result<Option<IhcPacket>, HifError> {
        Ok(self.inbox.lock().unwrap().pop_front())
    }

    fn local_phy_if(&self) -> Option<PhyIfId> {
        Some(self.local)
    }
}

/// Drains an engine on a background thread until dropped.
pub struct Pump {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Pump {
    pub fn start<T: IhcTransport + 'static>(engine: &IdexEngine<T>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let engine = engine.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                engine.drain();
                thread::sleep(Duration::from_micros(200));
            }
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
