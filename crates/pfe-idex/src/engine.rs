//! IDEX request/response engine.
//!
//! Outbound calls register a sequence number, send a REQUEST and block on a one-shot until the
//! matching RESPONSE is dispatched or the supervisor times the request out. Inbound frames are fed
//! to [`IdexEngine::dispatch_inbound`], normally from the drain thread of
//! [`IdexRuntime`](crate::IdexRuntime).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};

use pfe_ct::PhyIfId;
use pfe_hif::HifError;
use pfe_idex_protocol::{
    decode_frame, encode_request_into, encode_response_into, Frame, MasterDiscovery, RequestType,
    RpcEnvelope, FRAME_HEADER_LEN, REQUEST_RECORD_LEN, RESPONSE_RECORD_LEN, RPC_ENVELOPE_HEADER_LEN,
};
use tracing::{debug, error, info, trace, warn};

use crate::config::IdexConfig;
use crate::error::IdexError;
use crate::lock;
use crate::registry::{RequestRegistry, RequestResult};
use crate::supervisor::TimeoutSupervisor;
use crate::transport::IhcTransport;

/// Outcome of a successful remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcReply {
    pub return_code: i32,
    /// Bytes written to the caller's response buffer.
    pub response_len: usize,
}

/// Serves RPC requests from other driver instances.
pub trait RpcHandler: Send + Sync {
    fn handle(&self, rpc: InboundRpc<'_>);
}

impl<F> RpcHandler for F
where
    F: Fn(InboundRpc<'_>) + Send + Sync,
{
    fn handle(&self, rpc: InboundRpc<'_>) {
        self(rpc)
    }
}

/// One inbound RPC request. Answer it with [`InboundRpc::set_rpc_result`].
pub struct InboundRpc<'a> {
    transport: &'a dyn IhcTransport,
    requester: PhyIfId,
    seq: u32,
    rpc_id: u32,
    payload: &'a [u8],
    responded: bool,
}

impl<'a> InboundRpc<'a> {
    pub fn requester(&self) -> PhyIfId {
        self.requester
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn rpc_id(&self) -> u32 {
        self.rpc_id
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Sends the RESPONSE for this request back to the requester.
    pub fn set_rpc_result(mut self, return_code: i32, response: &[u8]) -> Result<(), IdexError> {
        self.responded = true;
        let mut message = Vec::with_capacity(RPC_ENVELOPE_HEADER_LEN + response.len());
        RpcEnvelope {
            rpc_id: self.rpc_id,
            return_code,
            payload: response,
        }
        .encode_into(&mut message)
        .map_err(|_| IdexError::RequestTooLarge(response.len()))?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + RESPONSE_RECORD_LEN + message.len());
        encode_response_into(self.requester, self.seq, RequestType::Rpc, &message, &mut frame)
            .map_err(|_| IdexError::RequestTooLarge(response.len()))?;

        self.transport.send(self.requester, &frame).map_err(|err| {
            error!(seq = self.seq, rpc_id = self.rpc_id, phy_if = %self.requester, %err, "failed to send RPC response");
            IdexError::Transport(err)
        })
    }
}

impl Drop for InboundRpc<'_> {
    fn drop(&mut self) {
        if !self.responded {
            warn!(seq = self.seq, rpc_id = self.rpc_id, phy_if = %self.requester, "RPC request dropped without a result");
        }
    }
}

struct EngineInner<T> {
    transport: T,
    registry: Arc<RequestRegistry>,
    config: IdexConfig,
    local_phy_if: Mutex<Option<PhyIfId>>,
    master: Mutex<Option<PhyIfId>>,
    master_found: Condvar,
    handler: RwLock<Option<Arc<dyn RpcHandler>>>,
    closed: AtomicBool,
}

pub struct IdexEngine<T> {
    inner: Arc<EngineInner<T>>,
}

impl<T> Clone for IdexEngine<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: IhcTransport + 'static> IdexEngine<T> {
    pub fn new(transport: T, config: IdexConfig) -> Self {
        let registry = Arc::new(RequestRegistry::new(config.request_timeout_ticks));
        Self::with_registry(transport, config, registry)
    }

    /// Engine sharing an existing registry, e.g. one seeded deterministically.
    pub fn with_registry(transport: T, config: IdexConfig, registry: Arc<RequestRegistry>) -> Self {
        let local = config.local_phy_if.or_else(|| transport.local_phy_if());
        let master = if config.is_master() {
            local
        } else {
            config.master_phy_if
        };
        Self {
            inner: Arc::new(EngineInner {
                transport,
                registry,
                config,
                local_phy_if: Mutex::new(local),
                master: Mutex::new(master),
                master_found: Condvar::new(),
                handler: RwLock::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &IdexConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.inner.registry
    }

    pub fn supervisor(&self) -> TimeoutSupervisor {
        TimeoutSupervisor::new(Arc::clone(&self.inner.registry))
    }

    pub fn local_phy_if(&self) -> Option<PhyIfId> {
        *lock(&self.inner.local_phy_if)
    }

    pub fn master_phy_if(&self) -> Option<PhyIfId> {
        *lock(&self.inner.master)
    }

    pub fn set_rpc_handler(&self, handler: impl RpcHandler + 'static) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn clear_rpc_handler(&self) {
        *self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Refuses new calls. Calls already blocked finish once the registry is drained.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.master_found.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Calls `rpc_id` on the driver reachable through `dst` and copies its result payload into
    /// `response`. Each attempt uses a fresh sequence number.
    pub fn call_remote(
        &self,
        dst: PhyIfId,
        rpc_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<RpcReply, IdexError> {
        let mut message = Vec::with_capacity(RPC_ENVELOPE_HEADER_LEN + request.len());
        RpcEnvelope {
            rpc_id,
            return_code: 0,
            payload: request,
        }
        .encode_into(&mut message)
        .map_err(|_| IdexError::RequestTooLarge(request.len()))?;

        let attempts = self.inner.config.rpc_attempts.max(1);
        let mut last = IdexError::TimedOut;
        for attempt in 1..=attempts {
            match self.call_once(dst, rpc_id, &message, response) {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_retryable() => {
                    debug!(attempt, rpc_id, phy_if = %dst, %err, "IDEX RPC attempt failed");
                    last = err;
                }
                Err(err) => return Err(err),
            }
        }
        warn!(rpc_id, phy_if = %dst, attempts, err = %last, "IDEX RPC failed");
        Err(last)
    }

    /// [`call_remote`](Self::call_remote) against the master.
    pub fn master_rpc(
        &self,
        rpc_id: u32,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<RpcReply, IdexError> {
        let master = self.master_phy_if().ok_or(IdexError::NoMasterFound)?;
        self.call_remote(master, rpc_id, request, response)
    }

    fn call_once(
        &self,
        dst: PhyIfId,
        rpc_id: u32,
        message: &[u8],
        response: &mut [u8],
    ) -> Result<RpcReply, IdexError> {
        if self.is_closed() {
            return Err(IdexError::Shutdown);
        }
        let registry = &self.inner.registry;
        let (seq, waiter) = registry.register(RequestType::Rpc, dst, true);
        let waiter = waiter.ok_or(IdexError::Shutdown)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + REQUEST_RECORD_LEN + message.len());
        encode_request_into(dst, seq, RequestType::Rpc, message, &mut frame);
        self.send_request(seq, dst, &frame)?;

        let completion = waiter.blocking_recv().map_err(|_| IdexError::Shutdown)?;
        if completion.result == RequestResult::Timeout {
            return Err(IdexError::TimedOut);
        }
        let bytes = completion.response.unwrap_or_default();
        let env = RpcEnvelope::decode(&bytes)?;
        if env.rpc_id != rpc_id {
            return Err(IdexError::ResponseMismatch {
                expected: rpc_id,
                got: env.rpc_id,
            });
        }
        if env.return_code != 0 {
            warn!(seq, rpc_id, code = env.return_code, "remote rejected IDEX RPC");
            return Err(IdexError::RemoteRejected {
                code: env.return_code,
            });
        }
        if env.payload.len() > response.len() {
            return Err(IdexError::ResponseTooLarge {
                len: env.payload.len(),
                capacity: response.len(),
            });
        }
        response[..env.payload.len()].copy_from_slice(env.payload);
        Ok(RpcReply {
            return_code: env.return_code,
            response_len: env.payload.len(),
        })
    }

    /// Commits, sends and marks a registered request. A failed send invalidates it.
    fn send_request(&self, seq: u32, dst: PhyIfId, frame: &[u8]) -> Result<(), IdexError> {
        let registry = &self.inner.registry;
        if let Err(err) = registry.mark_committed(seq) {
            debug!(seq, %err, "request vanished before commit");
        }
        match self.inner.transport.send(dst, frame) {
            Ok(()) => {
                // A fast response may already have finalized the request.
                if let Err(err) = registry.mark_transmitted(seq) {
                    debug!(seq, %err, "request finalized before transmit was recorded");
                }
                Ok(())
            }
            Err(err) => {
                debug!(seq, phy_if = %dst, %err, "IDEX request not sent");
                if let Err(err) = registry.invalidate(seq) {
                    debug!(seq, %err, "failed to invalidate unsent request");
                }
                match err {
                    HifError::PayloadTooLarge { len, .. } => Err(IdexError::RequestTooLarge(len)),
                    err => Err(IdexError::Transport(err)),
                }
            }
        }
    }

    /// Locates the master by broadcasting discovery requests to `candidates`.
    ///
    /// Every round sends one request per candidate and then waits up to one discovery period,
    /// returning early once a response names the master.
    pub fn discover_master(&self, candidates: &[PhyIfId]) -> Result<PhyIfId, IdexError> {
        if self.inner.config.is_master() {
            let local = self.local_phy_if().ok_or(IdexError::NoMasterFound)?;
            self.record_master(local);
            return Ok(local);
        }
        if let Some(master) = self.master_phy_if() {
            return Ok(master);
        }

        let period = self.inner.config.discovery_period;
        for round in 0..self.inner.config.discovery_rounds {
            if self.is_closed() {
                return Err(IdexError::Shutdown);
            }
            for &candidate in candidates {
                let (seq, _) =
                    self.inner
                        .registry
                        .register(RequestType::MasterDiscovery, candidate, false);
                let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + REQUEST_RECORD_LEN);
                encode_request_into(candidate, seq, RequestType::MasterDiscovery, &[], &mut frame);
                // Failures already invalidated the request; the next round tries again.
                let _ = self.send_request(seq, candidate, &frame);
            }

            let guard = lock(&self.inner.master);
            let (guard, _) = self
                .inner
                .master_found
                .wait_timeout_while(guard, period, |master| {
                    master.is_none() && !self.is_closed()
                })
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(master) = *guard {
                info!(phy_if = %master, round, "IDEX master discovered");
                return Ok(master);
            }
        }
        warn!(rounds = self.inner.config.discovery_rounds, "no IDEX master answered");
        Err(IdexError::NoMasterFound)
    }

    fn record_master(&self, phy_if: PhyIfId) {
        let mut master = lock(&self.inner.master);
        if master.is_none() {
            *master = Some(phy_if);
            self.inner.master_found.notify_all();
        }
    }

    fn learn_local_phy_if(&self, phy_if: PhyIfId) {
        if !phy_if.is_valid() {
            return;
        }
        let mut local = lock(&self.inner.local_phy_if);
        if local.is_none() {
            *local = Some(phy_if);
            drop(local);
            debug!(%phy_if, "learned local IDEX interface");
            if self.inner.config.is_master() {
                self.record_master(phy_if);
            }
        }
    }

    /// Handles one received IDEX frame. Malformed frames are logged and dropped.
    pub fn dispatch_inbound(&self, frame: &[u8], ingress: PhyIfId) {
        let decoded = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(phy_if = %ingress, len = frame.len(), %err, "dropping malformed IDEX frame");
                return;
            }
        };

        match decoded {
            Frame::Request {
                header,
                record,
                message,
            } => {
                self.learn_local_phy_if(header.dst_phy_if);
                match record.request_type {
                    RequestType::MasterDiscovery => self.answer_discovery(ingress, record.seq),
                    RequestType::Rpc => self.serve_rpc(ingress, record.seq, message),
                }
            }
            Frame::Response {
                record, message, ..
            } => {
                if record.response_type == RequestType::MasterDiscovery {
                    match MasterDiscovery::decode(message) {
                        Ok(found) if found.phy_if.is_valid() => self.record_master(found.phy_if),
                        Ok(found) => {
                            warn!(seq = record.seq, phy_if = %found.phy_if, "discovery response names an invalid interface");
                        }
                        Err(err) => warn!(seq = record.seq, %err, "malformed discovery response"),
                    }
                }
                if let Err(err) =
                    self.inner
                        .registry
                        .finalize(record.seq, RequestResult::Success, Some(message.to_vec()))
                {
                    debug!(seq = record.seq, %err, "response for an unknown request");
                }
            }
        }
    }

    fn answer_discovery(&self, requester: PhyIfId, seq: u32) {
        if !self.inner.config.is_master() {
            trace!(seq, phy_if = %requester, "ignoring discovery request, not the master");
            return;
        }
        let Some(local) = self.local_phy_if() else {
            warn!(seq, "cannot answer discovery, local interface unknown");
            return;
        };
        let message = MasterDiscovery { phy_if: local }.encode();
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + RESPONSE_RECORD_LEN + message.len());
        if encode_response_into(requester, seq, RequestType::MasterDiscovery, &message, &mut frame)
            .is_err()
        {
            return;
        }
        if let Err(err) = self.inner.transport.send(requester, &frame) {
            error!(seq, phy_if = %requester, %err, "failed to answer master discovery");
        }
    }

    fn serve_rpc(&self, requester: PhyIfId, seq: u32, message: &[u8]) {
        let env = match RpcEnvelope::decode(message) {
            Ok(env) => env,
            Err(err) => {
                warn!(seq, phy_if = %requester, %err, "malformed RPC request");
                return;
            }
        };
        let handler = self
            .inner
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handler) = handler else {
            warn!(seq, rpc_id = env.rpc_id, "no RPC handler installed, dropping request");
            return;
        };
        trace!(seq, rpc_id = env.rpc_id, phy_if = %requester, "serving RPC");
        handler.handle(InboundRpc {
            transport: &self.inner.transport,
            requester,
            seq,
            rpc_id: env.rpc_id,
            payload: env.payload,
            responded: false,
        });
    }

    /// Dispatches every frame currently queued on the transport. Never blocks.
    pub fn drain(&self) -> usize {
        let mut handled = 0;
        loop {
            match self.inner.transport.recv() {
                Ok(Some(packet)) => {
                    self.dispatch_inbound(&packet.frame, packet.ingress);
                    handled += 1;
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "IHC receive failed");
                    break;
                }
            }
        }
        handled
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use pfe_hif::{HeapDma, HifChannel, HifConfig};

    use super::*;
    use crate::transport::IhcPacket;

    #[derive(Default)]
    struct Capture {
        sent: Mutex<Vec<(PhyIfId, Vec<u8>)>>,
    }

    impl IhcTransport for Capture {
        fn send(&self, dst: PhyIfId, frame: &[u8]) -> Result<(), HifError> {
            self.sent.lock().unwrap().push((dst, frame.to_vec()));
            Ok(())
        }

        fn recv(&self) -> Result<Option<IhcPacket>, HifError> {
            Ok(None)
        }
    }

    fn rpc_request(dst: PhyIfId, seq: u32, rpc_id: u32, payload: &[u8]) -> Vec<u8> {
        let message = RpcEnvelope {
            rpc_id,
            return_code: 0,
            payload,
        }
        .encode()
        .unwrap();
        let mut frame = Vec::new();
        encode_request_into(dst, seq, RequestType::Rpc, &message, &mut frame);
        frame
    }

    #[test]
    fn handler_result_goes_back_to_the_requester() {
        let engine = IdexEngine::new(Capture::default(), IdexConfig::master());
        engine.set_rpc_handler(|rpc: InboundRpc<'_>| {
            let mut out = rpc.payload().to_vec();
            out.reverse();
            rpc.set_rpc_result(-5, &out).unwrap();
        });

        engine.dispatch_inbound(&rpc_request(PhyIfId::HIF1, 77, 0xBE, &[1, 2, 3]), PhyIfId::HIF0);

        let sent = engine.transport().sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (dst, frame) = &sent[0];
        assert_eq!(*dst, PhyIfId::HIF0);
        let Frame::Response { record, message, .. } = decode_frame(frame).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(record.seq, 77);
        let env = RpcEnvelope::decode(message).unwrap();
        assert_eq!((env.rpc_id, env.return_code, env.payload), (0xBE, -5, &[3, 2, 1][..]));
    }

    #[test]
    fn local_interface_is_learned_from_requests() {
        let engine = IdexEngine::new(Capture::default(), IdexConfig::master());
        assert_eq!(engine.local_phy_if(), None);
        assert_eq!(engine.master_phy_if(), None);

        let mut frame = Vec::new();
        encode_request_into(PhyIfId::HIF1, 3, RequestType::MasterDiscovery, &[], &mut frame);
        engine.dispatch_inbound(&frame, PhyIfId::HIF0);

        assert_eq!(engine.local_phy_if(), Some(PhyIfId::HIF1));
        assert_eq!(engine.master_phy_if(), Some(PhyIfId::HIF1));
        let sent = engine.transport().sent.lock().unwrap();
        let Frame::Response { record, message, .. } = decode_frame(&sent[0].1).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(record.response_type, RequestType::MasterDiscovery);
        assert_eq!(MasterDiscovery::decode(message).unwrap().phy_if, PhyIfId::HIF1);
    }

    #[test]
    fn slaves_ignore_discovery_and_unhandled_rpcs() {
        let engine = IdexEngine::new(Capture::default(), IdexConfig::default());
        let mut frame = Vec::new();
        encode_request_into(PhyIfId::HIF0, 1, RequestType::MasterDiscovery, &[], &mut frame);
        engine.dispatch_inbound(&frame, PhyIfId::HIF1);
        engine.dispatch_inbound(&rpc_request(PhyIfId::HIF0, 2, 0x66, &[]), PhyIfId::HIF1);
        engine.dispatch_inbound(&[0xFF; 3], PhyIfId::HIF1);
        assert!(engine.transport().sent.lock().unwrap().is_empty());
    }

    #[test]
    fn oversized_requests_are_refused_before_sending() {
        let engine = IdexEngine::new(Capture::default(), IdexConfig::default());
        let big = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            engine.call_remote(PhyIfId::HIF0, 1, &big, &mut []),
            Err(IdexError::RequestTooLarge(_))
        ));
        assert!(engine.registry().is_empty());
    }

    #[test]
    fn frames_larger_than_a_slot_fail_once_as_too_large() {
        let channel = HifChannel::create(HeapDma::coherent(1 << 20), HifConfig::default()).unwrap();
        let engine = IdexEngine::new(channel, IdexConfig::default());

        let err = engine
            .call_remote(PhyIfId::HIF1, 1, &[0; 1500], &mut [])
            .unwrap_err();
        assert!(matches!(err, IdexError::RequestTooLarge(1549)), "{err:?}");
        assert!(!err.is_retryable());

        let stats = engine.registry().stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.invalidated, 1);
        assert_eq!(engine.transport().tx_indices(), (0, 0));
    }
}
