mod common;

use std::sync::mpsc;
use std::time::Duration;

use common::{FakeTransport, Pump, Reply};
use pfe_ct::{PhyIfId, IDEX_DISCOVERY_CANDIDATES};
use pfe_idex::{IdexConfig, IdexEngine, IdexError, IdexRuntime, InboundRpc, Role};
use pfe_idex_protocol::{
    decode_frame, encode_request_into, Frame, RequestType, RpcEnvelope,
};

fn fast_discovery() -> IdexConfig {
    IdexConfig {
        discovery_period: Duration::from_millis(1),
        ..IdexConfig::default()
    }
}

#[test]
fn unanswered_discovery_sends_rounds_times_candidates() {
    let engine = IdexEngine::new(FakeTransport::silent(PhyIfId::HIF2), fast_discovery());

    let err = engine.discover_master(&IDEX_DISCOVERY_CANDIDATES).unwrap_err();
    assert!(matches!(err, IdexError::NoMasterFound));

    let sent = engine.transport().sent();
    assert_eq!(sent.len(), 20);
    for (i, (dst, frame)) in sent.iter().enumerate() {
        assert_eq!(*dst, IDEX_DISCOVERY_CANDIDATES[i % 2]);
        let Ok(Frame::Request { record, .. }) = decode_frame(frame) else {
            panic!("discovery must send requests");
        };
        assert_eq!(record.request_type, RequestType::MasterDiscovery);
        assert_eq!(record.dst_phy_if, *dst);
    }
    assert_eq!(engine.master_phy_if(), None);
}

#[test]
fn first_answer_records_the_master() {
    let transport = FakeTransport::new(PhyIfId::HIF0, |_, kind| match kind {
        RequestType::MasterDiscovery => Reply::Master(PhyIfId::HIF1),
        RequestType::Rpc => Reply::Silent,
    });
    let engine = IdexEngine::new(
        transport,
        IdexConfig {
            discovery_period: Duration::from_secs(5),
            ..IdexConfig::default()
        },
    );
    let _pump = Pump::start(&engine);

    assert_eq!(
        engine.discover_master(&[PhyIfId::HIF1]).unwrap(),
        PhyIfId::HIF1
    );
    assert_eq!(engine.master_phy_if(), Some(PhyIfId::HIF1));
    // Known now, so no further traffic.
    assert_eq!(
        engine.discover_master(&[PhyIfId::HIF1]).unwrap(),
        PhyIfId::HIF1
    );
    assert_eq!(engine.transport().sent_count(), 1);
}

#[test]
fn master_resolves_to_itself() {
    let engine = IdexEngine::new(FakeTransport::silent(PhyIfId::HIF1), IdexConfig::master());
    assert_eq!(
        engine.discover_master(&IDEX_DISCOVERY_CANDIDATES).unwrap(),
        PhyIfId::HIF1
    );
    assert_eq!(engine.transport().sent_count(), 0);
}

#[test]
fn runtime_serves_inbound_rpcs_on_rx_events() {
    let engine = IdexEngine::new(
        FakeTransport::silent(PhyIfId::HIF1),
        IdexConfig {
            role: Role::Master,
            ..IdexConfig::default()
        },
    );
    let (seen_tx, seen_rx) = mpsc::channel();
    let seen_tx = std::sync::Mutex::new(seen_tx);
    engine.set_rpc_handler(move |rpc: InboundRpc<'_>| {
        let _ = seen_tx.lock().unwrap().send((rpc.requester(), rpc.rpc_id()));
        rpc.set_rpc_result(0, &[]).unwrap();
    });
    let runtime = IdexRuntime::start(&engine).unwrap();

    let message = RpcEnvelope {
        rpc_id: 0xBE,
        return_code: 0,
        payload: &[],
    }
    .encode()
    .unwrap();
    let mut frame = Vec::new();
    encode_request_into(PhyIfId::HIF1, 9, RequestType::Rpc, &message, &mut frame);
    engine.transport().push_inbound(PhyIfId::HIF0, frame);
    runtime.notifier().notify();

    assert_eq!(
        seen_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        (PhyIfId::HIF0, 0xBE)
    );
    assert_eq!(runtime.shutdown(), 0);

    let sent = engine.transport().sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, PhyIfId::HIF0);
    assert!(engine.is_closed());
}

#[test]
fn shutdown_wakes_blocked_callers() {
    let engine = IdexEngine::new(
        FakeTransport::silent(PhyIfId::HIF0),
        IdexConfig {
            request_timeout_ticks: 1000,
            tick_period: Duration::from_secs(60),
            ..IdexConfig::default()
        },
    );
    let runtime = IdexRuntime::start(&engine).unwrap();

    let caller = {
        let engine = engine.clone();
        std::thread::spawn(move || engine.call_remote(PhyIfId::HIF1, 1, &[], &mut []))
    };
    while engine.transport().sent_count() == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(runtime.shutdown(), 1);
    assert!(matches!(caller.join().unwrap(), Err(IdexError::Shutdown)));
}
