use std::time::Duration;

use pfe_ct::PhyIfId;
use pfe_hif::{
    DmaMemory, HeapDma, HifChannel, HifConfig, HifEngineModel, HifError, RxFlags, TxFlags,
};

fn config(channel_id: u8) -> HifConfig {
    HifConfig {
        channel_id,
        ring_len: 16,
        bd_timeout: Duration::from_micros(100),
        ..HifConfig::default()
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn payload_survives_hif0_to_hif1_through_non_coherent_memory() {
    let dma = HeapDma::non_coherent(1 << 20);
    let hif0 = HifChannel::create(dma.clone(), config(0)).unwrap();
    let hif1 = HifChannel::create(dma.clone(), config(1)).unwrap();

    let mut engine = HifEngineModel::new(dma.clone());
    engine.attach(hif0.phy_if(), hif0.layout());
    engine.attach(hif1.phy_if(), hif1.layout());

    for (i, len) in [0usize, 1, 63, 64, 1500].into_iter().enumerate() {
        let payload = pattern(len, i as u8);
        hif0.transmit(&payload, PhyIfId::HIF1.egress_bit(), TxFlags::IHC)
            .unwrap();
        assert_eq!(engine.step(), 1);

        let rx = hif1.receive(true).unwrap();
        assert_eq!(rx.len(), len, "payload length {len}");
        assert_eq!(hif1.read_rx(&rx), payload, "payload bytes for length {len}");

        let header = hif1.rx_header(&rx).unwrap();
        assert_eq!(header.i_phy_if, PhyIfId::HIF0);
        assert!(header.flags.contains(RxFlags::IHC));

        hif1.free(rx).unwrap();
        assert_eq!(hif1.receive(true).unwrap_err(), HifError::WouldBlock);
    }

    let stats = engine.stats();
    assert_eq!(stats.tx_frames, 5);
    assert_eq!(stats.rx_frames, 5);
    assert_eq!(stats.dropped, 0);
}

#[test]
fn raw_receive_keeps_the_firmware_header() {
    let dma = HeapDma::coherent(1 << 20);
    let hif0 = HifChannel::create(dma.clone(), config(0)).unwrap();
    let mut engine = HifEngineModel::new(dma.clone());
    engine.attach(hif0.phy_if(), hif0.layout());

    hif0.transmit(b"loop", PhyIfId::HIF0.egress_bit(), TxFlags::INJECT)
        .unwrap();
    engine.step();

    let rx = hif0.receive(false).unwrap();
    assert_eq!(rx.len(), pfe_ct::HIF_HEADER_SIZE + 4);
    let raw = hif0.read_rx(&rx);
    assert_eq!(&raw[pfe_ct::HIF_HEADER_SIZE..], b"loop");
    assert_eq!(raw[4], PhyIfId::HIF0.raw());
    hif0.free(rx).unwrap();
}

#[test]
fn frames_without_an_armed_rx_slot_are_dropped_by_hardware() {
    let dma = HeapDma::coherent(1 << 20);
    let hif0 = HifChannel::create(dma.clone(), config(0)).unwrap();
    let hif1 = HifChannel::create(dma.clone(), HifConfig { ring_len: 2, ..config(1) }).unwrap();
    let mut engine = HifEngineModel::new(dma.clone());
    engine.attach(hif0.phy_if(), hif0.layout());
    engine.attach(hif1.phy_if(), hif1.layout());

    for _ in 0..3 {
        hif0.transmit(b"x", PhyIfId::HIF1.egress_bit(), TxFlags::IHC)
            .unwrap();
        engine.step();
    }
    assert_eq!(engine.stats().rx_frames, 2);
    assert_eq!(engine.stats().dropped, 1);

    let first = hif1.receive(true).unwrap();
    let second = hif1.receive(true).unwrap();
    assert_eq!(hif1.receive(true).unwrap_err(), HifError::WouldBlock);
    hif1.free(first).unwrap();
    hif1.free(second).unwrap();
}

#[test]
fn rx_notification_fires_per_delivered_frame() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let dma = HeapDma::coherent(1 << 20);
    let hif0 = HifChannel::create(dma.clone(), config(0)).unwrap();
    let hif1 = HifChannel::create(dma.clone(), config(1)).unwrap();
    let mut engine = HifEngineModel::new(dma.clone());
    engine.attach(hif0.phy_if(), hif0.layout());
    engine.attach(hif1.phy_if(), hif1.layout());

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    engine.on_rx(move |phy_if| {
        assert_eq!(phy_if, PhyIfId::HIF1);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    hif0.transmit(b"a", PhyIfId::HIF1.egress_bit(), TxFlags::IHC).unwrap();
    hif0.transmit(b"b", PhyIfId::HIF1.egress_bit(), TxFlags::IHC).unwrap();
    assert_eq!(engine.step(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn destroy_releases_all_dma_memory() {
    let dma = HeapDma::coherent(1 << 20);
    let hif0 = HifChannel::create(dma.clone(), config(0)).unwrap();
    let mut engine = HifEngineModel::new(dma.clone());
    engine.attach(hif0.phy_if(), hif0.layout());

    hif0.transmit(b"held", PhyIfId::HIF0.egress_bit(), TxFlags::IHC)
        .unwrap();
    engine.step();
    // The caller still holds this buffer when the channel goes away.
    let held = hif0.receive(true).unwrap();
    assert!(dma.live_allocations() > 0);

    engine.detach(hif0.phy_if());
    hif0.destroy();
    // Leaked to the caller; freeing it is the caller's business.
    dma.free(held.addr());
    assert_eq!(dma.live_allocations(), 0);
}
