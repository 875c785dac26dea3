use std::collections::HashSet;
use std::sync::Arc;

use modem_core::keybook::KeyBook;
use modem_core::message::{MessageState, Termination};
use modem_core::wire;
use modem_services::{Coordinator, DecodeDefaults, DecryptPipeline, MessageStore, StartRequest};

use crate::*;

fn coordinator(network: Arc<SimulatedNetwork>, defaults: DecodeDefaults) -> Coordinator {
    Coordinator::new(MessageStore::new(), DecryptPipeline::new(2).unwrap(), defaults)
        .with_controller(controller(network))
}

fn request(device_id: u32, chunk_bits: u8, pre_shared: bool) -> StartRequest {
    StartRequest {
        device_id,
        chunk_bits: Some(chunk_bits),
        pre_shared,
    }
}

#[tokio::test]
async fn test_pre_shared_decode_stores_decrypted_reports() {
    let book = Arc::new(KeyBook::generate(DEVICE, 4, 8).unwrap());
    let beacon = Beacon::pre_shared(book.clone(), b"hi");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let coord = coordinator(network.clone(), DecodeDefaults::default()).with_keybook(book);
    let id = coord.start(request(DEVICE, 4, true)).unwrap();
    let summary = coord.wait(id).await.unwrap();

    assert_eq!(summary.text, "hi");
    assert_eq!(summary.state, MessageState::Terminated(Termination::Terminator));
    assert_eq!(summary.rounds, 6);
    assert_eq!(summary.reports_matched, network.filed() as u64);

    let reports = coord.reports(id).unwrap();
    assert_eq!(reports.len(), beacon.schedule.len() * SIGHTINGS);
    let scheduled: HashSet<String> = beacon
        .schedule
        .iter()
        .map(|k| wire::encode_hash(&k.key_hash))
        .collect();
    assert!(reports.iter().all(|r| scheduled.contains(&r.key_hash)));
    assert!(reports.iter().all(|r| r.accuracy == 15 && r.confidence == 3));
}

#[tokio::test]
async fn test_derived_decode_keeps_no_reports() {
    let beacon = Beacon::derived(8, b"ok");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let coord = coordinator(network, DecodeDefaults::default());
    let id = coord.start(request(DEVICE, 8, false)).unwrap();
    let summary = coord.wait(id).await.unwrap();

    assert_eq!(summary.text, "ok");
    assert_eq!(summary.seeding, "derived");
    assert_eq!(summary.reports_matched, (3 * SIGHTINGS) as u64);
    assert!(coord.reports(id).unwrap().is_empty());
}

#[tokio::test]
async fn test_devices_decode_concurrently() {
    let first = Beacon::derived(8, b"one");
    let second = Beacon::new(0x0BAD_F00D, 8, derived(), b"two");
    let network = SimulatedNetwork::new();
    network.broadcast(&first, &[]);
    network.broadcast(&second, &[]);

    let coord = coordinator(network, DecodeDefaults::default());
    let a = coord.start(request(first.device_id, 8, false)).unwrap();
    let b = coord.start(request(second.device_id, 8, false)).unwrap();
    assert_ne!(a, b);

    let (done_a, done_b) = tokio::join!(coord.wait(a), coord.wait(b));
    assert_eq!(done_a.unwrap().text, "one");
    assert_eq!(done_b.unwrap().text, "two");

    let status = coord.status();
    assert_eq!(status.messages, 2);
    assert_eq!(status.running, 0);
    let ids: Vec<u32> = coord.list().iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a, b]);
}

#[tokio::test]
async fn test_finished_device_can_be_decoded_again() {
    let beacon = Beacon::derived(8, b"A");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let coord = coordinator(network, DecodeDefaults::default());
    let first = coord.start(request(DEVICE, 8, false)).unwrap();
    coord.wait(first).await.unwrap();

    let second = coord.start(request(DEVICE, 8, false)).unwrap();
    assert_ne!(first, second);
    assert_eq!(coord.wait(second).await.unwrap().text, "A");
}

#[tokio::test]
async fn test_keybook_for_other_device_is_rejected() {
    let book = Arc::new(KeyBook::generate(DEVICE, 4, 2).unwrap());
    let coord = coordinator(SimulatedNetwork::new(), DecodeDefaults::default()).with_keybook(book);

    assert!(coord.start(request(0x1234, 4, true)).is_err());
    assert!(coord.start(request(DEVICE, 8, true)).is_err());
    assert_eq!(coord.status().running, 0);
}

#[tokio::test]
async fn test_shutdown_stops_unbounded_decode() {
    let defaults = DecodeDefaults {
        silence_limit: 0,
        ..DecodeDefaults::default()
    };
    let coord = coordinator(SimulatedNetwork::new(), defaults);
    let id = coord.start(request(DEVICE, 1, false)).unwrap();
    assert_eq!(coord.status().running, 1);

    coord.shutdown();

    assert_eq!(coord.status().running, 0);
    assert_eq!(coord.get(id).unwrap().state, MessageState::Failed("shut down".into()));
    assert_eq!(coord.wait(id).await.unwrap().state, MessageState::Failed("shut down".into()));
}
