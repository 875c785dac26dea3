use std::sync::Arc;

use modem_core::keybook::KeyBook;
use modem_core::message::{ChunkOutcome, DecodedByte, Message, MessageState, Termination};
use modem_services::{KeyEncoder, RoundController, RoundResult, RoundSettings};

use crate::*;

fn receiver(beacon: &Beacon) -> Message {
    Message::new(1, beacon.device_id, beacon.chunk_bits, beacon.seeding.clone())
        .unwrap()
        .with_silence_limit(2)
}

async fn run(ctl: &RoundController, msg: &mut Message) -> (RoundResult, Vec<ChunkOutcome>) {
    let mut outcomes = Vec::new();
    let result = ctl
        .run_to_end(msg, |_, report| outcomes.push(report.outcome.clone()))
        .await;
    (result, outcomes)
}

#[tokio::test]
async fn test_derived_message_over_real_keys() {
    let beacon = Beacon::derived(8, b"He");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let ctl = controller(network.clone());
    let mut msg = receiver(&beacon);
    let (result, outcomes) = run(&ctl, &mut msg).await;

    assert!(matches!(
        result,
        RoundResult::Terminated {
            reason: Termination::Terminator,
            ..
        }
    ));
    assert_eq!(
        outcomes,
        vec![
            ChunkOutcome::Decoded(72),
            ChunkOutcome::Decoded(101),
            ChunkOutcome::Decoded(0)
        ]
    );
    assert_eq!(msg.text(), "He");
    assert_eq!(network.queries(), 3);
    assert_eq!(msg.reports_matched(), (3 * SIGHTINGS) as u64);
}

#[tokio::test]
async fn test_nibble_chunks_reassemble_text() {
    let beacon = Beacon::derived(4, b"ok");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    run(&ctl, &mut msg).await;

    assert_eq!(msg.text(), "ok");
    assert_eq!(msg.round(), 6);
    assert_eq!(msg.state(), &MessageState::Terminated(Termination::Terminator));
}

#[tokio::test]
async fn test_default_value_sighting_does_not_disturb_decode() {
    let beacon = Beacon::derived(8, b"Hi");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);
    // Reports for the keys a zero chunk would have produced.
    network.file(&beacon, &beacon.key_for(0, 0), 1);
    network.file(&beacon, &beacon.key_for(1, 0), 3);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    let (_, outcomes) = run(&ctl, &mut msg).await;

    assert_eq!(outcomes[0], ChunkOutcome::Decoded(b'H' as u32));
    assert_eq!(outcomes[1], ChunkOutcome::Decoded(b'i' as u32));
    assert_eq!(msg.text(), "Hi");
    // Only the reports behind each decoded value are counted.
    assert_eq!(msg.reports_matched(), (3 * SIGHTINGS) as u64);
}

#[tokio::test]
async fn test_zero_chunks_inside_bytes_decode() {
    // 'p' = 0x70 and '0' = 0x30: each ends in a zero nibble, whose key
    // repeats the one before it.
    let beacon = Beacon::derived(4, b"p0");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    let (_, outcomes) = run(&ctl, &mut msg).await;

    let values: Vec<ChunkOutcome> = [7, 0, 3, 0, 0, 0].into_iter().map(ChunkOutcome::Decoded).collect();
    assert_eq!(outcomes, values);
    assert_eq!(msg.text(), "p0");
    assert_eq!(msg.state(), &MessageState::Terminated(Termination::Terminator));
    assert_eq!(msg.reports_matched(), (6 * SIGHTINGS) as u64);
}

#[tokio::test]
async fn test_conflicting_sightings_make_byte_invalid() {
    let book = Arc::new(KeyBook::generate(DEVICE, 8, 4).unwrap());
    let beacon = Beacon::pre_shared(book, b"He");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);
    network.file(&beacon, &beacon.key_for(0, b'J' as u32), 1);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    let (result, outcomes) = run(&ctl, &mut msg).await;

    assert!(matches!(
        result,
        RoundResult::Terminated {
            reason: Termination::Terminator,
            ..
        }
    ));
    assert_eq!(outcomes[0], ChunkOutcome::Ambiguous(vec![b'H' as u32, b'J' as u32]));
    assert_eq!(msg.decoded(), &[DecodedByte::Invalid, DecodedByte::Valid(b'e')]);
    assert_eq!(msg.text(), "?e");
    assert_eq!(msg.summary().ambiguous_rounds, 1);
}

#[tokio::test]
async fn test_lost_round_with_keybook_taints_one_byte() {
    let book = Arc::new(KeyBook::generate(DEVICE, 8, 5).unwrap());
    let beacon = Beacon::pre_shared(book, b"Hey");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[1]);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    run(&ctl, &mut msg).await;

    assert_eq!(msg.text(), "H?y");
    assert_eq!(msg.round(), 4);
    assert_eq!(msg.state(), &MessageState::Terminated(Termination::Terminator));
    assert_eq!(msg.summary().unknown_rounds, 1);
}

#[tokio::test]
async fn test_lost_round_with_derived_keys_ends_in_silence() {
    // Later derived keys depend on the lost chunk, so nothing after it matches.
    let beacon = Beacon::derived(8, b"Hey");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[1]);

    let ctl = controller(network);
    let mut msg = receiver(&beacon);
    let (result, outcomes) = run(&ctl, &mut msg).await;

    assert!(matches!(
        result,
        RoundResult::Terminated {
            reason: Termination::Silence,
            ..
        }
    ));
    // Round 1's value-0 key is round 0's key; its old reports are not a zero.
    assert_eq!(
        outcomes,
        vec![ChunkOutcome::Decoded(b'H' as u32), ChunkOutcome::Unknown, ChunkOutcome::Unknown]
    );
    assert_eq!(msg.text(), "H");
    assert_eq!(msg.round(), 3);
    assert_eq!(msg.reports_matched(), SIGHTINGS as u64);
}

#[tokio::test]
async fn test_reports_outside_lookback_are_not_seen() {
    let beacon = Beacon::derived(8, b"x");
    let network = SimulatedNetwork::new();
    for key in &beacon.schedule {
        network.file_stale(key);
    }

    let ctl = controller(network.clone());
    let mut msg = receiver(&beacon);
    run(&ctl, &mut msg).await;

    assert_eq!(msg.text(), "");
    assert_eq!(msg.state(), &MessageState::Terminated(Termination::Silence));
    assert_eq!(msg.reports_matched(), 0);
    assert_eq!(network.queries(), 2);
}

#[tokio::test]
async fn test_batched_queries_cover_every_candidate() {
    let beacon = Beacon::derived(8, b"He");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let settings = RoundSettings {
        batch_size: 64,
        ..RoundSettings::default()
    };
    let ctl = RoundController::new(KeyEncoder::default(), network.clone(), token(), settings);
    let mut msg = receiver(&beacon);
    run(&ctl, &mut msg).await;

    assert_eq!(msg.text(), "He");
    assert_eq!(network.queries(), 3 * 4);
}

#[tokio::test]
async fn test_round_limit_stops_long_message() {
    let beacon = Beacon::derived(4, b"long message");
    let network = SimulatedNetwork::new();
    network.broadcast(&beacon, &[]);

    let settings = RoundSettings {
        max_rounds: 4,
        ..RoundSettings::default()
    };
    let ctl = RoundController::new(KeyEncoder::default(), network, token(), settings);
    let mut msg = receiver(&beacon);
    let (result, outcomes) = run(&ctl, &mut msg).await;

    assert!(matches!(
        result,
        RoundResult::Terminated {
            reason: Termination::RoundLimit,
            report: None
        }
    ));
    assert_eq!(outcomes.len(), 4);
    assert_eq!(msg.text(), "lo");
}
