use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::Bytes;

use modem_core::crypto::{decrypt_report, key_hash, KeyPair};
use modem_core::message::Observation;
use modem_core::wire::{self, ReportResults};
use modem_services::decrypt::{fan_out, PrivateKeyMap};
use modem_services::report_source::observations_from;
use modem_services::DecryptPipeline;

use crate::*;

/// 1000 observations, a random 300 of them under keys we hold.
fn mixed_batch() -> (Vec<Observation>, PrivateKeyMap, HashSet<usize>) {
    let known: HashSet<usize> = rand::seq::index::sample(&mut rand::thread_rng(), 1000, 300)
        .into_iter()
        .collect();
    let mut keys = PrivateKeyMap::new();
    let mut observations = Vec::with_capacity(1000);
    for i in 0..1000usize {
        if known.contains(&i) {
            let pair = KeyPair::generate();
            let hash = key_hash(&pair.public);
            keys.insert(hash, pair.private_bytes());
            observations.push(sighting(&pair.public, hash, i));
        } else {
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&(i as u64).to_be_bytes());
            observations.push(Observation {
                key_hash: hash,
                date_published: now_ms(),
                payload: Bytes::from(vec![0u8; 88]),
                status_code: Some(0),
            });
        }
    }
    (observations, keys, known)
}

#[test]
fn test_decrypts_exactly_the_known_keys() {
    let (observations, keys, known) = mixed_batch();

    let pipeline = DecryptPipeline::new(4).unwrap();
    let results = pipeline.decrypt_all(&observations, &keys);

    assert_eq!(results.len(), 1000);
    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 300);
    for (i, result) in results.iter().enumerate() {
        match result {
            Some(report) => {
                assert!(known.contains(&i), "slot {i} should not have opened");
                assert_eq!(report.timestamp, location(i).timestamp);
                assert_eq!(report.key_hash, wire::encode_hash(&observations[i].key_hash));
            }
            None => assert!(!known.contains(&i), "slot {i} should have opened"),
        }
    }
}

#[test]
fn test_no_two_workers_write_the_same_slot() {
    let (observations, keys, known) = mixed_batch();
    let indexed: Vec<(usize, &Observation)> = observations.iter().enumerate().collect();
    let written: Vec<AtomicBool> = indexed.iter().map(|_| AtomicBool::new(false)).collect();
    let collisions = AtomicUsize::new(0);

    let results = fan_out(&indexed, |(i, obs)| {
        if written[*i]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            collisions.fetch_add(1, Ordering::SeqCst);
        }
        let private = keys.get(&obs.key_hash)?;
        decrypt_report(&private[..], &obs.payload).ok().map(|report| (*i, report))
    });

    assert_eq!(collisions.load(Ordering::SeqCst), 0);
    assert!(written.iter().all(|w| w.load(Ordering::SeqCst)));
    assert_eq!(results.iter().flatten().count(), 300);
    for (slot, result) in results.iter().enumerate() {
        if let Some((origin, report)) = result {
            assert_eq!(*origin, slot);
            assert!(known.contains(origin));
            assert_eq!(report.timestamp, location(slot).timestamp);
        }
    }
}

#[test]
fn test_corrupt_payloads_are_skipped_not_fatal() {
    let pair = KeyPair::generate();
    let hash = key_hash(&pair.public);
    let mut keys = PrivateKeyMap::new();
    keys.insert(hash, pair.private_bytes());

    let good = sighting(&pair.public, hash, 1);
    let mut flipped = sighting(&pair.public, hash, 2);
    let mut bytes = flipped.payload.to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    flipped.payload = Bytes::from(bytes);
    let mut short = sighting(&pair.public, hash, 3);
    short.payload = short.payload.slice(..40);

    let results = DecryptPipeline::new(2)
        .unwrap()
        .decrypt_all(&[flipped, good, short], &keys);

    assert!(results[0].is_none());
    assert!(results[1].is_some());
    assert!(results[2].is_none());
}

#[test]
fn test_service_dictionary_decrypts_end_to_end() {
    let pairs: Vec<KeyPair> = (0..3).map(|_| KeyPair::generate()).collect();
    let records: Vec<serde_json::Value> = pairs
        .iter()
        .enumerate()
        .map(|(i, pair)| {
            let obs = sighting(&pair.public, key_hash(&pair.public), i);
            serde_json::json!({
                "id": wire::encode_hash(&obs.key_hash),
                "datePublished": obs.date_published,
                "payload": BASE64.encode(&obs.payload),
                "statusCode": 0,
            })
        })
        .chain(std::iter::once(serde_json::json!({
            "id": "not base64!",
            "datePublished": 0,
            "payload": "",
        })))
        .collect();
    let results: ReportResults = serde_json::from_value(serde_json::json!({ "results": records })).unwrap();

    let observations = observations_from(&results);
    assert_eq!(observations.len(), 3);

    let keys: PrivateKeyMap = pairs
        .iter()
        .map(|pair| (key_hash(&pair.public), pair.private_bytes()))
        .collect();
    let opened = DecryptPipeline::new(0).unwrap().decrypt_all(&observations, &keys);

    assert!(opened.iter().all(Option::is_some));
    let latitudes: Vec<f64> = opened.iter().flatten().map(|r| r.latitude).collect();
    for (i, lat) in latitudes.iter().enumerate() {
        assert!((lat - location(i).latitude).abs() < 1e-6);
    }
}
