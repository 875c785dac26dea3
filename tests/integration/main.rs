//! Modem integration test harness.
//!
//! Tests run the receiver against a simulated crowd-sourced network: a
//! beacon advertises its schedule under real P-224 keys, finders file
//! sealed location reports, and the receiver queries them back through
//! the same `ReportSource` seam the HTTP client uses. Nothing leaves the
//! process.
//!
//! The network runs on air time. A beacon's reports for round `r` are
//! published one second after those for round `r - 1`, and only once a
//! receiver asks for round `r`'s keys.
//!
//!   cargo test --test integration

mod coordinator;
mod decode;
mod decrypt;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

use modem_core::auth::AuthToken;
use modem_core::crypto::{encrypt_report, LocationReport};
use modem_core::keybook::KeyBook;
use modem_core::message::{CandidateKey, KeyHash, Observation, Seeding};
use modem_core::wire::{self, Keystream, PAYLOAD_LEN};
use modem_services::report_source::{FetchError, QueryWindow, ReportSource};
use modem_services::{KeyEncoder, RoundController, RoundSettings};

// ── Harness ───────────────────────────────────────────────────────────────────

/// Device id every simulated beacon uses unless a test picks another.
pub const DEVICE: u32 = 0x00C0_FFEE;

/// Reports filed per advertised key by `SimulatedNetwork::broadcast`.
pub const SIGHTINGS: usize = 2;

/// Air time between two rounds of a beacon.
const ROUND_MS: u64 = 1_000;

pub fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
}

pub fn token() -> AuthToken {
    AuthToken::from_bytes(b"integration-token".to_vec()).unwrap()
}

pub fn derived() -> Seeding {
    Seeding::Derived {
        keystream: Keystream::default(),
    }
}

/// A distinct location per sighting so tests can tell reports apart.
pub fn location(i: usize) -> LocationReport {
    LocationReport {
        timestamp: 1_700_000_000 + i as u64,
        confidence: 3,
        latitude: 52.37 + i as f64 * 1e-4,
        longitude: 4.89 - i as f64 * 1e-4,
        accuracy: 15,
        status: 0,
    }
}

/// Seal `location(i)` for `public_key` the way a finder would.
pub fn sighting(public_key: &[u8; 28], key_hash: KeyHash, i: usize) -> Observation {
    Observation {
        key_hash,
        date_published: now_ms() - 60_000,
        payload: Bytes::from(encrypt_report(public_key, &location(i)).unwrap()),
        status_code: Some(0),
    }
}

/// What a sending device advertises for one message.
pub struct Beacon {
    pub device_id: u32,
    pub chunk_bits: u8,
    pub seeding: Seeding,
    pub schedule: Vec<CandidateKey>,
}

impl Beacon {
    pub fn derived(chunk_bits: u8, data: &[u8]) -> Self {
        Self::new(DEVICE, chunk_bits, derived(), data)
    }

    pub fn pre_shared(book: Arc<KeyBook>, data: &[u8]) -> Self {
        let (device_id, chunk_bits) = (book.device_id, book.chunk_bits);
        Self::new(device_id, chunk_bits, Seeding::PreShared(book), data)
    }

    pub fn new(device_id: u32, chunk_bits: u8, seeding: Seeding, data: &[u8]) -> Self {
        let schedule = KeyEncoder::default()
            .broadcast_schedule(&seeding, device_id, chunk_bits, data)
            .unwrap();
        Self {
            device_id,
            chunk_bits,
            seeding,
            schedule,
        }
    }

    /// The payload window the beacon had built up before `round`.
    pub fn window_before(&self, round: u32) -> [u8; PAYLOAD_LEN] {
        let mut window = [0u8; PAYLOAD_LEN];
        for key in self.schedule.iter().take(round as usize) {
            wire::place_chunk(&mut window, key.round, self.chunk_bits, key.value);
        }
        window
    }

    /// Every key the beacon could have advertised at `round`.
    pub fn candidates(&self, round: u32) -> Vec<CandidateKey> {
        KeyEncoder::default()
            .round_candidates(&self.seeding, self.device_id, round, self.chunk_bits, &self.window_before(round))
            .unwrap()
    }

    /// The key the beacon would have advertised had it sent `value` at `round`.
    pub fn key_for(&self, round: u32, value: u32) -> CandidateKey {
        self.candidates(round)
            .into_iter()
            .find(|c| c.value == value)
            .unwrap()
    }
}

#[derive(Default)]
struct Air {
    /// Visible to queries.
    published: Vec<Observation>,
    /// (device, round, report) not yet on the air.
    queued: Vec<(u32, u32, Observation)>,
    /// Non-default candidate hashes of every broadcast round. Value 0 is
    /// left out because its key repeats the previous round's.
    rounds: HashMap<KeyHash, (u32, u32)>,
}

/// Stand-in for the report service: finders file, receivers query.
pub struct SimulatedNetwork {
    air: Mutex<Air>,
    /// Publication time of round 0.
    epoch: u64,
    queries: AtomicUsize,
}

impl SimulatedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            air: Mutex::new(Air::default()),
            epoch: now_ms() - 3_600_000,
            queries: AtomicUsize::new(0),
        })
    }

    /// File `SIGHTINGS` sealed reports for each scheduled key, except
    /// for rounds listed in `lost`.
    pub fn broadcast(&self, beacon: &Beacon, lost: &[u32]) {
        {
            let mut air = self.air.lock().unwrap();
            for round in 0..beacon.schedule.len() as u32 {
                for key in beacon.candidates(round).iter().filter(|k| k.value != 0) {
                    air.rounds.insert(key.key_hash, (beacon.device_id, round));
                }
            }
        }
        for key in beacon.schedule.iter().filter(|k| !lost.contains(&k.round)) {
            self.file(beacon, key, SIGHTINGS);
        }
    }

    /// Queue `sightings` reports for `key`, published during `key.round`.
    pub fn file(&self, beacon: &Beacon, key: &CandidateKey, sightings: usize) {
        let mut air = self.air.lock().unwrap();
        for _ in 0..sightings {
            let i = air.published.len() + air.queued.len();
            let mut obs = sighting(&key.public_key, key.key_hash, i);
            obs.date_published = self.epoch + key.round as u64 * ROUND_MS + (i as u64 % ROUND_MS);
            air.queued.push((beacon.device_id, key.round, obs));
        }
    }

    /// A report published outside any lookback window a test uses.
    pub fn file_stale(&self, key: &CandidateKey) {
        let mut obs = sighting(&key.public_key, key.key_hash, 0);
        obs.date_published = 1_000;
        self.air.lock().unwrap().published.push(obs);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn filed(&self) -> usize {
        let air = self.air.lock().unwrap();
        air.published.len() + air.queued.len()
    }
}

#[async_trait]
impl ReportSource for SimulatedNetwork {
    async fn query(&self, hashes: &[KeyHash], window: QueryWindow, _token: &AuthToken) -> Result<Vec<Observation>, FetchError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let mut air = self.air.lock().unwrap();

        // A query for a round's keys means its beacon has reached that round.
        let mut reached: HashMap<u32, u32> = HashMap::new();
        for (device, round) in hashes.iter().filter_map(|h| air.rounds.get(h)) {
            let at = reached.entry(*device).or_insert(*round);
            *at = (*at).max(*round);
        }
        let (due, waiting): (Vec<_>, Vec<_>) = air
            .queued
            .drain(..)
            .partition(|(device, round, _)| reached.get(device).is_some_and(|at| round <= at));
        air.queued = waiting;
        air.published.extend(due.into_iter().map(|(_, _, obs)| obs));

        let wanted: HashSet<&KeyHash> = hashes.iter().collect();
        Ok(air
            .published
            .iter()
            .filter(|o| wanted.contains(&o.key_hash) && window.contains(o.date_published))
            .cloned()
            .collect())
    }
}

pub fn controller(network: Arc<SimulatedNetwork>) -> RoundController {
    RoundController::new(KeyEncoder::default(), network, token(), RoundSettings::default())
}
