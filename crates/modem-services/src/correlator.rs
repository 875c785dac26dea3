//! Correlator — decides which value a round carried from the reports that
//! came back for its candidate hashes.
//!
//! Only the current round's candidates are consulted. A beacon that is
//! between messages keeps advertising the default value, so when reports
//! point at several values the default is assumed stale and dropped.
//!
//! Derived keys repeat: the value-0 candidate of a round is the key the
//! beacon advertised in the round before. Reports under a hash the message
//! already credited count again only if they were published later.

use std::collections::{BTreeMap, HashMap};

use modem_core::message::{ChunkOutcome, KeyHash, Message, Observation};

/// Chunk value a silent beacon keeps advertising.
pub const DEFAULT_VALUE: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correlation {
    pub outcome: ChunkOutcome,
    /// Reports seen per candidate value.
    pub report_counts: BTreeMap<u32, usize>,
    /// Observations backing the outcome: the decoded value's reports, or
    /// every report of an ambiguous round.
    pub matched: Vec<Observation>,
    /// Reports under a carried-over key already credited to an earlier round.
    pub carried: usize,
    /// Observations for hashes outside this round.
    pub unmatched: usize,
}

pub fn correlate(message: &Message, observations: &[Observation]) -> Correlation {
    let round = message.round();
    let by_hash: HashMap<KeyHash, u32> = message
        .candidates_for_round(round)
        .iter()
        .map(|c| (c.key_hash, c.value))
        .collect();

    let mut report_counts = BTreeMap::new();
    let mut votes = Vec::new();
    let mut carried = 0usize;
    let mut unmatched = 0usize;
    for obs in observations {
        let Some(&value) = by_hash.get(&obs.key_hash) else {
            unmatched += 1;
            continue;
        };
        if message
            .credited_until(&obs.key_hash)
            .is_some_and(|until| obs.date_published <= until)
        {
            carried += 1;
            continue;
        }
        *report_counts.entry(value).or_insert(0) += 1;
        votes.push((value, obs));
    }

    let outcome = decide(&report_counts);
    let matched: Vec<Observation> = votes
        .into_iter()
        .filter(|(value, _)| backs(&outcome, *value))
        .map(|(_, obs)| obs.clone())
        .collect();
    match &outcome {
        ChunkOutcome::Ambiguous(values) => tracing::warn!(
            message_id = message.id,
            round,
            ?values,
            "ambiguous round"
        ),
        ChunkOutcome::Unknown => tracing::debug!(message_id = message.id, round, carried, "no reports"),
        ChunkOutcome::Decoded(value) => tracing::debug!(
            message_id = message.id,
            round,
            value,
            reports = matched.len(),
            "round decoded"
        ),
    }

    Correlation {
        outcome,
        report_counts,
        matched,
        carried,
        unmatched,
    }
}

fn backs(outcome: &ChunkOutcome, value: u32) -> bool {
    match outcome {
        ChunkOutcome::Decoded(decoded) => *decoded == value,
        ChunkOutcome::Ambiguous(values) => values.contains(&value),
        ChunkOutcome::Unknown => false,
    }
}

fn decide(report_counts: &BTreeMap<u32, usize>) -> ChunkOutcome {
    let observed: Vec<u32> = report_counts.keys().copied().collect();
    match observed.as_slice() {
        [] => ChunkOutcome::Unknown,
        [only] => ChunkOutcome::Decoded(*only),
        _ => {
            let mut exceptions = observed.iter().filter(|v| **v != DEFAULT_VALUE);
            match (exceptions.next(), exceptions.next()) {
                (Some(value), None) => ChunkOutcome::Decoded(*value),
                _ => ChunkOutcome::Ambiguous(observed),
            }
        }
    }
}
