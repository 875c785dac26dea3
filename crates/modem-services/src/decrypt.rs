//! Decrypt pipeline — opens report payloads in parallel with pre-shared
//! private keys.
//!
//! Output slot `i` belongs to input `i` and nothing else. The slots are
//! allocated before the fan-out, each worker writes exactly one, and the
//! vector is only handed back after every worker has finished.

use std::collections::HashMap;

use rayon::prelude::*;
use thiserror::Error;
use zeroize::Zeroizing;

use modem_core::crypto::decrypt_report;
use modem_core::message::{DecryptedObservation, KeyHash, Observation};
use modem_core::wire::{self, ADVERTISED_KEY_LEN};

pub type PrivateKeyMap = HashMap<KeyHash, Zeroizing<[u8; ADVERTISED_KEY_LEN]>>;

/// Map every input through `f` in parallel, keeping input order.
pub fn fan_out<T, R, F>(inputs: &[T], f: F) -> Vec<Option<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> Option<R> + Sync + Send,
{
    let mut slots: Vec<Option<R>> = Vec::with_capacity(inputs.len());
    slots.resize_with(inputs.len(), || None);
    slots
        .par_iter_mut()
        .zip(inputs.par_iter())
        .for_each(|(slot, input)| *slot = f(input));
    slots
}

pub struct DecryptPipeline {
    pool: rayon::ThreadPool,
}

impl DecryptPipeline {
    /// `threads == 0` sizes the pool to the available parallelism.
    pub fn new(threads: usize) -> Result<Self, DecryptError> {
        let threads = if threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("modem-decrypt-{i}"))
            .build()?;
        tracing::debug!(threads, "decrypt pool ready");
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// One result per observation, same order. Observations with no known
    /// key or a payload that fails to open yield `None`.
    pub fn decrypt_all(&self, observations: &[Observation], keys: &PrivateKeyMap) -> Vec<Option<DecryptedObservation>> {
        let results = self
            .pool
            .install(|| fan_out(observations, |obs| decrypt_one(obs, keys)));
        let opened = results.iter().filter(|r| r.is_some()).count();
        tracing::debug!(
            observations = observations.len(),
            opened,
            skipped = observations.len() - opened,
            "decrypt pass complete"
        );
        results
    }
}

fn decrypt_one(obs: &Observation, keys: &PrivateKeyMap) -> Option<DecryptedObservation> {
    let Some(private) = keys.get(&obs.key_hash) else {
        tracing::trace!(key = %wire::encode_hash(&obs.key_hash), "no private key for observation");
        return None;
    };
    match decrypt_report(&private[..], &obs.payload) {
        Ok(report) => Some(DecryptedObservation {
            key_hash: wire::encode_hash(&obs.key_hash),
            latitude: report.latitude,
            longitude: report.longitude,
            accuracy: report.accuracy,
            confidence: report.confidence,
            status: report.status,
            timestamp: report.timestamp,
            date_published: obs.date_published,
        }),
        Err(e) => {
            tracing::debug!(key = %wire::encode_hash(&obs.key_hash), error = %e, "report did not open");
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum DecryptError {
    #[error("failed to build decrypt pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
