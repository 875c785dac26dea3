//! modemd — Find My modem receiver daemon.
//!
//! Loads config, the search-party token and (optionally) the pre-shared key
//! book, then serves the decoder over the local HTTP API until ctrl-c or
//! an API shutdown request.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use modem_core::auth::AuthToken;
use modem_core::config::ModemConfig;
use modem_core::crypto::P224Oracle;
use modem_core::keybook::KeyBook;
use modem_services::{
    Coordinator, DecodeDefaults, DecryptPipeline, HttpReportSource, KeyEncoder, MessageStore,
    RoundController, RoundSettings,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = ModemConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ModemConfig::load().context("failed to load config")?;
    tracing::info!(
        path = %ModemConfig::file_path().display(),
        chunk_bits = config.decode.chunk_bits,
        endpoint = %config.fetch.endpoint,
        "modemd starting"
    );

    // Decrypt pool
    let pipeline = DecryptPipeline::new(config.decrypt.threads).context("failed to start decrypt pool")?;
    tracing::info!(threads = pipeline.threads(), "decrypt pool ready");

    let defaults = DecodeDefaults {
        chunk_bits: config.decode.chunk_bits,
        keystream: config.decode.keystream()?,
        silence_limit: config.decode.silence_limit,
    };
    let mut coordinator = Coordinator::new(MessageStore::new(), pipeline, defaults);

    // Without a token the daemon still serves but cannot start decodes
    match AuthToken::from_file(&config.fetch.token_path) {
        Ok(token) => {
            let settings = RoundSettings {
                lookback: Duration::from_secs(config.fetch.lookback_secs),
                timeout: Duration::from_secs(config.fetch.timeout_secs),
                batch_size: config.fetch.batch_size,
                max_rounds: config.decode.max_rounds,
            };
            let controller = RoundController::new(
                KeyEncoder::new(Arc::new(P224Oracle)),
                Arc::new(HttpReportSource::new(config.fetch.endpoint.clone())),
                token,
                settings,
            );
            coordinator = coordinator.with_controller(controller);
            tracing::info!(path = %config.fetch.token_path.display(), "search-party token loaded");
        }
        Err(e) => tracing::warn!(error = %e, "no search-party token, decoding disabled"),
    }

    // Key book, only needed for pre-shared messages
    if config.keys.keybook_path.exists() {
        let book = KeyBook::load(&config.keys.keybook_path).context("failed to load key book")?;
        book.verify(&P224Oracle).context("key book failed verification")?;
        tracing::info!(
            device_id = %format!("{:#010x}", book.device_id),
            chunk_bits = book.chunk_bits,
            rounds = book.rounds,
            "key book loaded"
        );
        coordinator = coordinator.with_keybook(Arc::new(book));
    }

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let progress_printer = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                for summary in coordinator.list() {
                    tracing::debug!(
                        message_id = summary.id,
                        rounds = summary.rounds,
                        state = ?summary.state,
                        text = %summary.text,
                        "progress"
                    );
                }
            }
        })
    };

    let api_task = {
        let state = modem_api::ApiState {
            coordinator: coordinator.clone(),
            chunk_bits: config.decode.chunk_bits,
            shutdown_tx: shutdown_tx.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move { modem_api::serve(state, port).await })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = api_task             => tracing::error!("API server exited: {:?}", r),
        r = progress_printer     => tracing::error!("progress printer exited: {:?}", r),
    }

    coordinator.shutdown();
    Ok(())
}
