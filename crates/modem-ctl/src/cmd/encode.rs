//! Print the advertised-key schedule a beacon uses to send a message.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use modem_core::config::ModemConfig;
use modem_core::message::Seeding;
use modem_services::KeyEncoder;

use super::keys;

pub fn cmd_encode(device_id: u32, text: &str, chunk_bits: Option<u8>, keybook: Option<&str>) -> Result<()> {
    let config = ModemConfig::load()?;
    let (seeding, chunk_bits) = match keybook {
        Some(path) => {
            let book = keys::load(std::path::Path::new(path))?;
            let bits = book.chunk_bits;
            (Seeding::PreShared(Arc::new(book)), bits)
        }
        None => (
            Seeding::Derived {
                keystream: config.decode.keystream()?,
            },
            chunk_bits.unwrap_or(config.decode.chunk_bits),
        ),
    };

    let schedule = KeyEncoder::default()
        .broadcast_schedule(&seeding, device_id, chunk_bits, text.as_bytes())
        .context("failed to build schedule")?;

    println!("═══════════════════════════════════════");
    println!("  Broadcast schedule for {:#010x}", device_id);
    println!("  {} rounds, {} bits/round, {} seeding", schedule.len(), chunk_bits, seeding.kind());
    println!("═══════════════════════════════════════");
    for key in &schedule {
        println!("  {:>5}  {:>5}  {}", key.round, key.value, BASE64.encode(key.public_key));
    }
    Ok(())
}
