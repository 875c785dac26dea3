//! Daemon status and shutdown commands.

use anyhow::Result;
use serde::Deserialize;

use super::http::{base_url, get_json, post_json};

#[derive(Deserialize)]
struct StatusResponse {
    version: String,
    messages: usize,
    running: usize,
    token_loaded: bool,
    keybook_loaded: bool,
    decrypt_threads: usize,
    chunk_bits: u8,
}

#[derive(Deserialize)]
struct ShutdownResponse {
    message: String,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}

pub async fn cmd_status(port: u16) -> Result<()> {
    let resp: StatusResponse = get_json(&format!("{}/status", base_url(port))).await?;

    println!("═══════════════════════════════════════");
    println!("  Modem Daemon Status (v{})", resp.version);
    println!("═══════════════════════════════════════");
    println!("  Messages         : {}", resp.messages);
    println!("  Running          : {}", resp.running);
    println!("  Token loaded     : {}", yes_no(resp.token_loaded));
    println!("  Key book loaded  : {}", yes_no(resp.keybook_loaded));
    println!("  Decrypt threads  : {}", resp.decrypt_threads);
    println!("  Chunk bits       : {}", resp.chunk_bits);

    if !resp.token_loaded {
        println!("\n  No search-party token: decodes cannot be started.");
    }

    Ok(())
}

pub async fn cmd_shutdown(port: u16) -> Result<()> {
    let resp: ShutdownResponse = post_json(&format!("{}/daemon/shutdown", base_url(port))).await?;
    println!("{}", resp.message);
    Ok(())
}
