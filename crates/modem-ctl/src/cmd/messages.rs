//! Decode commands: start, list, inspect, watch, and read reports.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use modem_core::message::{DecryptedObservation, MessageState, MessageSummary};

use super::http::{base_url, get_json, post_json_body};

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<MessageSummary>,
}

#[derive(Serialize)]
struct StartMessageRequest {
    device_id: String,
    chunk_bits: Option<u8>,
    pre_shared: bool,
}

#[derive(Deserialize)]
struct StartMessageResponse {
    id: u32,
}

#[derive(Deserialize)]
struct ReportsResponse {
    id: u32,
    reports: Vec<DecryptedObservation>,
}

fn state_label(state: &MessageState) -> String {
    match state {
        MessageState::Running => "running".to_string(),
        MessageState::Terminated(reason) => format!("done ({:?})", reason).to_lowercase(),
        MessageState::Failed(reason) => format!("failed: {}", reason),
    }
}

fn print_summary(s: &MessageSummary) {
    println!("  ┌─ #{} device {} [{}]", s.id, s.device_id, state_label(&s.state));
    println!("  │  seeding    : {}, {} bits/round", s.seeding, s.chunk_bits);
    println!("  │  rounds     : {} ({} unknown, {} ambiguous)", s.rounds, s.unknown_rounds, s.ambiguous_rounds);
    println!("  │  reports    : {}", s.reports_matched);
    println!("  │  bytes      : {} ({} invalid)", s.decoded_hex, s.invalid_bytes);
    println!("  └─ text       : {:?}", s.text);
}

pub async fn cmd_fetch(port: u16, device_id: &str, chunk_bits: Option<u8>, pre_shared: bool) -> Result<()> {
    let req = StartMessageRequest {
        device_id: device_id.to_string(),
        chunk_bits,
        pre_shared,
    };
    let resp: StartMessageResponse = post_json_body(&format!("{}/messages", base_url(port)), &req).await?;
    println!("Decode started: message #{}", resp.id);
    println!("  Follow with: modem-ctl watch {}", resp.id);
    Ok(())
}

pub async fn cmd_messages(port: u16) -> Result<()> {
    let resp: MessagesResponse = get_json(&format!("{}/messages", base_url(port))).await?;

    if resp.messages.is_empty() {
        println!("No messages.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Messages ({})", resp.messages.len());
    println!("═══════════════════════════════════════");
    for s in &resp.messages {
        print_summary(s);
    }
    Ok(())
}

pub async fn cmd_message(port: u16, id: u32) -> Result<()> {
    let s: MessageSummary = get_json(&format!("{}/messages/{}", base_url(port), id)).await?;
    print_summary(&s);
    Ok(())
}

/// Poll a message until it stops running, printing each new round.
pub async fn cmd_watch(port: u16, id: u32) -> Result<()> {
    let url = format!("{}/messages/{}", base_url(port), id);
    let mut last_round = None;
    loop {
        let s: MessageSummary = get_json(&url).await?;
        if last_round != Some(s.rounds) {
            println!("  round {:>5}  {:?}", s.rounds, s.text);
            last_round = Some(s.rounds);
        }
        if s.state != MessageState::Running {
            print_summary(&s);
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
}

pub async fn cmd_reports(port: u16, id: u32) -> Result<()> {
    let resp: ReportsResponse = get_json(&format!("{}/messages/{}/reports", base_url(port), id)).await?;

    if resp.reports.is_empty() {
        println!("No decrypted reports for message #{}.", resp.id);
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Reports for message #{} ({})", resp.id, resp.reports.len());
    println!("═══════════════════════════════════════");
    for r in &resp.reports {
        println!("  ┌─ {:.7}, {:.7} (±{} m)", r.latitude, r.longitude, r.accuracy);
        println!("  │  seen      : {}", r.timestamp);
        println!("  │  published : {}", r.date_published / 1000);
        println!("  └─ key       : {}", r.key_hash);
    }
    Ok(())
}
