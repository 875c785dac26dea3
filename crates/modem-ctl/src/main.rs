//! modem-ctl — command-line interface for the modem daemon.

mod cmd;

use anyhow::{Context, Result};

const DEFAULT_PORT: u16 = 9101;

#[derive(Default)]
struct Options {
    port: Option<u16>,
    chunk_bits: Option<u8>,
    rounds: Option<u32>,
    pre_shared: bool,
    out: Option<String>,
    keybook: Option<String>,
}

fn parse_device_id(text: &str) -> Result<u32> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid device id {:?}", text))
}

fn flag_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{} requires a value", name))
}

fn parse_id(text: &str) -> Result<u32> {
    text.parse().with_context(|| format!("invalid message id {:?}", text))
}

fn print_usage() {
    println!("Usage: modem-ctl [options] <command>");
    println!();
    println!("Daemon commands:");
    println!("  status                   Show daemon status");
    println!("  messages                 List all messages");
    println!("  message <id>             Show one message");
    println!("  watch <id>               Follow a message until it ends");
    println!("  reports <id>             Show decrypted location reports");
    println!("  fetch <device>           Start decoding a device (hex id)");
    println!("  shutdown                 Stop the daemon");
    println!();
    println!("Local commands:");
    println!("  keys generate <device>   Create a pre-shared key book");
    println!("  keys verify              Check a key book against its private keys");
    println!("  encode <device> <text>   Print the beacon key schedule for <text>");
    println!();
    println!("Options:");
    println!("  --port <port>            API port (default: {})", DEFAULT_PORT);
    println!("  --chunk-bits <n>         Bits per round, 1-16");
    println!("  --pre-shared             Decode with the daemon's key book");
    println!("  --rounds <n>             Rounds in a generated key book (default: 64)");
    println!("  --out <path>             Where to write a generated key book");
    println!("  --keybook <path>         Key book to read");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Parse options
    let mut opts = Options::default();
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "--port" => opts.port = Some(flag_value(&args, &mut i, flag)?.parse().context("--port must be a number")?),
            "--chunk-bits" => {
                opts.chunk_bits = Some(
                    flag_value(&args, &mut i, flag)?
                        .parse()
                        .context("--chunk-bits must be a number")?,
                )
            }
            "--rounds" => {
                opts.rounds = Some(flag_value(&args, &mut i, flag)?.parse().context("--rounds must be a number")?)
            }
            "--out" => opts.out = Some(flag_value(&args, &mut i, flag)?.to_string()),
            "--keybook" => opts.keybook = Some(flag_value(&args, &mut i, flag)?.to_string()),
            "--pre-shared" => opts.pre_shared = true,
            _ => remaining.push(flag),
        }
        i += 1;
    }
    let port = opts.port.unwrap_or(DEFAULT_PORT);

    match remaining.as_slice() {
        ["status"] | [] => cmd::status::cmd_status(port).await,
        ["shutdown"] => cmd::status::cmd_shutdown(port).await,
        ["messages"] => cmd::messages::cmd_messages(port).await,
        ["message", id] => cmd::messages::cmd_message(port, parse_id(id)?).await,
        ["watch", id] => cmd::messages::cmd_watch(port, parse_id(id)?).await,
        ["reports", id] => cmd::messages::cmd_reports(port, parse_id(id)?).await,
        ["fetch", device] => cmd::messages::cmd_fetch(port, device, opts.chunk_bits, opts.pre_shared).await,
        ["keys", "generate", device] => cmd::keys::cmd_keys_generate(
            parse_device_id(device)?,
            opts.chunk_bits.unwrap_or(8),
            opts.rounds.unwrap_or(64),
            opts.out.as_deref(),
        ),
        ["keys", "verify"] => cmd::keys::cmd_keys_verify(opts.keybook.as_deref()),
        ["encode", device, text] => cmd::encode::cmd_encode(
            parse_device_id(device)?,
            text,
            opts.chunk_bits,
            opts.keybook.as_deref(),
        ),
        ["help"] | ["--help"] | ["-h"] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
