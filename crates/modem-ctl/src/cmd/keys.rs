//! Local key book commands. These never talk to the daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use modem_core::config::ModemConfig;
use modem_core::crypto::P224Oracle;
use modem_core::keybook::KeyBook;

fn keybook_path(path: Option<&str>) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(PathBuf::from(p)),
        None => Ok(ModemConfig::load()?.keys.keybook_path),
    }
}

pub fn cmd_keys_generate(device_id: u32, chunk_bits: u8, rounds: u32, out: Option<&str>) -> Result<()> {
    let path = keybook_path(out)?;
    if path.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", path.display());
    }

    let book = KeyBook::generate(device_id, chunk_bits, rounds).context("failed to generate key book")?;
    book.save(&path)?;

    println!("Key book written to {}", path.display());
    println!("  device     : {:#010x}", device_id);
    println!("  chunk bits : {}", chunk_bits);
    println!("  rounds     : {}", rounds);
    println!("  keypairs   : {}", book.len());
    println!("  Keep this file secret; the beacon needs the same book.");
    Ok(())
}

pub fn cmd_keys_verify(path: Option<&str>) -> Result<()> {
    let path = keybook_path(path)?;
    let book = load(&path)?;
    book.verify(&P224Oracle)?;
    println!(
        "{}: {} keypairs for device {:#010x} verified",
        path.display(),
        book.len(),
        book.device_id
    );
    Ok(())
}

pub fn load(path: &Path) -> Result<KeyBook> {
    KeyBook::load(path).with_context(|| format!("failed to load key book {}", path.display()))
}
