//! Plan-id computation and SHA-256 file manifests.
//!
//! Plan-id = `YYYYMMDD-HHMMSS-<12hex>` where the hex is
//! `SHA-256(discovery || modelKey || proposal[:80kB])` truncated to 12 hex
//! chars (6 bytes). Deterministic for identical inputs at the same UTC
//! second.

use chrono::{DateTime, Utc};
use ring::digest::{digest, SHA256};
use std::path::Path;

const PROPOSAL_DIGEST_CAP: usize = 80 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let d = digest(&SHA256, bytes);
    hex_encode(d.as_ref())
}

pub fn sha256_hex_file(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Compute the 12-hex-char plan-id suffix from (discovery, modelKey, proposal).
pub fn plan_digest_suffix(discovery: &str, model_key: &str, proposal: &str) -> String {
    let capped = take_bytes(proposal, PROPOSAL_DIGEST_CAP);
    let mut buf = Vec::with_capacity(discovery.len() + model_key.len() + capped.len());
    buf.extend_from_slice(discovery.as_bytes());
    buf.extend_from_slice(model_key.as_bytes());
    buf.extend_from_slice(&capped);
    let full_hex = sha256_hex(&buf);
    full_hex[..12].to_string()
}

fn take_bytes(s: &str, cap: usize) -> Vec<u8> {
    let bytes = s.as_bytes();
    if bytes.len() <= cap {
        bytes.to_vec()
    } else {
        bytes[..cap].to_vec()
    }
}

/// Full plan-id: `YYYYMMDD-HHMMSS-<12hex>`, deterministic for identical
/// inputs at the same UTC second.
pub fn plan_id(now: DateTime<Utc>, discovery: &str, model_key: &str, proposal: &str) -> String {
    let stamp = now.format("%Y%m%d-%H%M%S");
    let suffix = plan_digest_suffix(discovery, model_key, proposal);
    format!("{}-{}", stamp, suffix)
}

/// A `runId` for accept/archive: `YYYYMMDD-HHMMSS-<6hex>`. Unlike plan-id,
/// this does not need to be a pure function of content — each accept run
/// gets a fresh id — so the caller supplies the random/sequence bytes.
pub fn run_id(now: DateTime<Utc>, entropy: &[u8]) -> String {
    let stamp = now.format("%Y%m%d-%H%M%S");
    let hex = sha256_hex(entropy);
    format!("{}-{}", stamp, &hex[..6])
}
