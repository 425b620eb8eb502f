//! Short, sortable connection identifiers.
//!
//! Adapted from the upstream router core's Snowflake-style `atomic_id`
//! generator, stripped of its per-thread/cache-line machinery since a
//! single global counter is plenty for per-connection logging tags here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const EPOCH_MILLIS: u64 = 1_700_000_000_000;
const SEQUENCE_BITS: u32 = 20;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Returns a short Base58-encoded token, roughly time-ordered.
pub fn next_connection_id() -> String {
    let now_millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let ts = now_millis.saturating_sub(EPOCH_MILLIS);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) & SEQUENCE_MASK;
    encode_base58((ts << SEQUENCE_BITS) | seq)
}

fn encode_base58(mut value: u64) -> String {
    if value == 0 {
        return "1".to_string();
    }
    let mut buf = [0u8; 16];
    let mut idx = buf.len();
    while value > 0 {
        idx -= 1;
        buf[idx] = BASE58_ALPHABET[(value % 58) as usize];
        value /= 58;
    }
    String::from_utf8(buf[idx..].to_vec()).expect("base58 alphabet is ASCII")
}
