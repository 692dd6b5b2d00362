//! Slot fingerprint.
//!
//! A pure, deterministic identity over `(provider_id, venue_id, actual_time)`
//! with minute precision. Party size is intentionally excluded -- party
//! sizes are part of the query, not the slot's identity.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Computes the 32-character hex slot id for a reservation time.
///
/// `actual_time` is truncated to minute precision before hashing so that
/// two fetches of the same reservation slot that differ only in how the
/// provider rounds seconds still produce the same fingerprint.
pub fn slot_id(provider_id: &str, venue_id: i64, actual_time: DateTime<Utc>) -> String {
    let minute_truncated = actual_time.format("%Y-%m-%dT%H:%M").to_string();
    let input = format!("{provider_id}|{venue_id}|{minute_truncated}");

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();

    hex::encode(digest)[..32].to_string()
}
