//! Feed reader: the two read-only queries external consumers use -- "just
//! opened since T" and "still open now" -- both excluding buckets flagged
//! stale by `bucket_registry::get_bucket_health` so a silently-broken
//! poller doesn't masquerade as a quiet night.

use crate::pipeline::model::{DropEvent, ProjectionRow};
use crate::pipeline::{bucket_registry, events, projection};
use anyhow::Result;
use rusqlite::Connection;
use std::collections::HashSet;

/// Drop events with `opened_at >= since`, excluding any bucket whose
/// `scanned_at` is older than `stale_horizon_seconds` -- a stale bucket's
/// absence of new drops is not evidence of a quiet market.
pub fn just_opened(
    conn: &Connection,
    since: i64,
    now: i64,
    stale_horizon_seconds: i64,
    limit: i64,
) -> Result<Vec<DropEvent>> {
    let stale = stale_bucket_ids(conn, now, stale_horizon_seconds)?;
    let raw = events::just_opened(conn, since, limit.saturating_mul(2).max(limit))?;
    Ok(raw
        .into_iter()
        .filter(|e| !stale.contains(&e.bucket_id))
        .take(limit as usize)
        .collect())
}

/// Projection rows currently `open`, excluding stale buckets. This also
/// excludes slots that are still sitting in their bucket's baseline (i.e.
/// "new since baseline", not "open at all") -- callers that want the raw
/// open set should use `projection::still_open` or `still_open_all`
/// directly.
pub fn still_open(conn: &Connection, now: i64, stale_horizon_seconds: i64, limit: i64) -> Result<Vec<ProjectionRow>> {
    let stale = stale_bucket_ids(conn, now, stale_horizon_seconds)?;
    let baseline_by_bucket = baseline_slot_ids_by_bucket(conn, &stale)?;

    let raw = projection::still_open_all(conn, limit.saturating_mul(2).max(limit))?;
    Ok(raw
        .into_iter()
        .filter(|row| {
            if stale.contains(&row.bucket_id) {
                return false;
            }
            match baseline_by_bucket.get(&row.bucket_id) {
                Some(baseline) => !baseline.contains(&row.slot_id),
                None => true,
            }
        })
        .take(limit as usize)
        .collect())
}

fn stale_bucket_ids(conn: &Connection, now: i64, stale_horizon_seconds: i64) -> Result<HashSet<String>> {
    Ok(bucket_registry::get_bucket_health(conn, now, stale_horizon_seconds)?
        .into_iter()
        .filter(|h| h.stale)
        .map(|h| h.bucket_id)
        .collect())
}

fn baseline_slot_ids_by_bucket(
    conn: &Connection,
    exclude: &HashSet<String>,
) -> Result<std::collections::HashMap<String, HashSet<String>>> {
    let mut out = std::collections::HashMap::new();
    let mut stmt = conn.prepare("SELECT bucket_id FROM buckets")?;
    let bucket_ids: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);

    for bucket_id in bucket_ids {
        if exclude.contains(&bucket_id) {
            continue;
        }
        if let Some(bucket) = bucket_registry::load_bucket(conn, &bucket_id)? {
            out.insert(bucket_id, bucket.baseline_slot_ids.unwrap_or_default());
        }
    }
    Ok(out)
}
