//! Bucket Registry: the fixed set of query keys for the rolling window,
//! and their lifecycle.

use crate::pipeline::model::{Bucket, BucketHealth};
use anyhow::{Context, Result};
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;

/// Computes the required `bucket_id`s for `date_range x time_anchors` and
/// inserts only the missing rows, in one read and one bulk insert -- no
/// per-bucket round-trip.
pub fn ensure_buckets(
    conn: &Connection,
    date_range: &[String],
    time_anchors: &[String],
) -> Result<usize> {
    let required: Vec<String> = date_range
        .iter()
        .flat_map(|d| time_anchors.iter().map(move |t| Bucket::make_id(d, t)))
        .collect();

    if required.is_empty() {
        return Ok(0);
    }

    let placeholders = required.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT bucket_id FROM buckets WHERE bucket_id IN ({placeholders})"
    );
    let mut stmt = conn.prepare(&sql).context("preparing existing-buckets query")?;
    let existing: HashSet<String> = stmt
        .query_map(params_from_iter(required.iter()), |row| row.get(0))
        .context("querying existing buckets")?
        .collect::<Result<_, _>>()
        .context("collecting existing bucket ids")?;
    drop(stmt);

    let missing: Vec<&String> = required.iter().filter(|b| !existing.contains(*b)).collect();
    if missing.is_empty() {
        return Ok(0);
    }

    conn.execute("BEGIN IMMEDIATE", [])
        .context("beginning bucket insert txn")?;
    let insert_result = (|| -> Result<usize> {
        let mut stmt = conn.prepare_cached(
            "INSERT INTO buckets (bucket_id, date_str, time_slot) VALUES (?1, ?2, ?3)
             ON CONFLICT (bucket_id) DO NOTHING",
        )?;
        let mut inserted = 0;
        for bucket_id in &missing {
            let (date_str, time_slot) = bucket_id
                .split_once('_')
                .context("malformed bucket id")?;
            inserted += stmt.execute(params![bucket_id, date_str, time_slot])?;
        }
        Ok(inserted)
    })();

    match insert_result {
        Ok(n) => {
            conn.execute("COMMIT", [])?;
            Ok(n)
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}

/// Deletes every bucket (and cascading leases) with `date_str < today`.
pub fn prune_old_buckets(conn: &Connection, today: &str) -> Result<usize> {
    let n = conn
        .execute("DELETE FROM buckets WHERE date_str < ?1", params![today])
        .context("pruning old buckets")?;
    conn.execute(
        "DELETE FROM bucket_leases WHERE bucket_id NOT IN (SELECT bucket_id FROM buckets)",
        [],
    )
    .context("pruning orphaned leases")?;
    Ok(n)
}

/// One query returning scanned_at / baseline_count / stale for every bucket.
pub fn get_bucket_health(
    conn: &Connection,
    now: i64,
    stale_horizon_seconds: i64,
) -> Result<Vec<BucketHealth>> {
    let mut stmt = conn.prepare(
        "SELECT bucket_id, scanned_at, baseline_slot_ids FROM buckets ORDER BY bucket_id",
    )?;
    let rows = stmt.query_map([], |row| {
        let bucket_id: String = row.get(0)?;
        let scanned_at: Option<i64> = row.get(1)?;
        let baseline_json: Option<String> = row.get(2)?;
        Ok((bucket_id, scanned_at, baseline_json))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (bucket_id, scanned_at, baseline_json) = row?;
        let baseline_count = baseline_json
            .and_then(|j| serde_json::from_str::<Vec<String>>(&j).ok())
            .map(|v| v.len() as i64)
            .unwrap_or(0);
        let stale = match scanned_at {
            Some(ts) => now - ts > stale_horizon_seconds,
            None => true,
        };
        out.push(BucketHealth {
            bucket_id,
            scanned_at,
            baseline_count,
            stale,
        });
    }
    Ok(out)
}

pub fn load_bucket(conn: &Connection, bucket_id: &str) -> Result<Option<Bucket>> {
    let mut stmt = conn.prepare(
        "SELECT bucket_id, date_str, time_slot, baseline_slot_ids, baseline_venue_ids,
                prev_slot_ids, scanned_at, baseline_scanned_at, last_error
         FROM buckets WHERE bucket_id = ?1",
    )?;
    let mut rows = stmt.query(params![bucket_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let baseline_json: Option<String> = row.get(3)?;
    let baseline_venue_json: Option<String> = row.get(4)?;
    let prev_json: Option<String> = row.get(5)?;

    Ok(Some(Bucket {
        bucket_id: row.get(0)?,
        date_str: row.get(1)?,
        time_slot: row.get(2)?,
        baseline_slot_ids: parse_set(baseline_json),
        prev_slot_ids: parse_set(prev_json),
        baseline_venue_ids: parse_i64_set(baseline_venue_json),
        scanned_at: row.get(6)?,
        baseline_scanned_at: row.get(7)?,
        last_error: row.get(8)?,
    }))
}

fn parse_set(json: Option<String>) -> Option<HashSet<String>> {
    json.map(|j| {
        serde_json::from_str::<Vec<String>>(&j)
            .unwrap_or_default()
            .into_iter()
            .collect()
    })
}

fn parse_i64_set(json: Option<String>) -> Option<HashSet<i64>> {
    json.map(|j| {
        serde_json::from_str::<Vec<i64>>(&j)
            .unwrap_or_default()
            .into_iter()
            .collect()
    })
}

fn serialize_i64_set(set: &HashSet<i64>) -> String {
    let mut v: Vec<i64> = set.iter().copied().collect();
    v.sort();
    serde_json::to_string(&v).unwrap_or_else(|_| "[]".to_string())
}

fn serialize_set(set: &HashSet<String>) -> String {
    let mut v: Vec<&String> = set.iter().collect();
    v.sort();
    serde_json::to_string(&v).unwrap_or_else(|_| "[]".to_string())
}

/// Baseline bootstrap: writes `baseline = prev = curr`. No events, no
/// sessions, no metrics are emitted by this call.
pub fn bootstrap_baseline(
    conn: &Connection,
    bucket_id: &str,
    curr_set: &HashSet<String>,
    baseline_venue_ids: &HashSet<i64>,
    now: i64,
) -> Result<()> {
    let json = serialize_set(curr_set);
    let venue_json = serialize_i64_set(baseline_venue_ids);
    conn.execute(
        "UPDATE buckets SET baseline_slot_ids = ?1, prev_slot_ids = ?1, baseline_venue_ids = ?2,
                             baseline_scanned_at = ?3, scanned_at = ?3
         WHERE bucket_id = ?4",
        params![json, venue_json, now, bucket_id],
    )
    .context("bootstrapping baseline")?;
    Ok(())
}

/// Updates `prev_slot_ids` and `scanned_at` after a successful poll pass.
pub fn update_prev(
    conn: &Connection,
    bucket_id: &str,
    curr_set: &HashSet<String>,
    now: i64,
) -> Result<()> {
    let json = serialize_set(curr_set);
    conn.execute(
        "UPDATE buckets SET prev_slot_ids = ?1, scanned_at = ?2 WHERE bucket_id = ?3",
        params![json, now, bucket_id],
    )
    .context("updating prev_slot_ids")?;
    Ok(())
}

pub fn record_error(conn: &Connection, bucket_id: &str, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE buckets SET last_error = ?1 WHERE bucket_id = ?2",
        params![error, bucket_id],
    )
    .context("recording bucket error")?;
    Ok(())
}

/// Admin op: delete all buckets and all drop events. Next tick re-creates
/// buckets; next poll bootstraps baselines.
pub fn reset_all(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM buckets", [])?;
    conn.execute("DELETE FROM bucket_leases", [])?;
    conn.execute("DELETE FROM drop_events", [])?;
    Ok(())
}

/// Builds the (date_range, count) map used by tests and the scheduler's
/// daily job to describe the rolling window starting at `start_date`.
pub fn rolling_date_range(start_date: chrono::NaiveDate, window_days: i64) -> Vec<String> {
    (0..window_days)
        .filter_map(|i| start_date.checked_add_signed(chrono::Duration::days(i)))
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("schema.sql")).unwrap();
        conn
    }

    #[test]
    fn ensure_buckets_inserts_missing_only() {
        let conn = setup();
        let dates = vec!["2026-02-18".to_string(), "2026-02-19".to_string()];
        let anchors = vec!["19:00".to_string()];

        let inserted = ensure_buckets(&conn, &dates, &anchors).unwrap();
        assert_eq!(inserted, 2);

        // second call is a no-op
        let inserted_again = ensure_buckets(&conn, &dates, &anchors).unwrap();
        assert_eq!(inserted_again, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM buckets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn prune_removes_only_past_dates() {
        let conn = setup();
        ensure_buckets(
            &conn,
            &["2026-02-17".to_string(), "2026-02-19".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();

        let deleted = prune_old_buckets(&conn, "2026-02-18").unwrap();
        assert_eq!(deleted, 1);

        let remaining: String = conn
            .query_row("SELECT bucket_id FROM buckets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, "2026-02-19_19:00");
    }

    #[test]
    fn bootstrap_then_load_roundtrips_sets() {
        let conn = setup();
        ensure_buckets(
            &conn,
            &["2026-02-18".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();

        let bucket_id = "2026-02-18_19:00";
        let mut curr: HashSet<String> = HashSet::new();
        curr.insert("abc".to_string());
        curr.insert("def".to_string());

        let venues: HashSet<i64> = [1i64].into_iter().collect();
        bootstrap_baseline(&conn, bucket_id, &curr, &venues, 1000).unwrap();

        let bucket = load_bucket(&conn, bucket_id).unwrap().unwrap();
        assert!(bucket.is_initialized());
        assert_eq!(bucket.baseline_slot_ids.unwrap(), curr);
        assert_eq!(bucket.prev_slot_ids.unwrap(), curr);
        assert_eq!(bucket.scanned_at, Some(1000));
        assert_eq!(bucket.baseline_scanned_at, Some(1000));
    }

    #[test]
    fn health_flags_stale_buckets() {
        let conn = setup();
        ensure_buckets(
            &conn,
            &["2026-02-18".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();
        let bucket_id = "2026-02-18_19:00";
        bootstrap_baseline(&conn, bucket_id, &HashSet::new(), &HashSet::new(), 0).unwrap();

        let health = get_bucket_health(&conn, 100_000, 4 * 3600).unwrap();
        assert_eq!(health.len(), 1);
        assert!(health[0].stale);
    }

    #[test]
    fn rolling_date_range_has_expected_length() {
        let start = chrono::NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let range = rolling_date_range(start, 14);
        assert_eq!(range.len(), 14);
        assert_eq!(range[0], "2026-02-18");
        assert_eq!(range[13], "2026-03-03");
    }
}
