//! Availability Session log: one row per contiguous open window for a
//! slot. At most one open session per `(bucket_id, slot_id)`.

use crate::pipeline::model::AvailabilitySession;
use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use uuid::Uuid;

/// Opens a new session only if none is already open for this slot --
/// idempotent open. The pre-check and insert run under the same
/// caller-held transaction.
pub fn open_if_absent(
    conn: &Connection,
    bucket_id: &str,
    slot_id: &str,
    venue_id: i64,
    now: i64,
) -> Result<bool> {
    let already_open: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sessions WHERE bucket_id = ?1 AND slot_id = ?2 AND closed_at IS NULL)",
        params![bucket_id, slot_id],
        |row| row.get(0),
    )?;
    if already_open {
        return Ok(false);
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions (id, bucket_id, slot_id, venue_id, opened_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, bucket_id, slot_id, venue_id, now],
    )
    .context("inserting new session")?;
    Ok(true)
}

/// Closes the open session for this slot, if any -- idempotent close.
/// Returns `None` if there was nothing to close.
pub fn close_open(
    conn: &Connection,
    bucket_id: &str,
    slot_id: &str,
    now: i64,
) -> Result<Option<i64>> {
    let opened_at: Option<i64> = conn
        .query_row(
            "SELECT opened_at FROM sessions WHERE bucket_id = ?1 AND slot_id = ?2 AND closed_at IS NULL",
            params![bucket_id, slot_id],
            |row| row.get(0),
        )
        .ok();

    let Some(opened_at) = opened_at else {
        return Ok(None);
    };

    let duration = now - opened_at;
    conn.execute(
        "UPDATE sessions SET closed_at = ?3, duration_seconds = ?4
         WHERE bucket_id = ?1 AND slot_id = ?2 AND closed_at IS NULL",
        params![bucket_id, slot_id, now, duration],
    )
    .context("closing session")?;
    Ok(Some(duration))
}

/// Closed sessions with `aggregated_at IS NULL`, scoped to `bucket_id <
/// cutoff` to bound the working set.
pub fn unaggregated_before(conn: &Connection, cutoff_bucket_id: &str) -> Result<Vec<AvailabilitySession>> {
    let mut stmt = conn.prepare(
        "SELECT id, bucket_id, slot_id, venue_id, opened_at, closed_at, duration_seconds, aggregated_at
         FROM sessions
         WHERE closed_at IS NOT NULL AND aggregated_at IS NULL AND bucket_id < ?1",
    )?;
    let rows = stmt.query_map(params![cutoff_bucket_id], |row| {
        Ok(AvailabilitySession {
            id: row.get(0)?,
            bucket_id: row.get(1)?,
            slot_id: row.get(2)?,
            venue_id: row.get(3)?,
            opened_at: row.get(4)?,
            closed_at: row.get(5)?,
            duration_seconds: row.get(6)?,
            aggregated_at: row.get(7)?,
        })
    })?;
    rows.collect::<Result<_, _>>().context("collecting unaggregated sessions")
}

/// Stamps `aggregated_at` on the given session ids. Called in the same
/// transaction as the metrics upsert.
pub fn mark_aggregated(conn: &Connection, session_ids: &[String], now: i64) -> Result<()> {
    let mut stmt = conn.prepare_cached(
        "UPDATE sessions SET aggregated_at = ?2 WHERE id = ?1 AND aggregated_at IS NULL",
    )?;
    for id in session_ids {
        stmt.execute(params![id, now])?;
    }
    Ok(())
}

/// Count of currently-open sessions for a slot; used by tests to verify
/// the "at most one open session" invariant.
pub fn open_session_count(conn: &Connection, bucket_id: &str, slot_id: &str) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM sessions WHERE bucket_id = ?1 AND slot_id = ?2 AND closed_at IS NULL",
        params![bucket_id, slot_id],
        |row| row.get(0),
    )?)
}

/// Prunes closed, aggregated sessions older than `cutoff_bucket_id`.
/// Never deletes unaggregated sessions.
pub fn prune_aggregated_before(conn: &Connection, cutoff_bucket_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM sessions WHERE bucket_id < ?1 AND aggregated_at IS NOT NULL",
        params![cutoff_bucket_id],
    )?)
}
