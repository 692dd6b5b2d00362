//! Projection Store: current-state table keyed by `(bucket_id, slot_id)`.

use crate::pipeline::model::{ProjectionRow, SlotState};
use anyhow::{Context, Result};
use rusqlite::{params, Connection};

/// Apply-if-newer upsert: for each slot in `added`, opens (or re-opens) the
/// projection row only if the existing row is not already fresher. Safe
/// against reordered retries.
pub fn open_slots(
    conn: &Connection,
    bucket_id: &str,
    venue_of: impl Fn(&str) -> i64,
    slot_ids: &[String],
    now: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO projection (bucket_id, slot_id, venue_id, state, opened_at, closed_at, last_seen_at, updated_at)
         VALUES (?1, ?2, ?3, 'open', ?4, NULL, ?4, ?4)
         ON CONFLICT (bucket_id, slot_id) DO UPDATE SET
             state = 'open',
             opened_at = CASE WHEN projection.state = 'closed' THEN excluded.opened_at ELSE projection.opened_at END,
             closed_at = NULL,
             last_seen_at = excluded.last_seen_at,
             updated_at = excluded.updated_at
         WHERE projection.updated_at < excluded.updated_at",
    )?;

    let mut touched = 0;
    for slot_id in slot_ids {
        touched += stmt.execute(params![bucket_id, slot_id, venue_of(slot_id), now])?;
    }
    Ok(touched)
}

/// Transitions rows to `closed` for each slot in `closed`.
pub fn close_slots(conn: &Connection, bucket_id: &str, slot_ids: &[String], now: i64) -> Result<usize> {
    let mut stmt = conn.prepare_cached(
        "UPDATE projection SET state = 'closed', closed_at = ?3, updated_at = ?3
         WHERE bucket_id = ?1 AND slot_id = ?2 AND projection.updated_at < ?3",
    )?;
    let mut touched = 0;
    for slot_id in slot_ids {
        touched += stmt.execute(params![bucket_id, slot_id, now])?;
    }
    Ok(touched)
}

/// Deletes a closed projection row once the Aggregator has consumed its
/// session, so the table stays "currently open only".
pub fn delete_closed(conn: &Connection, bucket_id: &str, slot_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM projection WHERE bucket_id = ?1 AND slot_id = ?2 AND state = 'closed'",
        params![bucket_id, slot_id],
    )?;
    Ok(())
}

/// Still-open slots for a bucket, most recent first, bounded by `limit`.
pub fn still_open(conn: &Connection, bucket_id: &str, limit: i64) -> Result<Vec<ProjectionRow>> {
    let mut stmt = conn.prepare(
        "SELECT bucket_id, slot_id, venue_id, state, opened_at, closed_at, last_seen_at, updated_at
         FROM projection
         WHERE bucket_id = ?1 AND state = 'open'
         ORDER BY opened_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![bucket_id, limit], row_to_projection)
        .context("querying still-open projection rows")?;
    rows.collect::<Result<Vec<_>, _>>().context("collecting projection rows")
}

/// All open rows across buckets, most recent first, bounded by `limit`
/// (feed reader's cross-bucket "still open in window" query).
pub fn still_open_all(conn: &Connection, limit: i64) -> Result<Vec<ProjectionRow>> {
    let mut stmt = conn.prepare(
        "SELECT bucket_id, slot_id, venue_id, state, opened_at, closed_at, last_seen_at, updated_at
         FROM projection
         WHERE state = 'open'
         ORDER BY opened_at DESC
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], row_to_projection)
        .context("querying still-open projection rows")?;
    rows.collect::<Result<Vec<_>, _>>().context("collecting projection rows")
}

fn row_to_projection(row: &rusqlite::Row) -> rusqlite::Result<ProjectionRow> {
    let state: String = row.get(3)?;
    Ok(ProjectionRow {
        bucket_id: row.get(0)?,
        slot_id: row.get(1)?,
        venue_id: row.get(2)?,
        state: SlotState::parse(&state),
        opened_at: row.get(4)?,
        closed_at: row.get(5)?,
        last_seen_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Prunes projection rows older than `before_date_str` (rolling window).
pub fn prune_before(conn: &Connection, before_date_str: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM projection WHERE bucket_id < ?1",
        params![format!("{before_date_str}_")],
    )?)
}
