//! Event Log: append-only drop events, idempotent by `dedupe_key`.

use crate::pipeline::model::{DropEvent, EventType, TimeBucket};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// Minute-truncated dedupe key:
/// `"{bucket_id}|{slot_id}|YYYY-MM-DDTHH:MM"` using `opened_at` for
/// NEW_DROP and `closed_at` for CLOSED.
pub fn dedupe_key(bucket_id: &str, slot_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{bucket_id}|{slot_id}|{}",
        at.format("%Y-%m-%dT%H:%M")
    )
}

/// Inserts the event, returning `true` if it was newly written and `false`
/// if an identical `dedupe_key` already existed (treated as success, never
/// an error).
pub fn insert_event(conn: &Connection, event: &DropEvent) -> Result<bool> {
    let n = conn
        .prepare_cached(
            "INSERT INTO drop_events (
                dedupe_key, bucket_id, slot_id, venue_id, venue_name, opened_at,
                event_type, closed_at, duration_seconds, time_bucket, slot_date, slot_time, payload
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT (dedupe_key) DO NOTHING",
        )?
        .execute(params![
            event.dedupe_key,
            event.bucket_id,
            event.slot_id,
            event.venue_id,
            event.venue_name,
            event.opened_at,
            event.event_type.as_str(),
            event.closed_at,
            event.duration_seconds,
            event.time_bucket.as_str(),
            event.slot_date,
            event.slot_time,
            event.payload,
        ])?;
    Ok(n > 0)
}

/// Whether a NEW_DROP for `(bucket_id, slot_id)` exists within the last
/// `dedupe_minutes` of `now` -- the TTL dedupe window that keeps a flapping
/// slot from re-firing a NEW_DROP on every poll.
pub fn has_recent_new_drop(
    conn: &Connection,
    bucket_id: &str,
    slot_id: &str,
    now: i64,
    dedupe_minutes: i64,
) -> Result<bool> {
    let cutoff = now - dedupe_minutes * 60;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM drop_events
         WHERE bucket_id = ?1 AND slot_id = ?2 AND event_type = 'NEW_DROP' AND opened_at >= ?3",
        params![bucket_id, slot_id, cutoff],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Batch-fetches the latest NEW_DROP's `opened_at` per `(bucket_id,
/// slot_id)` for a set of closed slots in one round-trip.
pub fn latest_new_drop_opened_at(
    conn: &Connection,
    bucket_id: &str,
    slot_ids: &[String],
) -> Result<std::collections::HashMap<String, i64>> {
    if slot_ids.is_empty() {
        return Ok(std::collections::HashMap::new());
    }
    let placeholders = slot_ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT slot_id, MAX(opened_at) FROM drop_events
         WHERE bucket_id = ? AND event_type = 'NEW_DROP' AND slot_id IN ({placeholders})
         GROUP BY slot_id"
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&bucket_id];
    for s in slot_ids {
        params_vec.push(s);
    }
    let rows = stmt.query_map(params_vec.as_slice(), |row| {
        let slot_id: String = row.get(0)?;
        let opened_at: i64 = row.get(1)?;
        Ok((slot_id, opened_at))
    })?;
    rows.collect::<Result<_, _>>().context("collecting latest NEW_DROP rows")
}

/// Drop events of type NEW_DROP with `opened_at >= since`, newest first.
pub fn just_opened(conn: &Connection, since: i64, limit: i64) -> Result<Vec<DropEvent>> {
    let mut stmt = conn.prepare(
        "SELECT dedupe_key, bucket_id, slot_id, venue_id, venue_name, opened_at, event_type,
                closed_at, duration_seconds, time_bucket, slot_date, slot_time, payload
         FROM drop_events
         WHERE event_type = 'NEW_DROP' AND opened_at >= ?1
         ORDER BY opened_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![since, limit], row_to_event)?;
    rows.collect::<Result<_, _>>().context("collecting just-opened events")
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<DropEvent> {
    let event_type: String = row.get(6)?;
    let time_bucket: String = row.get(9)?;
    Ok(DropEvent {
        dedupe_key: row.get(0)?,
        bucket_id: row.get(1)?,
        slot_id: row.get(2)?,
        venue_id: row.get(3)?,
        venue_name: row.get(4)?,
        opened_at: row.get(5)?,
        event_type: EventType::parse(&event_type),
        closed_at: row.get(7)?,
        duration_seconds: row.get(8)?,
        time_bucket: if time_bucket == "prime" {
            TimeBucket::Prime
        } else {
            TimeBucket::OffPeak
        },
        slot_date: row.get(10)?,
        slot_time: row.get(11)?,
        payload: row.get(12)?,
    })
}

/// Prunes events with `opened_at` before the retention cutoff.
pub fn prune_before(conn: &Connection, cutoff_unix: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM drop_events WHERE opened_at < ?1",
        params![cutoff_unix],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("schema.sql")).unwrap();
        conn
    }

    fn sample_event(dedupe_key: &str, opened_at: i64) -> DropEvent {
        DropEvent {
            dedupe_key: dedupe_key.to_string(),
            bucket_id: "2026-02-18_19:00".to_string(),
            slot_id: "sid99".to_string(),
            venue_id: 99,
            venue_name: "Test Venue".to_string(),
            opened_at,
            event_type: EventType::NewDrop,
            closed_at: None,
            duration_seconds: None,
            time_bucket: TimeBucket::Prime,
            slot_date: "2026-02-18".to_string(),
            slot_time: "20:00".to_string(),
            payload: "{}".to_string(),
        }
    }

    #[test]
    fn dedupe_key_has_minute_precision() {
        let t = Utc.with_ymd_and_hms(2026, 2, 18, 20, 0, 0).unwrap();
        let key = dedupe_key("2026-02-18_19:00", "sid99", t);
        assert_eq!(key, "2026-02-18_19:00|sid99|2026-02-18T20:00");
    }

    #[test]
    fn duplicate_insert_is_idempotent() {
        let conn = setup();
        let e = sample_event("k1", 1000);
        assert!(insert_event(&conn, &e).unwrap());
        assert!(!insert_event(&conn, &e).unwrap());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM drop_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn recent_dedupe_window_suppresses_second_drop() {
        let conn = setup();
        insert_event(&conn, &sample_event("k1", 1000)).unwrap();
        assert!(has_recent_new_drop(&conn, "2026-02-18_19:00", "sid99", 1000 + 300, 30).unwrap());
        assert!(!has_recent_new_drop(&conn, "2026-02-18_19:00", "sid99", 1000 + 3000, 30).unwrap());
    }

    #[test]
    fn batch_latest_new_drop_for_multiple_slots() {
        let conn = setup();
        let mut e1 = sample_event("k1", 1000);
        e1.slot_id = "a".to_string();
        let mut e2 = sample_event("k2", 2000);
        e2.slot_id = "b".to_string();
        insert_event(&conn, &e1).unwrap();
        insert_event(&conn, &e2).unwrap();

        let latest = latest_new_drop_opened_at(
            &conn,
            "2026-02-18_19:00",
            &["a".to_string(), "b".to_string(), "c".to_string()],
        )
        .unwrap();
        assert_eq!(latest.get("a"), Some(&1000));
        assert_eq!(latest.get("b"), Some(&2000));
        assert_eq!(latest.get("c"), None);
    }
}
