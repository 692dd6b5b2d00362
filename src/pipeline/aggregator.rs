//! Aggregator: rolls closed sessions into per-venue and per-market
//! rolling metrics, idempotently.

use crate::pipeline::model::TimeBucket;
use crate::pipeline::{projection, sessions};
use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;

#[derive(Default)]
struct VenueAccumulator {
    new_drop_count: i64,
    prime_time_drops: i64,
    total_duration: i64,
    closed_count: i64,
}

/// Reads closed, unaggregated sessions scoped to `bucket_id < cutoff`,
/// groups them by venue, upserts venue metrics, and stamps
/// `aggregated_at` on the consumed sessions -- all in one transaction, so
/// a crash mid-run leaves sessions `aggregated_at IS NULL` for a clean
/// retry next time this runs.
pub fn run(conn: &Connection, cutoff_bucket_id: &str, as_of_date: &str, now: i64) -> Result<usize> {
    let due = sessions::unaggregated_before(conn, cutoff_bucket_id)?;
    if due.is_empty() {
        return Ok(0);
    }

    let mut by_venue: HashMap<i64, VenueAccumulator> = HashMap::new();
    let mut market_new_drops: i64 = 0;

    for session in &due {
        let acc = by_venue.entry(session.venue_id).or_default();
        acc.new_drop_count += 1;
        acc.closed_count += 1;
        if let Some(duration) = session.duration_seconds {
            acc.total_duration += duration;
        }

        let hour = Utc
            .timestamp_opt(session.opened_at, 0)
            .single()
            .map(|dt| dt.format("%H").to_string().parse::<u32>().unwrap_or(0))
            .unwrap_or(0);
        if matches!(TimeBucket::classify(hour), TimeBucket::Prime) {
            acc.prime_time_drops += 1;
        }
        market_new_drops += 1;
    }

    conn.execute("BEGIN IMMEDIATE", [])
        .context("beginning aggregation txn")?;

    let result = (|| -> Result<()> {
        for (venue_id, acc) in &by_venue {
            let avg_duration = if acc.closed_count > 0 {
                acc.total_duration as f64 / acc.closed_count as f64
            } else {
                0.0
            };
            // Rarity: fewer historical drops -> higher rarity. A simple,
            // bounded inverse scale keeps the score in [0, 1].
            let rarity_score = 1.0 / (1.0 + acc.new_drop_count as f64);
            // Fraction of a day a typical drop for this venue stayed open:
            // average session duration over a 24h window, capped at 1.0.
            let availability_rate = (avg_duration / 86_400.0).min(1.0);

            conn.execute(
                "INSERT INTO venue_metrics (
                    venue_id, as_of_date, new_drop_count, prime_time_drops,
                    avg_duration_seconds, rarity_score, availability_rate
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (venue_id, as_of_date) DO UPDATE SET
                    new_drop_count = venue_metrics.new_drop_count + excluded.new_drop_count,
                    prime_time_drops = venue_metrics.prime_time_drops + excluded.prime_time_drops,
                    avg_duration_seconds = (venue_metrics.avg_duration_seconds * venue_metrics.new_drop_count
                        + excluded.avg_duration_seconds * excluded.new_drop_count)
                        / NULLIF(venue_metrics.new_drop_count + excluded.new_drop_count, 0),
                    rarity_score = excluded.rarity_score,
                    availability_rate = (venue_metrics.availability_rate * venue_metrics.new_drop_count
                        + excluded.availability_rate * excluded.new_drop_count)
                        / NULLIF(venue_metrics.new_drop_count + excluded.new_drop_count, 0)",
                params![
                    venue_id,
                    as_of_date,
                    acc.new_drop_count,
                    acc.prime_time_drops,
                    avg_duration,
                    rarity_score,
                    availability_rate,
                ],
            )?;
        }

        conn.execute(
            "INSERT INTO market_metrics (window_date, metric_type, value) VALUES (?1, 'new_drop_count', ?2)
             ON CONFLICT (window_date, metric_type) DO UPDATE SET value = market_metrics.value + excluded.value",
            params![as_of_date, market_new_drops as f64],
        )?;

        let ids: Vec<String> = due.iter().map(|s| s.id.clone()).collect();
        sessions::mark_aggregated(conn, &ids, now)?;

        // Closed rows are deleted right after aggregation so the projection
        // only ever holds currently-open slots.
        for session in &due {
            projection::delete_closed(conn, &session.bucket_id, &session.slot_id)?;
        }

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute("COMMIT", [])?;
            Ok(due.len())
        }
        Err(e) => {
            let _ = conn.execute("ROLLBACK", []);
            Err(e)
        }
    }
}
