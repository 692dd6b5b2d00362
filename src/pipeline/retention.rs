//! Retention: prune buckets, sessions, events, metrics and projection rows
//! by policy. All deletes are range scans by the zero-padded `bucket_id`
//! string (lexicographically equivalent to date comparison) or by a date
//! string column.

use crate::pipeline::config::Config;
use crate::pipeline::{bucket_registry, events, projection, sessions};
use anyhow::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection};
use tracing::info;

#[derive(Debug, Default)]
pub struct RetentionReport {
    pub buckets_deleted: usize,
    pub projection_deleted: usize,
    pub events_deleted: usize,
    pub sessions_deleted: usize,
    pub venue_metrics_deleted: usize,
    pub market_metrics_deleted: usize,
}

/// Runs every configured prune policy against `today`. Each step is
/// independent; a failure in one is logged and does not block the others,
/// and is simply retried on the next day's run.
pub fn run(conn: &Connection, config: &Config, today: NaiveDate, now_unix: i64) -> RetentionReport {
    let mut report = RetentionReport::default();
    let today_str = today.format("%Y-%m-%d").to_string();

    match bucket_registry::prune_old_buckets(conn, &today_str) {
        Ok(n) => report.buckets_deleted = n,
        Err(e) => tracing::warn!(error = %e, "bucket prune failed"),
    }

    match projection::prune_before(conn, &today_str) {
        Ok(n) => report.projection_deleted = n,
        Err(e) => tracing::warn!(error = %e, "projection prune failed"),
    }

    let event_cutoff = now_unix - config.event_retention_days * 86_400;
    match events::prune_before(conn, event_cutoff) {
        Ok(n) => report.events_deleted = n,
        Err(e) => tracing::warn!(error = %e, "event prune failed"),
    }

    let session_cutoff_date = today - chrono::Duration::days(config.session_retention_days);
    let session_cutoff_bucket_id = format!("{}_", session_cutoff_date.format("%Y-%m-%d"));
    match sessions::prune_aggregated_before(conn, &session_cutoff_bucket_id) {
        Ok(n) => report.sessions_deleted = n,
        Err(e) => tracing::warn!(error = %e, "session prune failed"),
    }

    let metrics_cutoff_date = today - chrono::Duration::days(config.metrics_retention_days);
    let metrics_cutoff_str = metrics_cutoff_date.format("%Y-%m-%d").to_string();
    match prune_metrics_before(conn, &metrics_cutoff_str) {
        Ok((v, m)) => {
            report.venue_metrics_deleted = v;
            report.market_metrics_deleted = m;
        }
        Err(e) => tracing::warn!(error = %e, "metrics prune failed"),
    }

    info!(?report, "retention pass complete");
    report
}

fn prune_metrics_before(conn: &Connection, cutoff_date: &str) -> Result<(usize, usize)> {
    let v = conn.execute(
        "DELETE FROM venue_metrics WHERE as_of_date < ?1",
        params![cutoff_date],
    )?;
    let m = conn.execute(
        "DELETE FROM market_metrics WHERE window_date < ?1",
        params![cutoff_date],
    )?;
    Ok((v, m))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::sessions::{close_open, open_if_absent};
    use std::collections::HashSet;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(include_str!("schema.sql")).unwrap();
        conn
    }

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            window_days: 14,
            time_slots: vec!["19:00".to_string()],
            party_sizes: vec![2],
            max_concurrent_buckets: 8,
            bucket_cooldown_seconds: 35,
            tick_interval_seconds: 30,
            provider_per_page: 50,
            provider_max_pages: 3,
            provider_timeout_seconds: 12,
            notified_dedupe_minutes: 30,
            stale_bucket_hours: 4,
            event_retention_days: 7,
            session_retention_days: 30,
            metrics_retention_days: 60,
            provider_api_key: "k".to_string(),
            daily_job_hour_utc: 2,
            daily_job_minute_utc: 5,
            db_pool_size: 4,
        }
    }

    #[test]
    fn prunes_buckets_and_projection_before_today() {
        let conn = setup();
        bucket_registry::ensure_buckets(
            &conn,
            &["2026-02-01".to_string(), "2026-02-20".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();
        bucket_registry::bootstrap_baseline(
            &conn,
            "2026-02-01_19:00",
            &HashSet::new(),
            &HashSet::new(),
            0,
        )
        .unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let report = run(&conn, &test_config(), today, 1_000_000);

        assert_eq!(report.buckets_deleted, 1);
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM buckets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[test]
    fn never_deletes_unaggregated_sessions_even_past_retention() {
        let conn = setup();
        open_if_absent(&conn, "2020-01-01_19:00", "s", 1, 0).unwrap();
        close_open(&conn, "2020-01-01_19:00", "s", 100).unwrap();

        let today = NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();
        let report = run(&conn, &test_config(), today, 1_000_000);

        assert_eq!(report.sessions_deleted, 0);
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
