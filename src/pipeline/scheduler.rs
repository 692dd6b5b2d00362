//! Scheduler: the tick timer that dispatches Poll Workers, and the
//! once-daily sliding-window job. Grounded in the teacher's
//! `tokio::time::interval` tick-loop idiom (see `main.rs`'s polling tasks)
//! and `signals::wallet_analytics`'s `Semaphore` + `FuturesUnordered`
//! bounded fan-out for the per-tick dispatch.

use crate::pipeline::config::Config;
use crate::pipeline::db::DbPool;
use crate::pipeline::provider::ProviderRegistry;
use crate::pipeline::{aggregator, bucket_registry, poll_worker, retention};
use chrono::{Timelike, Utc};
use futures_util::stream::{FuturesUnordered, StreamExt};
use rusqlite::params;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// Stable identity for this process's lease holdership, distinct from
/// per-bucket holder ids so heartbeat/log lines can tell instances apart
/// in a multi-instance deployment.
fn instance_id() -> String {
    format!("sched-{}", uuid::Uuid::new_v4())
}

/// Runs forever: one tick every `config.tick_interval_seconds`, plus a
/// once-per-UTC-day rotation job gated by `last_run_date` so a restart mid-day
/// doesn't re-fire it.
pub async fn run(pool: DbPool, registry: ProviderRegistry, provider_id: &'static str, config: Config) {
    let holder = instance_id();
    info!(holder, "scheduler starting");

    let mut ticker = interval(Duration::from_secs(config.tick_interval_seconds));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_daily_run_date: Option<String> = None;

    loop {
        ticker.tick().await;

        let now = Utc::now();
        maybe_run_daily_job(&pool, &registry, provider_id, &config, now, &mut last_daily_run_date).await;

        if let Err(e) = run_tick(&pool, &registry, provider_id, &config, &holder).await {
            error!(error = %e, "scheduler tick failed");
        }

        if let Err(e) = record_heartbeat(&pool, &config).await {
            warn!(error = %e, "failed to record heartbeat");
        }
    }
}

/// One dispatch round: picks buckets whose cooldown has elapsed, bounded to
/// `max_concurrent_buckets` in flight at once.
async fn run_tick(
    pool: &DbPool,
    registry: &ProviderRegistry,
    provider_id: &'static str,
    config: &Config,
    holder: &str,
) -> anyhow::Result<()> {
    let Some(adapter) = registry.get(provider_id) else {
        anyhow::bail!("no adapter registered for provider_id {provider_id}");
    };

    let due = due_bucket_ids(pool, config).await?;
    if due.is_empty() {
        return Ok(());
    }

    let sem = Arc::new(Semaphore::new(config.max_concurrent_buckets));
    let mut futs: FuturesUnordered<_> = FuturesUnordered::new();

    for bucket_id in due {
        let sem = sem.clone();
        let pool = pool.clone();
        let adapter = adapter.clone();
        let party_sizes = config.party_sizes.clone();
        let dedupe_minutes = config.notified_dedupe_minutes;
        let holder = holder.to_string();

        futs.push(async move {
            let _permit = sem.acquire().await;
            let outcome = poll_worker::poll(&pool, adapter, &bucket_id, &party_sizes, dedupe_minutes, &holder).await;
            (bucket_id, outcome)
        });
    }

    let mut baseline_echo_total = 0i64;
    let mut prev_echo_total = 0i64;

    while let Some((bucket_id, outcome)) = futs.next().await {
        match outcome {
            Ok(poll_worker::PollOutcome::Applied { invariants, .. }) => {
                baseline_echo_total += invariants.baseline_echo as i64;
                prev_echo_total += invariants.prev_echo as i64;
                info!(bucket_id, "poll complete");
            }
            Ok(o) => info!(bucket_id, outcome = ?o, "poll complete"),
            Err(e) => warn!(bucket_id, error = %e, "poll worker errored"),
        }
    }

    if baseline_echo_total != 0 || prev_echo_total != 0 {
        record_invariants(pool, baseline_echo_total, prev_echo_total).await?;
    }

    Ok(())
}

/// Buckets not scanned within the last `bucket_cooldown_seconds`, oldest
/// first so a backlog drains in scan-age order rather than bucket_id order.
async fn due_bucket_ids(pool: &DbPool, config: &Config) -> anyhow::Result<Vec<String>> {
    let conn = pool.checkout().await?;
    let cutoff = Utc::now().timestamp() - config.bucket_cooldown_seconds;
    let mut stmt = conn.prepare(
        "SELECT bucket_id FROM buckets WHERE scanned_at IS NULL OR scanned_at < ?1
         ORDER BY scanned_at ASC",
    )?;
    let rows = stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?;
    rows.collect::<Result<_, _>>().map_err(Into::into)
}

/// Rotates the rolling window, runs the aggregator over everything older
/// than today, and prunes -- once per UTC calendar day, at
/// `daily_job_hour_utc:daily_job_minute_utc` or later.
async fn maybe_run_daily_job(
    pool: &DbPool,
    _registry: &ProviderRegistry,
    _provider_id: &'static str,
    config: &Config,
    now: chrono::DateTime<Utc>,
    last_run_date: &mut Option<String>,
) {
    let today = now.date_naive();
    let today_str = today.format("%Y-%m-%d").to_string();

    let past_trigger_time =
        now.hour() > config.daily_job_hour_utc || (now.hour() == config.daily_job_hour_utc && now.minute() >= config.daily_job_minute_utc);

    if !past_trigger_time || last_run_date.as_deref() == Some(today_str.as_str()) {
        return;
    }

    match run_daily_job(pool, config, today).await {
        Ok(report) => {
            info!(date = %today_str, ?report, "daily job complete");
            *last_run_date = Some(today_str);
        }
        Err(e) => error!(error = %e, "daily job failed, will retry next tick"),
    }
}

#[derive(Debug)]
struct DailyJobReport {
    buckets_created: usize,
    sessions_aggregated: usize,
    retention: retention::RetentionReport,
}

async fn run_daily_job(pool: &DbPool, config: &Config, today: chrono::NaiveDate) -> anyhow::Result<DailyJobReport> {
    let conn = pool.checkout().await?;

    let date_range = bucket_registry::rolling_date_range(today, config.window_days);
    let buckets_created = bucket_registry::ensure_buckets(&conn, &date_range, &config.time_slots)?;

    let cutoff_bucket_id = format!("{}_", today.format("%Y-%m-%d"));
    let as_of_date = (today - chrono::Duration::days(1)).format("%Y-%m-%d").to_string();
    let sessions_aggregated = aggregator::run(&conn, &cutoff_bucket_id, &as_of_date, now_unix())?;

    let retention_report = retention::run(&conn, config, today, now_unix());

    Ok(DailyJobReport {
        buckets_created,
        sessions_aggregated,
        retention: retention_report,
    })
}

fn now_unix() -> i64 {
    Utc::now().timestamp()
}

async fn record_heartbeat(pool: &DbPool, config: &Config) -> anyhow::Result<()> {
    let conn = pool.checkout().await?;
    let now = now_unix();
    let next_tick_at = now + config.tick_interval_seconds as i64;
    conn.execute(
        "UPDATE job_heartbeat SET last_tick_at = ?1, next_tick_at = ?2 WHERE id = 1",
        params![now, next_tick_at],
    )?;
    Ok(())
}

/// Accumulates per-tick invariant counts into the heartbeat row so `health`
/// reports a running total rather than only the last tick's numbers.
pub async fn record_invariants(pool: &DbPool, baseline_echo: i64, prev_echo: i64) -> anyhow::Result<()> {
    let conn = pool.checkout().await?;
    conn.execute(
        "UPDATE job_heartbeat SET baseline_echo_total = baseline_echo_total + ?1,
                                   prev_echo_total = prev_echo_total + ?2
         WHERE id = 1",
        params![baseline_echo, prev_echo],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::model::NormalizedSlot;

    fn test_config() -> Config {
        Config {
            database_path: ":memory:".to_string(),
            window_days: 3,
            time_slots: vec!["19:00".to_string()],
            party_sizes: vec![2],
            max_concurrent_buckets: 4,
            bucket_cooldown_seconds: 30,
            tick_interval_seconds: 30,
            provider_per_page: 50,
            provider_max_pages: 3,
            provider_timeout_seconds: 12,
            notified_dedupe_minutes: 30,
            stale_bucket_hours: 4,
            event_retention_days: 14,
            session_retention_days: 60,
            metrics_retention_days: 90,
            provider_api_key: "k".to_string(),
            daily_job_hour_utc: 2,
            daily_job_minute_utc: 5,
            db_pool_size: 4,
        }
    }

    #[tokio::test]
    async fn due_bucket_ids_excludes_recently_scanned() {
        let pool = DbPool::open_memory().unwrap();
        let conn = pool.checkout().await.unwrap();
        bucket_registry::ensure_buckets(
            &conn,
            &["2026-02-18".to_string()],
            &["19:00".to_string(), "20:30".to_string()],
        )
        .unwrap();
        bucket_registry::bootstrap_baseline(
            &conn,
            "2026-02-18_19:00",
            &Default::default(),
            &Default::default(),
            Utc::now().timestamp(),
        )
        .unwrap();
        drop(conn);

        let config = test_config();
        let due = due_bucket_ids(&pool, &config).await.unwrap();
        assert_eq!(due, vec!["2026-02-18_20:30".to_string()]);
    }

    #[tokio::test]
    async fn daily_job_creates_buckets_and_runs_retention() {
        let pool = DbPool::open_memory().unwrap();
        let config = test_config();
        let today = chrono::NaiveDate::from_ymd_opt(2026, 2, 18).unwrap();

        let report = run_daily_job(&pool, &config, today).await.unwrap();
        assert_eq!(report.buckets_created, config.window_days as usize);

        let conn = pool.checkout().await.unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM buckets", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, config.window_days);
    }

    #[tokio::test]
    async fn tick_dispatch_bootstraps_all_due_buckets() {
        use crate::pipeline::error::PipelineError;
        use crate::pipeline::provider::ProviderAdapter;
        use async_trait::async_trait;

        struct EmptyAdapter;
        #[async_trait]
        impl ProviderAdapter for EmptyAdapter {
            fn provider_id(&self) -> &'static str {
                "seated"
            }
            async fn fetch(
                &self,
                _date_str: &str,
                _time_anchor: &str,
                _party_sizes: &[u32],
            ) -> Result<Vec<NormalizedSlot>, PipelineError> {
                Ok(Vec::new())
            }
        }

        let pool = DbPool::open_memory().unwrap();
        let conn = pool.checkout().await.unwrap();
        bucket_registry::ensure_buckets(
            &conn,
            &["2026-02-18".to_string()],
            &["19:00".to_string()],
        )
        .unwrap();
        drop(conn);

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(EmptyAdapter));
        let config = test_config();

        run_tick(&pool, &registry, "seated", &config, "test-holder").await.unwrap();

        let conn = pool.checkout().await.unwrap();
        let baseline: Option<String> = conn
            .query_row(
                "SELECT baseline_slot_ids FROM buckets WHERE bucket_id = '2026-02-18_19:00'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert!(baseline.is_some());
    }
}
