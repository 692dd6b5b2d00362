//! Runtime configuration for the discovery pipeline.
//!
//! Loaded once at boot from the environment (`.env` honored via `dotenv`).
//! Every field has a sane default so the service can start with an empty
//! environment in dev; the only thing that halts boot is a missing provider
//! credential (see `Config::from_env`).

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    pub window_days: i64,
    pub time_slots: Vec<String>,
    pub party_sizes: Vec<u32>,

    pub max_concurrent_buckets: usize,
    pub bucket_cooldown_seconds: i64,
    pub tick_interval_seconds: u64,

    pub provider_per_page: u32,
    pub provider_max_pages: u32,
    pub provider_timeout_seconds: u64,

    pub notified_dedupe_minutes: i64,
    pub stale_bucket_hours: i64,

    pub event_retention_days: i64,
    pub session_retention_days: i64,
    pub metrics_retention_days: i64,

    pub provider_api_key: String,

    pub daily_job_hour_utc: u32,
    pub daily_job_minute_utc: u32,

    pub db_pool_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./reservations.db".to_string());

        let window_days = std::env::var("WINDOW_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(14);

        let time_slots = std::env::var("TIME_SLOTS")
            .unwrap_or_else(|_| "15:00,19:00".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let party_sizes = std::env::var("PARTY_SIZES")
            .unwrap_or_else(|_| "2,4".to_string())
            .split(',')
            .filter_map(|s| s.trim().parse::<u32>().ok())
            .collect();

        let max_concurrent_buckets = std::env::var("MAX_CONCURRENT_BUCKETS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8);

        let bucket_cooldown_seconds = std::env::var("BUCKET_COOLDOWN_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(35);

        let tick_interval_seconds = std::env::var("TICK_INTERVAL_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let provider_per_page = std::env::var("PROVIDER_PER_PAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50);

        let provider_max_pages = std::env::var("PROVIDER_MAX_PAGES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3);

        let provider_timeout_seconds = std::env::var("PROVIDER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(12);

        let notified_dedupe_minutes = std::env::var("NOTIFIED_DEDUPE_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        let stale_bucket_hours = std::env::var("STALE_BUCKET_HOURS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4);

        let event_retention_days = std::env::var("EVENT_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(14);

        let session_retention_days = std::env::var("SESSION_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        let metrics_retention_days = std::env::var("METRICS_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(90);

        let provider_api_key = match std::env::var("PROVIDER_API_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => bail!("PROVIDER_API_KEY is required at boot"),
        };

        let daily_job_hour_utc = std::env::var("DAILY_JOB_HOUR_UTC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(2);

        let daily_job_minute_utc = std::env::var("DAILY_JOB_MINUTE_UTC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);

        let db_pool_size = std::env::var("DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(max_concurrent_buckets + 4);

        if window_days <= 0 {
            bail!("WINDOW_DAYS must be positive, got {}", window_days);
        }
        if time_slots.is_empty() {
            bail!("TIME_SLOTS must contain at least one anchor");
        }

        Ok(Self {
            database_path,
            window_days,
            time_slots,
            party_sizes,
            max_concurrent_buckets,
            bucket_cooldown_seconds,
            tick_interval_seconds,
            provider_per_page,
            provider_max_pages,
            provider_timeout_seconds,
            notified_dedupe_minutes,
            stale_bucket_hours,
            event_retention_days,
            session_retention_days,
            metrics_retention_days,
            provider_api_key,
            daily_job_hour_utc,
            daily_job_minute_utc,
            db_pool_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_fails_without_provider_key() {
        std::env::remove_var("PROVIDER_API_KEY");
        std::env::remove_var("DOTENV_NOT_REAL");
        // from_env will look for a .env file too; in the test sandbox none exists,
        // so this should fail purely on the missing env var.
        let result = Config::from_env();
        assert!(result.is_err());
    }
}
